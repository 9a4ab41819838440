//! Remote command execution exposed as a stream.
//!
//! ## States
//!
//! ```text
//! Starting -> Running -> Completed -> Closed
//!                     \-> Cancelled -> Closed
//! ```
//!
//! - **Starting**: the session is opened and the quoted command line started.
//! - **Running**: two background tasks serve the stream. The *pump* moves
//!   command output into an in-process duplex pipe (stderr goes to this
//!   process's stderr, never into the stream) and caller writes into the
//!   command's stdin. The *teardown* task waits on the stream's
//!   cancellation scope.
//! - **Completed**: the remote session ended on its own; the pump cancels
//!   the scope.
//! - **Cancelled**: the scope fired first (stream closed or dropped, or the
//!   caller's token cancelled). A kill signal is sent as a best effort:
//!   OpenSSH and many other servers ignore signal requests, so the remote
//!   process may keep running until it notices its closed channel.
//! - **Closed**: teardown closed the session, joined the pump and dropped
//!   the pipe. Both tasks have exited once this state is published.
//!
//! Teardown is reachable from every trigger but runs exactly once, since it
//! is a single task waiting on a single token.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::stream::{TunnelAddr, TunnelStream};
use super::transport::{RemoteSession, SessionControl, SessionEvent, SessionEvents};

/// Capacity of the in-process pipe between the caller and the command.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Chunk size for stdin reads from the pipe.
const STDIN_CHUNK: usize = 32 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecState {
    Starting,
    Running,
    /// The command ended by itself. `exit_status` is absent when the server
    /// did not report one.
    Completed { exit_status: Option<u32> },
    Cancelled,
    Closed,
}

/// Join `name` and `args` into one command line, quoting each argument
/// separately so that whitespace and shell metacharacters survive intact.
pub fn command_line(name: &str, args: &[&str]) -> String {
    let mut line = String::from(name);
    for arg in args {
        line.push(' ');
        line.push_str(&shell_escape::unix::escape((*arg).into()));
    }
    line
}

/// Wire a started session to a new [`TunnelStream`] and spawn its tasks.
///
/// `scope` is the stream's cancellation scope; cancelling it (or dropping
/// the stream) tears the command down.
pub(crate) fn spawn(
    session: RemoteSession,
    command: &str,
    local: TunnelAddr,
    scope: CancellationToken,
) -> TunnelStream {
    let (state_tx, state_rx) = watch::channel(ExecState::Starting);
    let (caller_end, command_end) = tokio::io::duplex(PIPE_CAPACITY);

    let RemoteSession { events, control } = session;
    state_tx.send_replace(ExecState::Running);
    debug!("Command running: {}", command);

    let state_tx = Arc::new(state_tx);
    let pump = tokio::spawn(pump(
        events,
        control.clone(),
        command_end,
        state_tx.clone(),
        scope.clone(),
    ));
    tokio::spawn(teardown(
        control,
        pump,
        state_tx,
        scope.clone(),
        command.to_string(),
    ));

    TunnelStream::new(
        Box::new(caller_end),
        local,
        TunnelAddr::new("ssh-cmd", command),
        scope,
    )
    .with_state(state_rx)
}

async fn pump(
    mut events: Box<dyn SessionEvents>,
    control: Arc<dyn SessionControl>,
    pipe: DuplexStream,
    state: Arc<watch::Sender<ExecState>>,
    scope: CancellationToken,
) {
    let (mut from_caller, mut to_caller) = tokio::io::split(pipe);
    let mut stderr = tokio::io::stderr();
    let mut buf = vec![0u8; STDIN_CHUNK];
    let mut stdin_open = true;
    let mut exit_status = None;

    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            event = events.next() => match event {
                SessionEvent::Stdout(data) => {
                    let written = tokio::select! {
                        result = to_caller.write_all(&data) => result.is_ok(),
                        _ = scope.cancelled() => false,
                    };
                    if !written {
                        break;
                    }
                }
                SessionEvent::Stderr(data) => {
                    let _ = stderr.write_all(&data).await;
                }
                SessionEvent::ExitStatus(code) => exit_status = Some(code),
                SessionEvent::Eof => {
                    let _ = to_caller.shutdown().await;
                }
                SessionEvent::Closed => {
                    state.send_if_modified(|s| {
                        if *s == ExecState::Running {
                            *s = ExecState::Completed { exit_status };
                            true
                        } else {
                            false
                        }
                    });
                    scope.cancel();
                    break;
                }
            },
            read = from_caller.read(&mut buf), if stdin_open => match read {
                Ok(0) | Err(_) => {
                    stdin_open = false;
                    let _ = control.eof().await;
                }
                Ok(n) => {
                    if let Err(e) = control.write(&buf[..n]).await {
                        debug!("Command stdin closed: {}", e);
                        stdin_open = false;
                    }
                }
            },
        }
    }
}

async fn teardown(
    control: Arc<dyn SessionControl>,
    pump: tokio::task::JoinHandle<()>,
    state: Arc<watch::Sender<ExecState>>,
    scope: CancellationToken,
    command: String,
) {
    scope.cancelled().await;

    let cancelled = state.send_if_modified(|s| {
        if *s == ExecState::Running {
            *s = ExecState::Cancelled;
            true
        } else {
            false
        }
    });
    if cancelled {
        debug!("Command cancelled, sending KILL: {}", command);
        // Frequently ignored by the server; see module docs
        if let Err(e) = control.signal_kill().await {
            debug!("KILL not delivered: {}", e);
        }
    }

    if let Err(e) = control.close().await {
        debug!("Closing command session failed: {}", e);
    }
    if let Err(e) = pump.await {
        warn!("Command pump task failed: {}", e);
    }

    state.send_replace(ExecState::Closed);
    debug!("Command closed: {}", command);
}
