//! Scripted in-memory transport for unit tests.
//!
//! [`MockConnector`] hands out [`MockTransport`]s that succeed by default.
//! Faults pushed with [`MockState::push_fault`] are consumed, one per
//! operation, by the next `open_direct` / `start_session` / `forward` call on
//! any transport of that connector. A transport fault also marks the
//! transport dead, like a reset connection would.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::error::{Error, Result};
use super::transport::{
    BoxedStream, Connector, ForwardedStream, RemoteForward, RemoteSession, RemoteTarget,
    SessionControl, SessionEvent, SessionEvents, Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    Transport,
    Protocol,
}

/// Remote end of one started command.
pub(crate) struct MockRemote {
    pub command: String,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub stdin: Mutex<Vec<u8>>,
    pub eof: AtomicBool,
    pub killed: AtomicBool,
    pub closed: AtomicBool,
}

impl MockRemote {
    pub fn send(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn stdin(&self) -> Vec<u8> {
        self.stdin.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub(crate) struct MockState {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub connect_delay: Mutex<Option<Duration>>,
    faults: Mutex<VecDeque<Fault>>,
    pub direct_peers: Mutex<Vec<(String, DuplexStream)>>,
    pub sessions: Mutex<Vec<Arc<MockRemote>>>,
    pub forwards: Mutex<Vec<(RemoteTarget, mpsc::Sender<ForwardedStream>)>>,
    pub cancelled_forwards: Mutex<Vec<RemoteTarget>>,
}

impl MockState {
    pub fn push_fault(&self, fault: Fault) {
        self.faults.lock().unwrap().push_back(fault);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn last_session(&self) -> Arc<MockRemote> {
        self.sessions.lock().unwrap().last().cloned().unwrap()
    }

    fn next_fault(&self) -> Option<Fault> {
        self.faults.lock().unwrap().pop_front()
    }
}

#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    pub state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&self) -> Result<MockTransport> {
        let delay = *self.state.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::connect("mock:22", "connection refused"));
        }
        let id = self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockTransport {
            id,
            state: self.state.clone(),
            dead: AtomicBool::new(false),
        })
    }

    fn endpoint(&self) -> String {
        "mock:22".to_string()
    }
}

pub(crate) struct MockTransport {
    pub id: usize,
    state: Arc<MockState>,
    dead: AtomicBool,
}

impl MockTransport {
    fn check(&self) -> Result<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection reset".to_string()));
        }
        match self.state.next_fault() {
            Some(Fault::Transport) => {
                self.dead.store(true, Ordering::SeqCst);
                Err(Error::Transport("connection reset".to_string()))
            }
            Some(Fault::Protocol) => Err(Error::Protocol("administratively prohibited".to_string())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_direct(&self, target: &RemoteTarget) -> Result<BoxedStream> {
        self.check()?;
        let (local, remote) = tokio::io::duplex(4096);
        self.state
            .direct_peers
            .lock()
            .unwrap()
            .push((target.to_string(), remote));
        Ok(Box::new(local))
    }

    async fn start_session(&self, command: &str) -> Result<RemoteSession> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let remote = Arc::new(MockRemote {
            command: command.to_string(),
            events: tx,
            stdin: Mutex::new(Vec::new()),
            eof: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.state.sessions.lock().unwrap().push(remote.clone());
        Ok(RemoteSession {
            events: Box::new(MockEvents { rx }),
            control: Arc::new(MockControl { remote }),
        })
    }

    async fn forward(&self, target: &RemoteTarget) -> Result<RemoteForward> {
        self.check()?;
        let bound = match target {
            RemoteTarget::Tcp { host, port: 0 } => RemoteTarget::tcp(host.as_str(), 40000),
            other => other.clone(),
        };
        let (tx, incoming) = mpsc::channel(8);
        self.state
            .forwards
            .lock()
            .unwrap()
            .push((bound.clone(), tx));
        Ok(RemoteForward {
            target: bound,
            incoming,
        })
    }

    async fn cancel_forward(&self, target: &RemoteTarget) -> Result<()> {
        self.state
            .cancelled_forwards
            .lock()
            .unwrap()
            .push(target.clone());
        Ok(())
    }

    async fn close(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }
}

struct MockEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

#[async_trait]
impl SessionEvents for MockEvents {
    async fn next(&mut self) -> SessionEvent {
        self.rx.recv().await.unwrap_or(SessionEvent::Closed)
    }
}

struct MockControl {
    remote: Arc<MockRemote>,
}

#[async_trait]
impl SessionControl for MockControl {
    async fn write(&self, data: &[u8]) -> Result<()> {
        self.remote.stdin.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn eof(&self) -> Result<()> {
        self.remote.eof.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn signal_kill(&self) -> Result<()> {
        self.remote.killed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.remote.closed.store(true, Ordering::SeqCst);
        self.remote.send(SessionEvent::Closed);
        Ok(())
    }
}
