//! russh-backed implementation of the transport boundary.
//!
//! ## Connection Lifecycle
//!
//! 1. **Dial**: open a TCP connection to the endpoint, or call the injected
//!    [`ProxyDial`] function when one was supplied.
//! 2. **Handshake**: run the SSH handshake over that stream with
//!    [`build_client_config`].
//! 3. **Login**: walk the endpoint's [`LoginChain`].
//!
//! All three steps share the endpoint's connect timeout. Any failure is
//! reported as [`Error::Connect`] (or [`Error::Authentication`]) and is never
//! retried by the dialer.
//!
//! ## Host Keys
//!
//! Server host keys are accepted without verification, like
//! `StrictHostKeyChecking=no` in OpenSSH.
//!
//! ## Remote Forwarding
//!
//! `forwarded-tcpip` and `forwarded-streamlocal@openssh.com` channels opened
//! by the server arrive at the connection's [`ClientHandler`], which routes
//! them by bound port (or socket path) to the [`RemoteForward`] that
//! requested it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use russh::client::{self, Msg};
use russh::{Channel, ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Disconnect, Sig, keys};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use super::config::{EndpointDescriptor, join_host_port};
use super::error::{Error, Result};
use super::login::LoginChain;
use super::transport::{
    BoxedStream, Connector, ForwardedStream, RemoteForward, RemoteSession, RemoteTarget,
    SessionControl, SessionEvent, SessionEvents, Transport,
};

/// Pending connections buffered per remote listener
const FORWARD_BACKLOG: usize = 64;

/// Dial function used instead of a direct TCP connection to the endpoint.
///
/// Receives the endpoint's `host:port`.
pub type ProxyDial =
    Arc<dyn Fn(String) -> BoxFuture<'static, std::io::Result<BoxedStream>> + Send + Sync>;

/// Key a forwarded channel is routed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Route {
    Port(u32),
    Socket(String),
}

impl Route {
    fn of(target: &RemoteTarget) -> Self {
        match target {
            RemoteTarget::Tcp { port, .. } => Route::Port(u32::from(*port)),
            RemoteTarget::Unix { path } => Route::Socket(path.clone()),
        }
    }
}

type ForwardRoutes = Arc<DashMap<Route, mpsc::Sender<ForwardedStream>>>;

/// Build the russh client configuration for pooled connections.
///
/// Pooled handles sit idle between operations, so there is no inactivity
/// timeout; dead peers are detected through keepalives (30s, max 3 missed).
pub(crate) fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Client handler for russh that accepts all host keys and routes
/// forwarded connections to their listener.
pub struct ClientHandler {
    routes: ForwardRoutes,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let listener = format!("{}:{}", connected_address, connected_port);
        self.route(
            Route::Port(connected_port),
            &listener,
            ForwardedStream {
                stream: Box::new(channel.into_stream()),
                originator: join_host_port(originator_address, originator_port as u16),
            },
        );
        Ok(())
    }

    async fn server_channel_open_forwarded_streamlocal(
        &mut self,
        channel: Channel<Msg>,
        socket_path: &str,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        self.route(
            Route::Socket(socket_path.to_string()),
            socket_path,
            ForwardedStream {
                stream: Box::new(channel.into_stream()),
                originator: socket_path.to_string(),
            },
        );
        Ok(())
    }
}

impl ClientHandler {
    fn route(&self, route: Route, listener: &str, forwarded: ForwardedStream) {
        let Some(tx) = self.routes.get(&route).map(|tx| tx.clone()) else {
            debug!("Dropping forwarded connection for unknown listener {}", listener);
            return;
        };
        if tx.try_send(forwarded).is_err() {
            debug!("Listener {} is not accepting, dropping connection", listener);
        }
    }
}

/// Opens authenticated russh connections to one endpoint.
pub struct SshConnector {
    endpoint: EndpointDescriptor,
    config: Arc<client::Config>,
    proxy_dial: Option<ProxyDial>,
}

impl SshConnector {
    pub fn new(endpoint: EndpointDescriptor) -> Self {
        Self {
            endpoint,
            config: build_client_config(),
            proxy_dial: None,
        }
    }

    pub fn with_proxy_dial(mut self, dial: ProxyDial) -> Self {
        self.proxy_dial = Some(dial);
        self
    }

    async fn handshake(
        &self,
        address: &str,
        handler: ClientHandler,
    ) -> Result<client::Handle<ClientHandler>> {
        let handle = match &self.proxy_dial {
            Some(dial) => {
                let stream = dial(address.to_string())
                    .await
                    .map_err(|e| Error::connect(address, e))?;
                client::connect_stream(self.config.clone(), stream, handler).await
            }
            None => {
                client::connect(
                    self.config.clone(),
                    (self.endpoint.host.as_str(), self.endpoint.port),
                    handler,
                )
                .await
            }
        };
        let mut handle = handle.map_err(|e| Error::connect(address, e))?;

        LoginChain::for_endpoint(&self.endpoint)
            .login(&mut handle, &self.endpoint.user)
            .await?;
        Ok(handle)
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Transport = SshTransport;

    async fn connect(&self) -> Result<SshTransport> {
        let address = self.endpoint.address();
        let timeout = self.endpoint.connect_timeout;
        let routes = ForwardRoutes::default();
        let handler = ClientHandler {
            routes: routes.clone(),
        };

        debug!("Connecting to {}@{}", self.endpoint.user, address);
        let handle = tokio::time::timeout(timeout, self.handshake(&address, handler))
            .await
            .map_err(|_| Error::connect(&address, format!("timed out after {:?}", timeout)))??;
        info!("Connected to {}@{}", self.endpoint.user, address);

        Ok(SshTransport {
            handle: Mutex::new(handle),
            routes,
            closed: AtomicBool::new(false),
            endpoint: address,
        })
    }

    fn endpoint(&self) -> String {
        self.endpoint.address()
    }
}

/// One live russh connection.
pub struct SshTransport {
    handle: Mutex<client::Handle<ClientHandler>>,
    routes: ForwardRoutes,
    closed: AtomicBool,
    endpoint: String,
}

fn session_event(msg: ChannelMsg) -> Option<SessionEvent> {
    match msg {
        ChannelMsg::Data { data } => Some(SessionEvent::Stdout(data.to_vec())),
        // ext == 1 is stderr in SSH protocol
        ChannelMsg::ExtendedData { data, ext: 1 } => Some(SessionEvent::Stderr(data.to_vec())),
        ChannelMsg::ExitStatus { exit_status } => Some(SessionEvent::ExitStatus(exit_status)),
        ChannelMsg::Eof => Some(SessionEvent::Eof),
        ChannelMsg::Close => Some(SessionEvent::Closed),
        _ => None,
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_direct(&self, target: &RemoteTarget) -> Result<BoxedStream> {
        let handle = self.handle.lock().await;
        let channel = match target {
            RemoteTarget::Tcp { host, port } => {
                handle
                    .channel_open_direct_tcpip(host.as_str(), u32::from(*port), "127.0.0.1", 0)
                    .await?
            }
            RemoteTarget::Unix { path } => {
                handle.channel_open_direct_streamlocal(path.as_str()).await?
            }
        };
        debug!(
            "Opened {} channel to {} via {}",
            target.network(),
            target,
            self.endpoint
        );
        Ok(Box::new(channel.into_stream()))
    }

    async fn start_session(&self, command: &str) -> Result<RemoteSession> {
        let mut channel = self.handle.lock().await.channel_open_session().await?;
        channel.exec(true, command).await?;

        // Output may race ahead of the exec reply
        let mut pending = VecDeque::new();
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => break,
                Some(ChannelMsg::Failure) => {
                    let _ = channel.close().await;
                    return Err(Error::Protocol(format!("exec refused: {}", command)));
                }
                Some(msg) => pending.extend(session_event(msg)),
                None => {
                    return Err(Error::Transport(
                        "session channel closed before exec reply".to_string(),
                    ));
                }
            }
        }

        let (read, write) = channel.split();
        Ok(RemoteSession {
            events: Box::new(SshSessionEvents {
                pending,
                read,
                done: false,
            }),
            control: Arc::new(SshSessionControl {
                write: Mutex::new(write),
            }),
        })
    }

    async fn forward(&self, target: &RemoteTarget) -> Result<RemoteForward> {
        let (tx, incoming) = mpsc::channel(FORWARD_BACKLOG);
        let mut handle = self.handle.lock().await;

        let bound = match target {
            RemoteTarget::Tcp { host, port } => {
                // Fixed ports can be routed before the reply arrives
                if *port != 0 {
                    self.routes.insert(Route::of(target), tx.clone());
                }
                match handle.tcpip_forward(host.as_str(), u32::from(*port)).await {
                    Ok(allocated) if *port == 0 => {
                        let allocated = u16::try_from(allocated).map_err(|_| {
                            Error::Protocol(format!("remote allocated invalid port {}", allocated))
                        })?;
                        RemoteTarget::tcp(host.as_str(), allocated)
                    }
                    Ok(_) => target.clone(),
                    Err(e) => {
                        self.routes.remove(&Route::of(target));
                        return Err(e.into());
                    }
                }
            }
            RemoteTarget::Unix { path } => {
                self.routes.insert(Route::of(target), tx.clone());
                if let Err(e) = handle.streamlocal_forward(path.as_str()).await {
                    self.routes.remove(&Route::of(target));
                    return Err(e.into());
                }
                target.clone()
            }
        };
        self.routes.insert(Route::of(&bound), tx);
        debug!(
            "Remote {} listener bound on {} via {}",
            bound.network(),
            bound,
            self.endpoint
        );

        Ok(RemoteForward {
            target: bound,
            incoming,
        })
    }

    async fn cancel_forward(&self, target: &RemoteTarget) -> Result<()> {
        self.routes.remove(&Route::of(target));
        let handle = self.handle.lock().await;
        match target {
            RemoteTarget::Tcp { host, port } => {
                handle
                    .cancel_tcpip_forward(host.as_str(), u32::from(*port))
                    .await?
            }
            RemoteTarget::Unix { path } => handle.cancel_streamlocal_forward(path.as_str()).await?,
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.routes.clear();
        let handle = self.handle.lock().await;
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Disconnect from {} failed: {}", self.endpoint, e);
        }
        debug!("Closed connection to {}", self.endpoint);
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        // A locked handle is in use and was alive a moment ago
        self.handle
            .try_lock()
            .map(|handle| handle.is_closed())
            .unwrap_or(false)
    }
}

struct SshSessionEvents {
    pending: VecDeque<SessionEvent>,
    read: ChannelReadHalf,
    done: bool,
}

#[async_trait]
impl SessionEvents for SshSessionEvents {
    async fn next(&mut self) -> SessionEvent {
        if let Some(event) = self.pending.pop_front() {
            self.done |= event == SessionEvent::Closed;
            return event;
        }
        while !self.done {
            match self.read.wait().await {
                Some(msg) => {
                    if let Some(event) = session_event(msg) {
                        self.done |= event == SessionEvent::Closed;
                        return event;
                    }
                }
                None => self.done = true,
            }
        }
        SessionEvent::Closed
    }
}

struct SshSessionControl {
    write: Mutex<ChannelWriteHalf<Msg>>,
}

#[async_trait]
impl SessionControl for SshSessionControl {
    async fn write(&self, data: &[u8]) -> Result<()> {
        self.write.lock().await.data(data).await?;
        Ok(())
    }

    async fn eof(&self) -> Result<()> {
        self.write.lock().await.eof().await?;
        Ok(())
    }

    async fn signal_kill(&self) -> Result<()> {
        self.write.lock().await.signal(Sig::KILL).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.write.lock().await.close().await?;
        Ok(())
    }
}
