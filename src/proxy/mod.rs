//! SSH tunneling proxy.
//!
//! This module is organized into the following submodules:
//!
//! - `config`: Connection-URI parsing into endpoint and server descriptors
//! - `material`: Key material loading (inline base64, files, `~` expansion)
//! - `error`: Error kinds driving retry-vs-fail decisions
//! - `transport`: The boundary between pooling logic and the SSH library
//! - `client` / `login`: russh-backed transport and client login strategies
//! - `pool`: Bounded pool of authenticated connections
//! - `dialer`: `dial`, `listen` and `exec` over the pool
//! - `stream` / `exec` / `listener`: What the dialer hands back
//! - `auth` / `permissions`: Server-side authentication and authorization
//! - `server`: The proxy server itself
//! - `forward`: Byte relay used by the server

pub mod auth;
pub mod client;
pub mod config;
pub mod dialer;
pub mod error;
pub mod exec;
pub(crate) mod forward;
pub mod listener;
pub(crate) mod login;
pub(crate) mod material;
pub mod permissions;
pub mod pool;
pub mod server;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ProxyDial, SshConnector, SshTransport};
pub use config::{EndpointDescriptor, ServerDescriptor};
pub use dialer::Dialer;
pub use error::{Error, ErrorKind, Result};
pub use exec::ExecState;
pub use listener::RemoteListener;
pub use server::{ProxyServer, RunningServer};
pub use stream::{TunnelAddr, TunnelStream};
pub use transport::BoxedStream;
