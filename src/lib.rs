//! Tunneling proxy over SSH.
//!
//! The client side ([`proxy::Dialer`]) pools authenticated connections to
//! one endpoint and exposes outbound dial, remote listen and remote exec as
//! byte streams. The server side ([`proxy::ProxyServer`]) authenticates
//! incoming sessions and gates each request through per-principal
//! permissions.

pub mod proxy;
