//! Client-side login strategies.
//!
//! A [`LoginChain`] tries each configured strategy in order and stops at the
//! first one the server accepts:
//!
//! 1. Password (when the URI carries one)
//! 2. Every identity key, in the order given
//! 3. `none`, only when no credential was configured at all
//!
//! A strategy that errors is logged and skipped; the chain as a whole only
//! reports a generic [`Error::Authentication`].

use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use tracing::debug;

use super::client::ClientHandler;
use super::config::EndpointDescriptor;
use super::error::{Error, Result};

/// One way of proving the client's identity to the server.
#[async_trait]
pub(crate) trait LoginStrategy: Send + Sync {
    /// * `Ok(true)` - the server accepted the credential
    /// * `Ok(false)` - the server rejected it
    /// * `Err(_)` - the attempt could not be made
    async fn login(&self, handle: &mut client::Handle<ClientHandler>, user: &str) -> Result<bool>;

    fn name(&self) -> &'static str;
}

struct PasswordLogin {
    password: String,
}

#[async_trait]
impl LoginStrategy for PasswordLogin {
    async fn login(&self, handle: &mut client::Handle<ClientHandler>, user: &str) -> Result<bool> {
        let result = handle.authenticate_password(user, &self.password).await?;
        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

struct KeyLogin {
    key: Arc<PrivateKey>,
}

#[async_trait]
impl LoginStrategy for KeyLogin {
    async fn login(&self, handle: &mut client::Handle<ClientHandler>, user: &str) -> Result<bool> {
        // For RSA keys, use the best hash the server supports
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let key = PrivateKeyWithHashAlg::new(self.key.clone(), hash_alg);
        let result = handle.authenticate_publickey(user, key).await?;
        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "publickey"
    }
}

struct NoneLogin;

#[async_trait]
impl LoginStrategy for NoneLogin {
    async fn login(&self, handle: &mut client::Handle<ClientHandler>, user: &str) -> Result<bool> {
        let result = handle.authenticate_none(user).await?;
        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Ordered login strategies for one endpoint.
pub(crate) struct LoginChain {
    strategies: Vec<Box<dyn LoginStrategy>>,
}

impl LoginChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.strategies.push(Box::new(PasswordLogin {
            password: password.into(),
        }));
        self
    }

    pub fn with_key(mut self, key: Arc<PrivateKey>) -> Self {
        self.strategies.push(Box::new(KeyLogin { key }));
        self
    }

    pub fn with_none(mut self) -> Self {
        self.strategies.push(Box::new(NoneLogin));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    #[cfg(test)]
    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn for_endpoint(endpoint: &EndpointDescriptor) -> Self {
        let mut chain = Self::new();
        if let Some(password) = &endpoint.password {
            chain = chain.with_password(password.clone());
        }
        for key in &endpoint.identities {
            chain = chain.with_key(key.clone());
        }
        if chain.is_empty() {
            chain = chain.with_none();
        }
        chain
    }

    pub async fn login(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        user: &str,
    ) -> Result<()> {
        for strategy in &self.strategies {
            debug!("Trying login strategy: {}", strategy.name());
            match strategy.login(handle, user).await {
                Ok(true) => {
                    debug!("Login succeeded with strategy: {}", strategy.name());
                    return Ok(());
                }
                Ok(false) => debug!("Login rejected for strategy: {}", strategy.name()),
                Err(e) => debug!("Login error with strategy {}: {}", strategy.name(), e),
            }
        }
        Err(Error::Authentication)
    }
}
