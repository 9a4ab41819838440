use tracing::{debug, info};

use super::directory::DirectoryKeyVerifier;
use super::key::StaticKeyVerifier;
use super::password::PasswordVerifier;
use super::traits::{Credential, Verifier};
use crate::proxy::config::ServerDescriptor;
use crate::proxy::error::{Error, Result};

/// Ordered verifiers; the first one to accept wins.
///
/// A chain with no verifiers is *open*: every principal gets in without a
/// credential. Setting `authenticate` closes an empty chain instead, so
/// nobody gets in.
pub struct AuthChain {
    verifiers: Vec<Box<dyn Verifier>>,
    authenticate: bool,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            verifiers: Vec::new(),
            authenticate: false,
        }
    }

    /// Build the chain a server descriptor asks for, in the fixed order
    /// password, static keys, home directories.
    pub fn from_descriptor(descriptor: &ServerDescriptor) -> Self {
        let mut chain = Self::new().require_authentication(descriptor.authenticate);
        if let (Some(user), Some(password)) = (&descriptor.user, &descriptor.password) {
            chain = chain.with_verifier(PasswordVerifier::new(user.clone(), password.clone()));
        }
        if !descriptor.authorized_keys.is_empty() {
            chain = chain.with_verifier(StaticKeyVerifier::new(&descriptor.authorized_keys));
        }
        if let Some(layout) = &descriptor.home {
            chain = chain.with_verifier(DirectoryKeyVerifier::new(layout.clone()));
        }
        info!(
            "Authentication: {}",
            if chain.is_open() {
                "disabled".to_string()
            } else {
                chain.names().join(", ")
            }
        );
        chain
    }

    /// Append a verifier; offers are tried in insertion order.
    pub fn with_verifier(mut self, verifier: impl Verifier + 'static) -> Self {
        self.verifiers.push(Box::new(verifier));
        self
    }

    /// With `true`, an empty chain rejects everyone instead of accepting
    /// every principal.
    pub fn require_authentication(mut self, authenticate: bool) -> Self {
        self.authenticate = authenticate;
        self
    }

    /// True when every principal is accepted without a credential.
    pub fn is_open(&self) -> bool {
        self.verifiers.is_empty() && !self.authenticate
    }

    /// Verifier names in consultation order, for logging.
    pub fn names(&self) -> Vec<&'static str> {
        self.verifiers.iter().map(|v| v.name()).collect()
    }

    /// Check one credential offer.
    ///
    /// Rejections are always the same [`Error::Authentication`], whichever
    /// verifier was consulted.
    pub async fn verify(&self, principal: &str, credential: Credential<'_>) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        for verifier in &self.verifiers {
            if verifier.verify(principal, credential).await {
                debug!(
                    "Principal {:?} accepted by {} ({})",
                    principal,
                    verifier.name(),
                    credential.method()
                );
                return Ok(());
            }
        }
        debug!(
            "Principal {:?} rejected ({})",
            principal,
            credential.method()
        );
        Err(Error::Authentication)
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}
