use std::fmt;

use async_trait::async_trait;
use russh::keys::PublicKey;

/// A credential offered by a connecting client.
#[derive(Clone, Copy)]
pub enum Credential<'a> {
    Password(&'a str),
    PublicKey(&'a PublicKey),
}

impl Credential<'_> {
    /// Method name as it appears in logs.
    pub fn method(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::PublicKey(_) => "publickey",
        }
    }
}

impl fmt::Debug for Credential<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::PublicKey(key) => f.debug_tuple("PublicKey").field(&key.algorithm()).finish(),
        }
    }
}

/// One unit of authentication policy.
///
/// Verifiers answer only for the credential kinds they understand and deny
/// everything else. They never fail: an unreadable backing file is a deny.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, principal: &str, credential: Credential<'_>) -> bool;

    fn name(&self) -> &'static str;
}
