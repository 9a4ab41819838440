use async_trait::async_trait;
use russh::keys::PublicKey;
use russh::keys::ssh_key::public::KeyData;

use super::traits::{Credential, Verifier};

/// Accepts any principal presenting one of a fixed set of public keys.
///
/// Keys are compared by key material only; comments are ignored.
pub struct StaticKeyVerifier {
    keys: Vec<KeyData>,
}

impl StaticKeyVerifier {
    pub fn new(keys: &[PublicKey]) -> Self {
        Self {
            keys: keys.iter().map(|key| key.key_data().clone()).collect(),
        }
    }
}

#[async_trait]
impl Verifier for StaticKeyVerifier {
    async fn verify(&self, _principal: &str, credential: Credential<'_>) -> bool {
        match credential {
            Credential::PublicKey(key) => self.keys.contains(key.key_data()),
            Credential::Password(_) => false,
        }
    }

    fn name(&self) -> &'static str {
        "authorized-keys"
    }
}
