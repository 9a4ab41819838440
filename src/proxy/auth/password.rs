use async_trait::async_trait;

use super::traits::{Credential, Verifier};

/// Accepts exactly one principal with exactly one password.
pub struct PasswordVerifier {
    user: String,
    password: String,
}

impl PasswordVerifier {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl Verifier for PasswordVerifier {
    async fn verify(&self, principal: &str, credential: Credential<'_>) -> bool {
        match credential {
            Credential::Password(password) => principal == self.user && password == self.password,
            Credential::PublicKey(_) => false,
        }
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
