use async_trait::async_trait;
use tracing::debug;

use super::traits::{Credential, Verifier};
use crate::proxy::config::HomeDirLayout;
use crate::proxy::material;

/// Accepts a principal whose own authorized-keys file lists the offered key.
///
/// The file is read on every attempt so edits take effect immediately.
pub struct DirectoryKeyVerifier {
    layout: HomeDirLayout,
}

impl DirectoryKeyVerifier {
    pub fn new(layout: HomeDirLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl Verifier for DirectoryKeyVerifier {
    async fn verify(&self, principal: &str, credential: Credential<'_>) -> bool {
        let Credential::PublicKey(offered) = credential else {
            return false;
        };
        let Some(path) = self.layout.authorized_keys_path(principal) else {
            debug!("No authorized keys location for principal {:?}", principal);
            return false;
        };

        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) => {
                debug!("Cannot read {}: {}", path.display(), e);
                return false;
            }
        };
        match material::parse_authorized_keys(&contents) {
            Ok(keys) => keys.iter().any(|key| key.key_data() == offered.key_data()),
            Err(e) => {
                debug!("Cannot parse {}: {}", path.display(), e);
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "home-dir"
    }
}
