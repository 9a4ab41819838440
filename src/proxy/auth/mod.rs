//! Server-side authentication.
//!
//! Each [`Verifier`] decides on one kind of credential. An [`AuthChain`]
//! asks them in a fixed order (password, static keys, per-principal key
//! files) and accepts on the first approval.

mod chain;
mod directory;
mod key;
mod password;
mod traits;

pub use chain::AuthChain;
pub use directory::DirectoryKeyVerifier;
pub use key::StaticKeyVerifier;
pub use password::PasswordVerifier;
pub use traits::{Credential, Verifier};
