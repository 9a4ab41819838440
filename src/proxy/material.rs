//! Loading of key material referenced from a connection URI.
//!
//! Query parameters come in `*_data` / `*_file` pairs: the data form is
//! URL-safe base64, the file form is a path where a leading `~` expands to
//! the current user's home directory. Empty values are skipped.

use std::path::{Path, PathBuf};

use data_encoding::{BASE64URL, BASE64URL_NOPAD};
use russh::keys::{self, Algorithm, PrivateKey, PublicKey};
use tracing::debug;

use super::error::{Error, Result};

/// Expand a leading `~` to the home directory. Paths are returned unchanged
/// when no home directory can be determined.
pub(crate) fn expand_home(path: &str) -> PathBuf {
    let Some(rest) = path.strip_prefix('~') else {
        return PathBuf::from(path);
    };
    match directories::BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(rest.trim_start_matches(['/', '\\'])),
        None => PathBuf::from(path),
    }
}

/// Decode one `*_data` value.
pub(crate) fn decode_data(value: &str) -> Result<Vec<u8>> {
    BASE64URL
        .decode(value.as_bytes())
        .or_else(|_| BASE64URL_NOPAD.decode(value.as_bytes()))
        .map_err(|e| Error::config(format!("invalid base64 data: {}", e)))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::config(format!("cannot read {:?}: {}", path, e)))
}

/// Collect the blobs named by a `*_data` / `*_file` parameter pair, data first.
pub(crate) fn load_materials<'a>(
    datas: impl IntoIterator<Item = &'a str>,
    files: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    for data in datas.into_iter().filter(|s| !s.is_empty()) {
        out.push(decode_data(data)?);
    }
    for file in files.into_iter().filter(|s| !s.is_empty()) {
        out.push(read_file(&expand_home(file))?);
    }
    Ok(out)
}

/// Parse an OpenSSH (or PEM) private key. Passphrase-protected keys are not supported.
pub(crate) fn parse_private_key(bytes: &[u8]) -> Result<PrivateKey> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::config("private key is not valid UTF-8"))?;
    keys::decode_secret_key(text, None)
        .map_err(|e| Error::config(format!("invalid private key: {}", e)))
}

/// Parse `authorized_keys` content.
///
/// Each non-comment line must contain one base64 public key blob; option
/// prefixes and trailing comments are tolerated.
pub(crate) fn parse_authorized_keys(bytes: &[u8]) -> Result<Vec<PublicKey>> {
    let text = String::from_utf8_lossy(bytes);
    let mut out = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let key = line
            .split_whitespace()
            .find_map(|field| keys::parse_public_key_base64(field).ok())
            .ok_or_else(|| {
                Error::config(format!("authorized keys line {}: no public key", lineno + 1))
            })?;
        out.push(key);
    }
    Ok(out)
}

/// Fresh Ed25519 host key for servers started without one.
pub(crate) fn generate_host_key() -> Result<PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;

    debug!("Generating ephemeral Ed25519 host key");
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| Error::config(format!("host key generation failed: {}", e)))
}
