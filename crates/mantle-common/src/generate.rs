//! Generate-once material for new clusters
//!
//! Everything here is random and is produced exactly once, when the
//! cluster document is first created. Later stages only ever read the
//! persisted values, which keeps install artifacts reproducible.

use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature::{Ed25519KeyPair, KeyPair};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::Rng;

use crate::Error;

const LOWER_ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Longest cluster name prefix kept in the infrastructure slug
const SLUG_PREFIX_MAX: usize = 27;

/// Random string over `[a-z0-9]`
pub fn random_lower_alnum(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| LOWER_ALNUM[rng.gen_range(0..LOWER_ALNUM.len())] as char)
        .collect()
}

/// Storage account suffix: five lowercase alphanumerics
pub fn storage_suffix() -> String {
    random_lower_alnum(5)
}

/// Infrastructure slug: truncated cluster name plus a random tag
pub fn cluster_slug(name: &str) -> String {
    let prefix: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(SLUG_PREFIX_MAX)
        .collect::<String>()
        .to_lowercase();
    format!("{}-{}", prefix.trim_end_matches('-'), random_lower_alnum(5))
}

/// Admin password in `xxxxx-xxxxx-xxxxx-xxxxx` form
pub fn kubeadmin_password() -> String {
    (0..4)
        .map(|_| random_lower_alnum(5))
        .collect::<Vec<_>>()
        .join("-")
}

/// A freshly generated Ed25519 key, PKCS#8 encoded as base64
pub fn ssh_private_key() -> Result<String, Error> {
    let rng = SystemRandom::new();
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
        .map_err(|_| Error::internal_with_context("generate", "ssh key generation failed"))?;
    Ok(STANDARD.encode(pkcs8.as_ref()))
}

/// OpenSSH `authorized_keys` line for a stored private key
pub fn ssh_public_key(private_key_b64: &str) -> Result<String, Error> {
    let pkcs8 = STANDARD
        .decode(private_key_b64)
        .map_err(|e| Error::serialization_for_kind("ssh key", e.to_string()))?;
    let pair = Ed25519KeyPair::from_pkcs8(&pkcs8)
        .map_err(|e| Error::serialization_for_kind("ssh key", e.to_string()))?;

    // RFC 4253 wire format: string key type, string key bytes
    let algorithm = b"ssh-ed25519";
    let public = pair.public_key().as_ref();
    let mut blob = Vec::with_capacity(8 + algorithm.len() + public.len());
    for field in [&algorithm[..], public] {
        blob.extend_from_slice(&(field.len() as u32).to_be_bytes());
        blob.extend_from_slice(field);
    }
    Ok(format!("ssh-ed25519 {}", STANDARD.encode(blob)))
}
