//! TLS material loading and rustls server configuration.
//!
//! The encrypted listener needs three PEM files: private key, certificate,
//! and intermediate chain. The bundle is either complete or absent: a missing
//! or unconfigured path disables the listener, it never fails startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::ServerConfig;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::TlsPaths;

/// A file existed but could not be read.
#[derive(Debug, Error)]
#[error("failed to read TLS {role} from {}: {source}", path.display())]
pub struct TlsError {
    pub role: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Raw PEM bytes of a complete TLS bundle.
#[derive(Clone)]
pub struct TlsMaterial {
    pub key: Vec<u8>,
    pub cert: Vec<u8>,
    pub chain: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("key", &"[REDACTED]")
            .field("cert_len", &self.cert.len())
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

impl TlsMaterial {
    /// Load the bundle named by `paths`.
    ///
    /// All three paths are checked before anything is read, and every missing
    /// one is logged. Returns `Ok(None)` if any is unset or missing.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError`] if a file exists but cannot be read.
    pub async fn load(paths: &TlsPaths) -> Result<Option<Self>, TlsError> {
        let files = [
            ("private key", paths.key.as_deref()),
            ("certificate", paths.cert.as_deref()),
            ("certificate chain", paths.chain.as_deref()),
        ];

        let mut complete = true;
        for (role, path) in files {
            if !present(role, path).await {
                complete = false;
            }
        }
        if !complete {
            info!("TLS material incomplete; encrypted listener disabled");
            return Ok(None);
        }

        let mut contents = Vec::with_capacity(files.len());
        for (role, path) in files {
            // Checked by `present` above.
            let Some(path) = path else { return Ok(None) };
            let bytes = tokio::fs::read(path).await.map_err(|source| TlsError {
                role,
                path: path.to_path_buf(),
                source,
            })?;
            contents.push(bytes);
        }
        let mut contents = contents.into_iter();
        Ok(Some(Self {
            key: contents.next().unwrap_or_default(),
            cert: contents.next().unwrap_or_default(),
            chain: contents.next().unwrap_or_default(),
        }))
    }

    /// Build the server configuration for this bundle.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        build_server_config(&self.key, &self.cert, &self.chain)
    }
}

async fn present(role: &str, path: Option<&Path>) -> bool {
    let Some(path) = path else {
        warn!(file = role, "TLS path not configured");
        return false;
    };
    match tokio::fs::try_exists(path).await {
        Ok(true) => true,
        Ok(false) => {
            warn!(file = role, path = %path.display(), "TLS file missing");
            false
        }
        Err(e) => {
            warn!(
                file = role,
                path = %path.display(),
                error = %e,
                "TLS file existence could not be checked"
            );
            false
        }
    }
}

/// Build a [`rustls::ServerConfig`] from PEM-encoded key, certificate, and
/// intermediate chain bytes. The served chain is the certificate followed by
/// the chain file's certificates. ALPN offers `h2` and `http/1.1`.
///
/// # Errors
///
/// Returns an error if any PEM cannot be parsed, or if rustls rejects the
/// configuration.
pub fn build_server_config(
    key_pem: &[u8],
    cert_pem: &[u8],
    chain_pem: &[u8],
) -> Result<Arc<ServerConfig>> {
    let mut certs = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse TLS certificate")?;
    if certs.is_empty() {
        anyhow::bail!("no certificate found in PEM data");
    }
    let chain = rustls_pemfile::certs(&mut std::io::BufReader::new(chain_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse TLS certificate chain")?;
    certs.extend(chain);

    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_pem))
        .context("failed to read TLS private key")?
        .context("no private key found in PEM data")?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to build rustls ServerConfig")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::path::Path;

    use crate::config::TlsPaths;

    /// PEM key and certificate for `localhost`.
    pub fn self_signed() -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        (cert.key_pair.serialize_pem(), cert.cert.pem())
    }

    /// Write the files selected by `present` (key, cert, chain) into `dir`
    /// and return paths for all three, existing or not.
    pub fn write_bundle(dir: &Path, present: [bool; 3]) -> TlsPaths {
        let (key, cert) = self_signed();
        let (_, chain) = self_signed();
        let files = [("key.pem", key), ("cert.pem", cert), ("chain.pem", chain)];
        let mut paths = Vec::new();
        for ((name, contents), write) in files.into_iter().zip(present) {
            let path = dir.join(name);
            if write {
                std::fs::write(&path, contents).unwrap();
            }
            paths.push(path);
        }
        TlsPaths {
            key: Some(paths[0].clone()),
            cert: Some(paths[1].clone()),
            chain: Some(paths[2].clone()),
        }
    }

    /// All eight presence combinations of the three files.
    pub fn combinations() -> impl Iterator<Item = [bool; 3]> {
        (0u8..8).map(|bits| [bits & 1 != 0, bits & 2 != 0, bits & 4 != 0])
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn rejects_empty_cert_pem() {
        let result = build_server_config(b"", b"", b"");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_garbage_pem() {
        let result = build_server_config(b"not a pem", b"also not a pem", b"");
        assert!(result.is_err());
    }

    #[test]
    fn builds_config_with_alpn() {
        let (key, cert) = self_signed();
        let (_, chain) = self_signed();
        let config =
            build_server_config(key.as_bytes(), cert.as_bytes(), chain.as_bytes()).unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[tokio::test]
    async fn bundle_is_complete_only_when_all_three_exist() {
        for present in combinations() {
            let dir = tempfile::tempdir().unwrap();
            let paths = write_bundle(dir.path(), present);
            let loaded = TlsMaterial::load(&paths).await.unwrap();
            assert_eq!(
                loaded.is_some(),
                present.iter().all(|p| *p),
                "presence {present:?}"
            );
        }
    }

    #[tokio::test]
    async fn unconfigured_paths_disable_tls() {
        let loaded = TlsMaterial::load(&TlsPaths::default()).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn unreadable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = write_bundle(dir.path(), [true, true, false]);
        // A directory exists but cannot be read as a file.
        let chain_dir = dir.path().join("chain.d");
        std::fs::create_dir(&chain_dir).unwrap();
        paths.chain = Some(chain_dir);
        assert!(TlsMaterial::load(&paths).await.is_err());
    }

    #[tokio::test]
    async fn loaded_bundle_builds_a_server_config() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_bundle(dir.path(), [true, true, true]);
        let material = TlsMaterial::load(&paths).await.unwrap().unwrap();
        assert!(material.server_config().is_ok());
    }
}
