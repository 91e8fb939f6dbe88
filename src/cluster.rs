//! Cluster access configuration and client construction
//!
//! A [`ClusterAccess`] pairs a kubeconfig path with a live API client.
//! The path is kept because generic manifest apply/delete goes through
//! kubectl, which needs `--kubeconfig`; everything typed goes through the
//! client.

use std::path::{Path, PathBuf};

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tracing::debug;

/// Errors constructing cluster access
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Failed to read kubeconfig {path}: {reason}")]
    KubeconfigRead { path: PathBuf, reason: String },

    #[error("Failed to build client from {path}: {reason}")]
    ClientBuild { path: PathBuf, reason: String },

    #[error("Failed to connect with ambient context: {0}")]
    AmbientContext(String),
}

/// Access configuration plus live API client for one cluster.
///
/// Immutable for the lifetime of the harness instance that owns it.
#[derive(Clone)]
pub struct ClusterAccess {
    /// Path to the kubeconfig file; passed through to kubectl operations.
    pub kubeconfig: PathBuf,
    /// Typed API client built from the same kubeconfig.
    pub client: Client,
}

impl ClusterAccess {
    /// Connect to the cluster a kubeconfig file describes.
    pub async fn connect(kubeconfig: impl Into<PathBuf>) -> Result<Self, ClusterError> {
        let kubeconfig = kubeconfig.into();

        let parsed =
            Kubeconfig::read_from(&kubeconfig).map_err(|e| ClusterError::KubeconfigRead {
                path: kubeconfig.clone(),
                reason: e.to_string(),
            })?;

        let config = kube::Config::from_custom_kubeconfig(parsed, &KubeConfigOptions::default())
            .await
            .map_err(|e| ClusterError::ClientBuild {
                path: kubeconfig.clone(),
                reason: e.to_string(),
            })?;

        let client = Client::try_from(config).map_err(|e| ClusterError::ClientBuild {
            path: kubeconfig.clone(),
            reason: e.to_string(),
        })?;

        debug!(kubeconfig = %kubeconfig.display(), "Connected to cluster");

        Ok(Self { kubeconfig, client })
    }

    /// Connect using the ambient context: `$KUBECONFIG` if set, otherwise
    /// `~/.kube/config`.
    pub async fn ambient() -> Result<Self, ClusterError> {
        let kubeconfig = ambient_kubeconfig_path()
            .ok_or_else(|| ClusterError::AmbientContext("no kubeconfig path found".to_string()))?;

        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::AmbientContext(e.to_string()))?;

        debug!(kubeconfig = %kubeconfig.display(), "Connected with ambient context");

        Ok(Self { kubeconfig, client })
    }

    /// The kubeconfig path as a string for command-line consumers.
    pub fn kubeconfig_str(&self) -> String {
        self.kubeconfig.display().to_string()
    }
}

impl std::fmt::Debug for ClusterAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterAccess")
            .field("kubeconfig", &self.kubeconfig)
            .finish_non_exhaustive()
    }
}

fn ambient_kubeconfig_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KUBECONFIG") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var("HOME")
        .ok()
        .map(|home| Path::new(&home).join(".kube").join("config"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_missing_kubeconfig_fails_with_path() {
        let err = ClusterAccess::connect("/nonexistent/kubeconfig")
            .await
            .expect_err("missing kubeconfig should fail");

        assert!(err.to_string().contains("/nonexistent/kubeconfig"));
    }

    #[tokio::test]
    async fn test_connect_unparseable_kubeconfig_fails() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let path = dir.path().join("bad.kubeconfig");
        std::fs::write(&path, "not: [valid: kubeconfig").expect("Should write file");

        let err = ClusterAccess::connect(&path)
            .await
            .expect_err("unparseable kubeconfig should fail");

        assert!(err.to_string().contains("bad.kubeconfig"));
    }
}
