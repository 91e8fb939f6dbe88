//! Test environment lifecycle
//!
//! `TestEnv` owns everything one end-to-end run needs: the resolved
//! clusters, a scratch directory for generated manifests, and the runtime
//! query caches. Setup, teardown, and the query accessors live in the
//! sibling modules and hang off `TestEnv`.

mod cache;
mod queries;
mod setup;
mod teardown;

pub use queries::{QueryError, INGRESS_SERVICE_NAME};
pub use setup::INGRESS_SECRET_NAME;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use tempfile::TempDir;
use tracing::info;

use crate::cluster::ClusterAccess;
use crate::config::TestConfig;
use crate::kubectl::KubectlError;
use crate::manifest::ManifestError;
use crate::registry::{self, RegistryError};
use crate::wait::WaitError;

use cache::{Latch, PodCache};

/// Harness lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Kubectl(#[from] KubectlError),

    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error(transparent)]
    RolloutTimeout(#[from] WaitError),

    #[error("Cannot prepare working directory: {0}")]
    WorkDir(String),

    #[error("Release file not found: {0}")]
    MissingReleaseFile(String),

    #[error("Validator certificate provisioning failed: {0}")]
    ValidatorCert(String),
}

/// One ephemeral mesh deployment and the clusters it runs on.
pub struct TestEnv {
    pub(crate) config: TestConfig,
    pub(crate) primary: ClusterAccess,
    pub(crate) remote: Option<ClusterAccess>,
    /// Scratch directory holding generated manifests; removed on drop.
    pub(crate) work_dir: TempDir,
    /// Set once the instance namespace has actually been created, so
    /// teardown never deletes a namespace it does not own.
    pub(crate) namespace_created: AtomicBool,
    pub(crate) pods: PodCache,
    pub(crate) ingress: Latch,
}

impl TestEnv {
    /// Resolve clusters and prepare the working directory.
    ///
    /// Nothing is deployed yet; call [`TestEnv::setup`] for that.
    pub async fn new(config: TestConfig) -> Result<Self, HarnessError> {
        let clusters = match &config.cluster_registry_dir {
            Some(dir) => registry::resolve(dir).await?,
            None => registry::resolve_ambient().await?,
        };

        let work_dir = tempfile::Builder::new()
            .prefix("meshtest-")
            .tempdir()
            .map_err(|e| HarnessError::WorkDir(e.to_string()))?;
        tokio::fs::create_dir_all(work_dir.path().join("yaml"))
            .await
            .map_err(|e| HarnessError::WorkDir(e.to_string()))?;

        info!(
            namespace = %config.namespace,
            cluster_wide = config.cluster_wide,
            auth = config.auth_enabled,
            multicluster = clusters.remote.is_some(),
            "Created test environment"
        );

        Ok(Self {
            config,
            primary: clusters.primary,
            remote: clusters.remote,
            work_dir,
            namespace_created: AtomicBool::new(false),
            pods: PodCache::new(),
            ingress: Latch::new(),
        })
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    /// The instance namespace applications deploy into.
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// The namespace the control plane lives in.
    pub fn system_namespace(&self) -> &str {
        self.config.system_namespace()
    }

    pub fn primary(&self) -> &ClusterAccess {
        &self.primary
    }

    pub fn remote(&self) -> Option<&ClusterAccess> {
        self.remote.as_ref()
    }

    /// Directory the generated manifests are written to.
    pub fn yaml_dir(&self) -> PathBuf {
        self.work_dir.path().join("yaml")
    }

    /// Resolve a path relative to the release tree.
    pub fn release_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.config.release_dir.join(rel)
    }
}

impl std::fmt::Debug for TestEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnv")
            .field("namespace", &self.config.namespace)
            .field("cluster_wide", &self.config.cluster_wide)
            .field("multicluster", &self.remote.is_some())
            .finish()
    }
}
