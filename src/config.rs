//! Configuration for a mesh test run
//!
//! One immutable [`TestConfig`] is built at startup and passed into the
//! harness constructor. Nothing here is read from ambient globals, so a
//! single process can drive several independent environments in parallel.
//!
//! # Example
//!
//! ```
//! use meshtest::config::TestConfig;
//!
//! let config = TestConfig::new("e2e-run-42")
//!     .auth_enabled(true)
//!     .proxy_image("gcr.io/mesh-testing", "2026-08-28")
//!     .pilot_image("gcr.io/mesh-testing", "2026-08-28")
//!     .mtls_excluded_service("kubernetes");
//! ```

use std::path::PathBuf;

/// Namespace the mesh control plane installs into when running cluster-wide.
pub const SYSTEM_NAMESPACE: &str = "istio-system";

/// Docker hub + tag pair for one mesh component image.
#[derive(Debug, Clone, Default)]
pub struct ImageRef {
    pub hub: String,
    pub tag: String,
}

impl ImageRef {
    /// An image override only takes effect when both coordinates are set.
    pub fn is_set(&self) -> bool {
        !self.hub.is_empty() && !self.tag.is_empty()
    }
}

/// Immutable configuration for one test environment.
///
/// Mirrors the flat option surface a CI job passes in: namespace, image
/// coordinates per component, feature toggles, and the cluster registry
/// location. Built once, then shared read-only for the process lifetime.
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Namespace for this run. Cluster-wide runs use [`SYSTEM_NAMESPACE`].
    pub namespace: String,

    /// Install the mTLS-enabled control plane variant.
    pub auth_enabled: bool,

    /// Install RBAC objects alongside the control plane.
    pub rbac_enabled: bool,

    /// Install into the shared system scope instead of a per-run namespace.
    pub cluster_wide: bool,

    /// The target is a local single-node cluster (minikube or similar);
    /// ingress cannot bind an external load balancer there.
    pub local_cluster: bool,

    /// Skip namespace creation and mesh deployment entirely.
    pub skip_setup: bool,

    /// Leave everything in place at teardown.
    pub skip_cleanup: bool,

    /// Deploy the automatic sidecar injector.
    pub automatic_injection: bool,

    /// Sidecar injector manifest file name within the release tree.
    pub sidecar_injector_file: String,

    /// Deploy the admission validator if the release ships it.
    pub with_validator: bool,

    /// Override for the image pull policy on every container.
    pub image_pull_policy: Option<String>,

    /// Directory of cluster-registry descriptors; `None` means ambient
    /// single-cluster context.
    pub cluster_registry_dir: Option<PathBuf>,

    /// Root of the release tree holding the base manifests.
    pub release_dir: PathBuf,

    /// Use a downloaded base release instead of locally built images.
    /// When set, per-component image rewrites are disabled.
    pub base_version: Option<String>,

    /// Services excluded from mTLS when auth is enabled.
    pub mtls_excluded_services: Vec<String>,

    pub mixer: ImageRef,
    pub pilot: ImageRef,
    pub proxy: ImageRef,
    pub ca: ImageRef,
}

impl TestConfig {
    /// Create a config for a per-run namespace named after `run_id`.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            namespace: run_id.into(),
            auth_enabled: false,
            rbac_enabled: true,
            cluster_wide: false,
            local_cluster: false,
            skip_setup: false,
            skip_cleanup: false,
            automatic_injection: false,
            sidecar_injector_file: "istio-sidecar-injector.yaml".to_string(),
            with_validator: false,
            image_pull_policy: None,
            cluster_registry_dir: None,
            release_dir: PathBuf::from("."),
            base_version: None,
            mtls_excluded_services: Vec::new(),
            mixer: ImageRef::default(),
            pilot: ImageRef::default(),
            proxy: ImageRef::default(),
            ca: ImageRef::default(),
        }
    }

    /// Create a cluster-wide config; the namespace is forced to the
    /// system namespace.
    pub fn cluster_wide() -> Self {
        let mut config = Self::new(SYSTEM_NAMESPACE);
        config.cluster_wide = true;
        config
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    pub fn auth_enabled(mut self, enabled: bool) -> Self {
        self.auth_enabled = enabled;
        self
    }

    pub fn rbac_enabled(mut self, enabled: bool) -> Self {
        self.rbac_enabled = enabled;
        self
    }

    pub fn local_cluster(mut self, local: bool) -> Self {
        self.local_cluster = local;
        self
    }

    pub fn skip_setup(mut self, skip: bool) -> Self {
        self.skip_setup = skip;
        self
    }

    pub fn skip_cleanup(mut self, skip: bool) -> Self {
        self.skip_cleanup = skip;
        self
    }

    pub fn automatic_injection(mut self, enabled: bool) -> Self {
        self.automatic_injection = enabled;
        self
    }

    pub fn sidecar_injector_file(mut self, file: impl Into<String>) -> Self {
        self.sidecar_injector_file = file.into();
        self
    }

    pub fn with_validator(mut self, enabled: bool) -> Self {
        self.with_validator = enabled;
        self
    }

    pub fn image_pull_policy(mut self, policy: impl Into<String>) -> Self {
        self.image_pull_policy = Some(policy.into());
        self
    }

    pub fn cluster_registry_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cluster_registry_dir = Some(dir.into());
        self
    }

    pub fn release_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.release_dir = dir.into();
        self
    }

    pub fn base_version(mut self, version: impl Into<String>) -> Self {
        self.base_version = Some(version.into());
        self
    }

    pub fn mtls_excluded_service(mut self, service: impl Into<String>) -> Self {
        self.mtls_excluded_services.push(service.into());
        self
    }

    pub fn mixer_image(mut self, hub: impl Into<String>, tag: impl Into<String>) -> Self {
        self.mixer = ImageRef {
            hub: hub.into(),
            tag: tag.into(),
        };
        self
    }

    pub fn pilot_image(mut self, hub: impl Into<String>, tag: impl Into<String>) -> Self {
        self.pilot = ImageRef {
            hub: hub.into(),
            tag: tag.into(),
        };
        self
    }

    pub fn proxy_image(mut self, hub: impl Into<String>, tag: impl Into<String>) -> Self {
        self.proxy = ImageRef {
            hub: hub.into(),
            tag: tag.into(),
        };
        self
    }

    pub fn ca_image(mut self, hub: impl Into<String>, tag: impl Into<String>) -> Self {
        self.ca = ImageRef {
            hub: hub.into(),
            tag: tag.into(),
        };
        self
    }

    /// Namespace the mesh system components run in for this config.
    pub fn system_namespace(&self) -> &str {
        if self.cluster_wide {
            SYSTEM_NAMESPACE
        } else {
            &self.namespace
        }
    }
}
