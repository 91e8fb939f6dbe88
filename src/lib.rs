//! Meshtest - Ephemeral service-mesh test environments
//!
//! Meshtest provisions a fresh Istio-style mesh deployment for end-to-end
//! test suites and tears it down afterwards. It resolves one or two target
//! clusters from a registry directory (or the ambient kubeconfig), rewrites
//! the release manifests for an isolated namespace, drives the deployment to
//! a confirmed rollout, and answers runtime queries about the running mesh.
//!
//! # Example
//!
//! ```no_run
//! use meshtest::{TestConfig, TestEnv};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     meshtest::telemetry::init_logging();
//!
//!     let config = TestConfig::new("smoke")
//!         .release_dir("/work/istio-release")
//!         .auth_enabled(true);
//!     let env = TestEnv::new(config).await?;
//!
//!     env.setup().await?;
//!     let ingress = env.ingress().await?;
//!     println!("mesh ingress at {ingress}");
//!
//!     // Your tests here...
//!
//!     env.teardown().await?;
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod harness;
pub mod kubectl;
pub mod manifest;
pub mod registry;
pub mod telemetry;
pub mod wait;

// Re-export commonly used types
pub use cluster::{ClusterAccess, ClusterError};
pub use config::{ImageRef, TestConfig, SYSTEM_NAMESPACE};
pub use harness::{HarnessError, QueryError, TestEnv};
pub use manifest::{ManifestError, ManifestGenerator};
pub use registry::{ClusterEntry, RegistryError, ResolvedClusters};
pub use wait::WaitError;
