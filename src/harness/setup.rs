//! Deployment orchestration
//!
//! Setup walks a fixed sequence: ensure the namespace, apply the core
//! install manifest, optionally the admission validator and the sidecar
//! injector, then the addons, and finally confirm every deployment in the
//! system namespace rolled out. The first failure aborts setup; nothing is
//! rolled back mid-sequence, teardown handles whatever was applied.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, PostParams};
use kube::ResourceExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::cluster::ClusterAccess;
use crate::kubectl;
use crate::manifest::{self, ManifestGenerator, ADDONS_DIR, INSTALL_DIR, VALIDATOR_FILE};
use crate::wait::{ResourceState, WaitError};

use super::{HarnessError, TestEnv};

/// Name of the TLS secret the ingress serves with.
pub const INGRESS_SECRET_NAME: &str = "istio-ingress-certs";

/// Test certificates within the release tree.
const CERTS_DIR: &str = "tests/testdata/certs";

/// Service and secret name of the admission validator.
const VALIDATOR_SERVICE: &str = "istio-mixer-validator";

/// Release-tree script that creates the validator's signed serving cert.
const CERT_GEN_SCRIPT: &str = "install/kubernetes/webhook-create-signed-cert.sh";

/// Addons applied after the core install, in order.
const ADDONS: [&str; 1] = ["zipkin"];

/// Ceiling for all deployments in the system namespace to become ready.
const ROLLOUT_TIMEOUT: Duration = Duration::from_secs(240);
const ROLLOUT_POLL_INTERVAL: Duration = Duration::from_secs(1);

impl TestEnv {
    /// Deploy the mesh and wait for it to become ready.
    pub async fn setup(&self) -> Result<(), HarnessError> {
        if self.config.skip_setup {
            info!("Setup skipped, using existing deployment");
            return Ok(());
        }

        self.ensure_namespace().await?;
        self.apply_core().await?;
        if self.config.with_validator {
            self.apply_validator().await?;
        }
        if self.config.automatic_injection {
            self.apply_injector().await?;
        }
        self.apply_addons().await?;
        self.create_ingress_secret().await;
        if self.config.with_validator {
            self.provision_validator_cert().await?;
        }
        self.confirm_rollout().await?;

        info!(namespace = %self.namespace(), "Mesh deployment ready");
        Ok(())
    }

    async fn ensure_namespace(&self) -> Result<(), HarnessError> {
        create_namespace(&self.primary, self.namespace()).await?;
        if let Some(remote) = &self.remote {
            create_namespace(remote, self.namespace()).await?;
        }
        self.namespace_created.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Best effort: a missing cert tree or an existing secret is logged
    /// and does not fail setup.
    async fn create_ingress_secret(&self) {
        let certs = self.release_path(CERTS_DIR);
        let cert = tokio::fs::read(certs.join("cert.crt")).await;
        let key = tokio::fs::read(certs.join("cert.key")).await;
        let (cert, key) = match (cert, key) {
            (Ok(cert), Ok(key)) => (cert, key),
            _ => {
                warn!(dir = %certs.display(), "Ingress certificates not found, skipping TLS secret");
                return;
            }
        };

        let mut data = BTreeMap::new();
        data.insert("tls.crt".to_string(), ByteString(cert));
        data.insert("tls.key".to_string(), ByteString(key));
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(INGRESS_SECRET_NAME.to_string()),
                namespace: Some(self.system_namespace().to_string()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(data),
            ..Default::default()
        };

        let api: Api<Secret> =
            Api::namespaced(self.primary.client.clone(), self.system_namespace());
        match api.create(&PostParams::default(), &secret).await {
            Ok(_) => info!(secret = INGRESS_SECRET_NAME, "Created ingress TLS secret"),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                info!(secret = INGRESS_SECRET_NAME, "Ingress TLS secret already exists");
            }
            Err(e) => {
                warn!(secret = INGRESS_SECRET_NAME, error = %e, "Could not create ingress TLS secret");
            }
        }
    }

    async fn apply_core(&self) -> Result<(), HarnessError> {
        let file = manifest::core_install_file(self.config.cluster_wide, self.config.auth_enabled);
        let src = self.release_path(INSTALL_DIR).join(file);
        let dst = self.yaml_dir().join(file);

        ManifestGenerator::new(&self.config)
            .generate_core(&src, &dst)
            .await?;
        info!(file, "Applying core install manifest");
        kubectl::apply(&self.primary.kubeconfig, self.system_namespace(), &dst).await?;
        Ok(())
    }

    /// Older releases ship without the validator manifest; its absence is
    /// a skip, not a failure.
    async fn apply_validator(&self) -> Result<(), HarnessError> {
        let src = self.release_path(INSTALL_DIR).join(VALIDATOR_FILE);
        if !src.exists() {
            warn!(file = VALIDATOR_FILE, "Validator manifest not in this release, skipping");
            return Ok(());
        }

        let dst = self.yaml_dir().join(VALIDATOR_FILE);
        ManifestGenerator::new(&self.config)
            .generate_core(&src, &dst)
            .await?;
        info!(file = VALIDATOR_FILE, "Applying admission validator");
        kubectl::apply(&self.primary.kubeconfig, self.system_namespace(), &dst).await?;
        Ok(())
    }

    /// The deployed webhook serves nothing until its certificate secret
    /// exists; the release ships a script that signs and stores it.
    async fn provision_validator_cert(&self) -> Result<(), HarnessError> {
        let script = self.release_path(CERT_GEN_SCRIPT);
        info!(script = %script.display(), "Provisioning validator certificate");

        let output = Command::new(&script)
            .args(validator_cert_args(self.namespace()))
            .output()
            .await
            .map_err(|e| HarnessError::ValidatorCert(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(HarnessError::ValidatorCert(stderr));
        }
        Ok(())
    }

    async fn apply_injector(&self) -> Result<(), HarnessError> {
        let file = &self.config.sidecar_injector_file;
        let src = self.release_path(INSTALL_DIR).join(file);
        if !src.exists() {
            return Err(HarnessError::MissingReleaseFile(src.display().to_string()));
        }

        let dst = self.yaml_dir().join(file);
        ManifestGenerator::new(&self.config)
            .generate_injector(&src, &dst)
            .await?;
        info!(file = %file, "Applying sidecar injector");
        kubectl::apply(&self.primary.kubeconfig, self.system_namespace(), &dst).await?;
        Ok(())
    }

    async fn apply_addons(&self) -> Result<(), HarnessError> {
        for addon in ADDONS {
            let file = format!("{addon}.yaml");
            let src = self.release_path(ADDONS_DIR).join(&file);
            let dst = self.yaml_dir().join(&file);

            ManifestGenerator::new(&self.config)
                .generate_addon(&src, &dst)
                .await?;
            info!(addon, "Applying addon");
            kubectl::apply(&self.primary.kubeconfig, self.system_namespace(), &dst).await?;
        }
        Ok(())
    }

    /// Poll until every deployment in the system namespace reports all
    /// replicas ready, or fail with the last observed state.
    async fn confirm_rollout(&self) -> Result<(), HarnessError> {
        let api: Api<Deployment> =
            Api::namespaced(self.primary.client.clone(), self.system_namespace());
        let start = Instant::now();
        let mut last_state = "no deployments observed".to_string();

        while start.elapsed() < ROLLOUT_TIMEOUT {
            let deployments = api.list(&ListParams::default()).await?;
            let pending: Vec<String> = deployments
                .items
                .iter()
                .filter(|d| !deployment_ready(d))
                .map(|d| {
                    let name = d.metadata.name.as_deref().unwrap_or("<unnamed>");
                    format!("{}: {}", name, d.state_description())
                })
                .collect();

            if !deployments.items.is_empty() && pending.is_empty() {
                info!(
                    count = deployments.items.len(),
                    elapsed = ?start.elapsed(),
                    "All deployments rolled out"
                );
                return Ok(());
            }
            last_state = if pending.is_empty() {
                "no deployments observed".to_string()
            } else {
                pending.join("; ")
            };

            tokio::time::sleep(ROLLOUT_POLL_INTERVAL).await;
        }

        // Pod-level detail names the stuck container, not just the count.
        if let Some(pods) = self.pending_pod_states().await {
            last_state = format!("{last_state} | pods: {pods}");
        }

        Err(WaitError::new(
            format!("deployments in {}", self.system_namespace()),
            ROLLOUT_TIMEOUT,
            start.elapsed(),
        )
        .with_state(last_state)
        .into())
    }

    /// Best effort; a failed listing just leaves the timeout error
    /// without pod detail.
    async fn pending_pod_states(&self) -> Option<String> {
        let api: Api<Pod> =
            Api::namespaced(self.primary.client.clone(), self.system_namespace());
        let pods = api.list(&ListParams::default()).await.ok()?;
        describe_pods(&pods.items)
    }
}

fn validator_cert_args(namespace: &str) -> Vec<String> {
    vec![
        "--service".to_string(),
        VALIDATOR_SERVICE.to_string(),
        "--secret".to_string(),
        VALIDATOR_SERVICE.to_string(),
        "--namespace".to_string(),
        namespace.to_string(),
    ]
}

fn describe_pods(pods: &[Pod]) -> Option<String> {
    let states: Vec<String> = pods
        .iter()
        .map(|p| format!("{}: {}", p.name_any(), p.state_description()))
        .collect();
    if states.is_empty() {
        None
    } else {
        Some(states.join("; "))
    }
}

fn deployment_ready(deployment: &Deployment) -> bool {
    let want = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let status = match &deployment.status {
        Some(status) => status,
        None => return false,
    };
    status.unavailable_replicas.unwrap_or(0) == 0 && status.ready_replicas.unwrap_or(0) >= want
}

async fn create_namespace(cluster: &ClusterAccess, name: &str) -> Result<(), HarnessError> {
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    let api: Api<Namespace> = Api::all(cluster.client.clone());
    match api.create(&PostParams::default(), &namespace).await {
        Ok(_) => {
            info!(namespace = name, kubeconfig = %cluster.kubeconfig.display(), "Created namespace");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            info!(namespace = name, "Namespace already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};

    fn deployment(want: i32, ready: i32, unavailable: i32) -> Deployment {
        Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(want),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                ready_replicas: Some(ready),
                unavailable_replicas: Some(unavailable),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_deployment_ready_when_all_replicas_up() {
        assert!(deployment_ready(&deployment(2, 2, 0)));
    }

    #[test]
    fn test_deployment_not_ready_with_unavailable_replicas() {
        assert!(!deployment_ready(&deployment(2, 2, 1)));
    }

    #[test]
    fn test_deployment_not_ready_below_replica_count() {
        assert!(!deployment_ready(&deployment(3, 1, 0)));
    }

    #[test]
    fn test_deployment_without_status_is_not_ready() {
        let deployment = Deployment::default();
        assert!(!deployment_ready(&deployment));
    }

    #[test]
    fn test_describe_pods_names_stuck_containers() {
        use k8s_openapi::api::core::v1::{
            ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus,
        };

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("istio-pilot-abc".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "discovery".to_string(),
                    ready: false,
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some("ImagePullBackOff".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let detail = describe_pods(&[pod]).expect("should describe one pod");

        assert!(detail.contains("istio-pilot-abc"));
        assert!(detail.contains("phase=Pending"));
        assert!(detail.contains("ImagePullBackOff"));
    }

    #[test]
    fn test_describe_pods_empty_list_gives_no_detail() {
        assert_eq!(describe_pods(&[]), None);
    }

    #[test]
    fn test_validator_cert_args() {
        let args = validator_cert_args("t1");

        assert_eq!(
            args,
            vec![
                "--service",
                "istio-mixer-validator",
                "--secret",
                "istio-mixer-validator",
                "--namespace",
                "t1",
            ]
        );
    }

    #[tokio::test]
    #[ignore] // Requires real cluster
    async fn test_setup_and_teardown_round_trip() {
        use crate::config::TestConfig;
        use crate::harness::TestEnv;

        let config = TestConfig::new("setup-e2e").release_dir(
            std::env::var("MESHTEST_RELEASE_DIR").expect("MESHTEST_RELEASE_DIR must be set"),
        );
        let env = TestEnv::new(config).await.expect("Should resolve clusters");

        env.setup().await.expect("Should deploy mesh");
        env.teardown().await.expect("Should tear down mesh");
    }
}
