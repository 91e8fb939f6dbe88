//! Teardown and namespace lifecycle
//!
//! Teardown is idempotent and keeps going: every independent cleanup step
//! runs even when an earlier one failed, and the first error is reported
//! at the end. Resources that are already gone count as cleaned up.

use std::sync::atomic::Ordering;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::{Api, DeleteParams, ListParams};
use kube::ResourceExt;
use tracing::{error, info};

use crate::cluster::ClusterAccess;
use crate::kubectl;
use crate::manifest;

use super::{HarnessError, TestEnv};

/// Bounded wait for the namespace to disappear after deletion.
const DELETION_ATTEMPTS: u32 = 120;
const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(1);

impl TestEnv {
    /// Remove everything setup deployed.
    pub async fn teardown(&self) -> Result<(), HarnessError> {
        if self.config.skip_setup || self.config.skip_cleanup {
            info!("Teardown skipped");
            return Ok(());
        }
        if !self.namespace_created.load(Ordering::SeqCst) {
            info!("Namespace was never created, nothing to tear down");
            return Ok(());
        }

        let mut first_error: Option<HarnessError> = None;

        if self.config.automatic_injection {
            remember(&mut first_error, self.delete_injector().await);
        }

        if self.config.cluster_wide {
            remember(&mut first_error, self.delete_core().await);
        } else {
            remember(
                &mut first_error,
                delete_namespace(&self.primary, self.namespace()).await,
            );
            if let Some(remote) = &self.remote {
                remember(&mut first_error, delete_namespace(remote, self.namespace()).await);
            }
            remember(&mut first_error, self.sweep_cluster_rbac().await);
            self.confirm_namespace_gone().await;
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(namespace = %self.namespace(), "Teardown complete");
                Ok(())
            }
        }
    }

    /// The injector goes first so no new pods get sidecars injected while
    /// the rest of the mesh is being removed.
    async fn delete_injector(&self) -> Result<(), HarnessError> {
        let file = self.yaml_dir().join(&self.config.sidecar_injector_file);
        if !file.exists() {
            return Ok(());
        }
        info!(file = %self.config.sidecar_injector_file, "Deleting sidecar injector");
        kubectl::delete(&self.primary.kubeconfig, self.system_namespace(), &file).await?;
        Ok(())
    }

    async fn delete_core(&self) -> Result<(), HarnessError> {
        let name = manifest::core_install_file(self.config.cluster_wide, self.config.auth_enabled);
        let file = self.yaml_dir().join(name);
        if !file.exists() {
            return Ok(());
        }
        info!(file = name, "Deleting core install manifest");
        kubectl::delete(&self.primary.kubeconfig, self.system_namespace(), &file).await?;
        Ok(())
    }

    /// Cluster-scoped RBAC is not garbage-collected with the namespace.
    /// Matching on a namespace-name substring is approximate but mirrors
    /// how the install manifests name these resources.
    async fn sweep_cluster_rbac(&self) -> Result<(), HarnessError> {
        let client = &self.primary.client;
        sweep_cluster_scoped::<ClusterRole>(client, "clusterrole", self.namespace()).await?;
        sweep_cluster_scoped::<ClusterRoleBinding>(client, "clusterrolebinding", self.namespace())
            .await?;
        Ok(())
    }

    async fn confirm_namespace_gone(&self) {
        let api: Api<Namespace> = Api::all(self.primary.client.clone());
        let name = self.namespace().to_string();
        confirm_deletion(
            &format!("namespace/{name}"),
            DELETION_ATTEMPTS,
            DELETION_POLL_INTERVAL,
            || {
                let api = api.clone();
                let name = name.clone();
                async move {
                    matches!(api.get(&name).await, Err(kube::Error::Api(ae)) if ae.code == 404)
                }
            },
        )
        .await;
    }
}

fn remember(slot: &mut Option<HarnessError>, result: Result<(), HarnessError>) {
    if let Err(e) = result {
        error!(error = %e, "Teardown step failed");
        if slot.is_none() {
            *slot = Some(e);
        }
    }
}

async fn delete_namespace(cluster: &ClusterAccess, name: &str) -> Result<(), HarnessError> {
    let api: Api<Namespace> = Api::all(cluster.client.clone());
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            info!(namespace = name, kubeconfig = %cluster.kubeconfig.display(), "Deleting namespace");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            info!(namespace = name, "Namespace already gone");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn sweep_cluster_scoped<K>(
    client: &kube::Client,
    kind: &str,
    needle: &str,
) -> Result<(), HarnessError>
where
    K: kube::Resource<Scope = k8s_openapi::ClusterResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::all(client.clone());
    for item in api.list(&ListParams::default()).await?.items {
        let name = item.name_any();
        if !name.contains(needle) {
            continue;
        }
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!(kind, name = %name, "Deleted cluster-scoped resource"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Poll `is_gone` at a fixed interval for a bounded number of attempts.
/// Returns whether deletion was confirmed; running out of attempts is
/// logged as an error but never fails the caller.
async fn confirm_deletion<F, Fut>(
    resource: &str,
    attempts: u32,
    interval: Duration,
    mut is_gone: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for attempt in 1..=attempts {
        if is_gone().await {
            info!(resource, attempt, "Deletion confirmed");
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    error!(resource, attempts, "Deletion not confirmed, continuing anyway");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_confirm_deletion_succeeds_on_final_attempt() {
        let checks = AtomicU32::new(0);

        let confirmed = confirm_deletion("namespace/t1", 120, Duration::ZERO, || {
            let n = checks.fetch_add(1, Ordering::SeqCst) + 1;
            async move { n == 120 }
        })
        .await;

        assert!(confirmed);
        assert_eq!(checks.load(Ordering::SeqCst), 120);
    }

    #[tokio::test]
    async fn test_confirm_deletion_gives_up_without_failing() {
        let checks = AtomicU32::new(0);

        let confirmed = confirm_deletion("namespace/t1", 120, Duration::ZERO, || {
            checks.fetch_add(1, Ordering::SeqCst);
            async { false }
        })
        .await;

        assert!(!confirmed);
        assert_eq!(checks.load(Ordering::SeqCst), 120);
    }

    #[tokio::test]
    async fn test_confirm_deletion_stops_early_once_gone() {
        let checks = AtomicU32::new(0);

        let confirmed = confirm_deletion("namespace/t1", 120, Duration::ZERO, || {
            let n = checks.fetch_add(1, Ordering::SeqCst) + 1;
            async move { n >= 3 }
        })
        .await;

        assert!(confirmed);
        assert_eq!(checks.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_remember_keeps_first_error() {
        let mut slot = None;

        remember(&mut slot, Ok(()));
        assert!(slot.is_none());

        remember(
            &mut slot,
            Err(HarnessError::WorkDir("disk full".to_string())),
        );
        remember(
            &mut slot,
            Err(HarnessError::WorkDir("second failure".to_string())),
        );

        let err = slot.expect("first error should be kept");
        assert!(err.to_string().contains("disk full"));
    }
}
