//! Runtime queries against the deployed mesh
//!
//! Pod and ingress lookups are cached: app pods are listed once and
//! reused, and the ingress address is resolved exactly once with the
//! outcome latched, under the concurrency rules in [`super::cache`].

use std::collections::HashMap;

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, AttachParams, ListParams};
use kube::{Client, ResourceExt};
use tokio::io::AsyncReadExt;

use super::TestEnv;

/// Ingress service created by the core install manifest.
pub const INGRESS_SERVICE_NAME: &str = "istio-ingress";

/// Runtime query errors
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("No pods found for app {0}")]
    NoPods(String),

    #[error("Ingress discovery failed: {0}")]
    Ingress(String),

    #[error("Exec in pod {pod} failed: {reason}")]
    Exec { pod: String, reason: String },
}

impl TestEnv {
    /// App label → sorted pod names for the instance namespace.
    ///
    /// The first call lists pods carrying an `app` label; a non-empty
    /// result is cached. A failed or empty listing yields an empty map
    /// and the next call queries again.
    pub async fn app_pods(&self) -> HashMap<String, Vec<String>> {
        self.pods.get_or_fetch(|| self.fetch_app_pods()).await
    }

    async fn fetch_app_pods(&self) -> Result<HashMap<String, Vec<String>>, String> {
        let api: Api<Pod> = Api::namespaced(self.primary.client.clone(), self.namespace());
        let pods = api
            .list(&ListParams::default().labels("app"))
            .await
            .map_err(|e| e.to_string())?;
        Ok(group_app_pods(pods.items))
    }

    /// The base URL of the mesh ingress, resolved once per environment.
    ///
    /// Local clusters have no external load balancer, so the address is
    /// built from an ingress pod's host IP and the service node port;
    /// otherwise the load-balancer address is used.
    pub async fn ingress(&self) -> Result<String, QueryError> {
        let client = self.primary.client.clone();
        let namespace = self.system_namespace().to_string();
        let local = self.config.local_cluster;

        self.ingress
            .get_or_resolve(|| resolve_ingress(client, namespace, local))
            .await
            .map_err(QueryError::Ingress)
    }

    /// The proxy route table of an app, read by running the test client
    /// inside its first pod.
    pub async fn routes(&self, app: &str) -> Result<String, QueryError> {
        let pods = self.app_pods().await;
        let pod = pods
            .get(app)
            .and_then(|names| names.first())
            .cloned()
            .ok_or_else(|| QueryError::NoPods(app.to_string()))?;

        let exec_err = |reason: String| QueryError::Exec {
            pod: pod.clone(),
            reason,
        };

        let api: Api<Pod> = Api::namespaced(self.primary.client.clone(), self.namespace());
        let attach = AttachParams {
            container: Some("app".to_string()),
            stdout: true,
            stderr: false,
            ..Default::default()
        };
        let mut attached = api
            .exec(
                &pod,
                vec!["client", "-url", "http://localhost:15000/routes"],
                &attach,
            )
            .await
            .map_err(|e| exec_err(e.to_string()))?;

        let mut stdout = attached
            .stdout()
            .ok_or_else(|| exec_err("no stdout stream".to_string()))?;
        let mut output = String::new();
        stdout
            .read_to_string(&mut output)
            .await
            .map_err(|e| exec_err(e.to_string()))?;

        Ok(output)
    }
}

fn group_app_pods(pods: Vec<Pod>) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for pod in pods {
        if let Some(app) = pod.labels().get("app") {
            map.entry(app.clone()).or_default().push(pod.name_any());
        }
    }
    for names in map.values_mut() {
        names.sort();
    }
    map
}

async fn resolve_ingress(
    client: Client,
    namespace: String,
    local: bool,
) -> Result<String, String> {
    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
    let service = services
        .get(INGRESS_SERVICE_NAME)
        .await
        .map_err(|e| format!("cannot read service {INGRESS_SERVICE_NAME}: {e}"))?;

    if !local {
        return load_balancer_url(&service);
    }

    let node_port = ingress_node_port(&service)?;
    let pods: Api<Pod> = Api::namespaced(client, &namespace);
    let list = pods
        .list(&ListParams::default().labels("istio=ingress"))
        .await
        .map_err(|e| format!("cannot list ingress pods: {e}"))?;
    let host_ip = list
        .items
        .iter()
        .find_map(|p| p.status.as_ref().and_then(|s| s.host_ip.clone()))
        .ok_or_else(|| "no ingress pod with a host IP".to_string())?;

    Ok(format!("http://{host_ip}:{node_port}"))
}

fn load_balancer_url(service: &Service) -> Result<String, String> {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|i| i.ip.clone())
        .map(|ip| format!("http://{ip}"))
        .ok_or_else(|| "load balancer address not yet assigned".to_string())
}

fn ingress_node_port(service: &Service) -> Result<i32, String> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.iter().find(|p| p.port == 80))
        .and_then(|p| p.node_port)
        .ok_or_else(|| "ingress service has no node port for port 80".to_string())
}
