//! Manifest generation
//!
//! Base manifests from the release tree are turned into instance-specific
//! manifests by an ordered pipeline of textual transformations: namespace
//! substitution, config-store scoping, mTLS exclusion patching, timing
//! compression, image and pull-policy rewrites, and a local-cluster
//! networking fixup. Each transformation is a named function taking and
//! returning manifest text so it can be tested on its own; the pipeline is
//! plain sequential application.
//!
//! Generated files are written atomically: full contents go to a temporary
//! sibling path which is then renamed over the destination, so readers
//! never observe partial output.

use std::path::Path;

use regex::{NoExpand, Regex};
use tracing::debug;

use crate::config::{TestConfig, SYSTEM_NAMESPACE};

/// Mesh install directory within a release tree.
pub const INSTALL_DIR: &str = "install/kubernetes";
/// Addon manifests directory within a release tree.
pub const ADDONS_DIR: &str = "install/kubernetes/addons";

/// Core install manifest, cluster-wide without auth.
pub const NON_AUTH_INSTALL_FILE: &str = "istio.yaml";
/// Core install manifest, cluster-wide with auth.
pub const AUTH_INSTALL_FILE: &str = "istio-auth.yaml";
/// Core install manifest, single namespace without auth.
pub const NON_AUTH_INSTALL_FILE_NAMESPACE: &str = "istio-one-namespace.yaml";
/// Core install manifest, single namespace with auth.
pub const AUTH_INSTALL_FILE_NAMESPACE: &str = "istio-one-namespace-auth.yaml";
/// Admission validator manifest; absent on older releases.
pub const VALIDATOR_FILE: &str = "istio-mixer-validator.yaml";

/// Anchor for the mesh-config mTLS exclusion list.
const MTLS_EXCLUDED_PATTERN: &str = r"mtlsExcludedServices:\s*\[(.*)\]";

/// Long default delays replaced with short ones to keep test runs bounded.
/// The second half covers the annotated copies inside the ingress pod spec.
const TIMING_REWRITES: [(&str, &str); 8] = [
    ("connectTimeout: 10s", "connectTimeout: 1s"),
    ("drainDuration: 45s", "drainDuration: 2s"),
    ("parentShutdownDuration: 1m0s", "parentShutdownDuration: 3s"),
    ("discoveryRefreshDelay: 30s", "discoveryRefreshDelay: 1s"),
    ("'30s' #discoveryRefreshDelay", "'1s' #discoveryRefreshDelay"),
    ("'10s' #connectTimeout", "'1s' #connectTimeout"),
    ("'45s' #drainDuration", "'2s' #drainDuration"),
    ("'1m0s' #parentShutdownDuration", "'3s' #parentShutdownDuration"),
];

/// Manifest generation errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Cannot read manifest {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Cannot write manifest {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("Failed to locate the mtlsExcludedServices section of the mesh config")]
    MissingMtlsAnchor,

    #[error("Invalid rewrite pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Select the core install file from the cluster-wide and auth toggles.
pub fn core_install_file(cluster_wide: bool, auth_enabled: bool) -> &'static str {
    match (cluster_wide, auth_enabled) {
        (true, true) => AUTH_INSTALL_FILE,
        (true, false) => NON_AUTH_INSTALL_FILE,
        (false, true) => AUTH_INSTALL_FILE_NAMESPACE,
        (false, false) => NON_AUTH_INSTALL_FILE_NAMESPACE,
    }
}

/// Replace every occurrence of the default system namespace with the
/// instance namespace.
pub fn replace_namespace(content: &str, namespace: &str) -> String {
    content.replace(SYSTEM_NAMESPACE, namespace)
}

/// Restrict the control plane's config-store watch to the instance
/// namespace by appending a query parameter to the store URL.
pub fn scope_config_store(content: &str, namespace: &str) -> String {
    let query: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("ns", namespace)
        .finish();
    content.replace(
        "--configStoreURL=k8s://",
        &format!("--configStoreURL=k8s://?{query}"),
    )
}

/// Append quoted service names to the `mtlsExcludedServices` list literal.
///
/// Accumulates: names already rendered into the list are kept, so applying
/// this twice with disjoint sets yields the union. Fails when the anchor is
/// absent but exclusions were requested.
pub fn append_mtls_exclusions(content: &str, excluded: &[String]) -> Result<String, ManifestError> {
    if excluded.is_empty() {
        return Ok(content.to_string());
    }

    let re = Regex::new(MTLS_EXCLUDED_PATTERN)?;
    let captures = re.captures(content).ok_or(ManifestError::MissingMtlsAnchor)?;
    let existing = captures.get(1).map_or("", |m| m.as_str());

    let mut values: Vec<String> = existing
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    for service in excluded {
        values.push(format!("\"{service}\""));
    }

    let rewritten = format!("mtlsExcludedServices: [{}]", values.join(","));
    Ok(re.replace_all(content, NoExpand(&rewritten)).into_owned())
}

/// Replace the enumerated long default delays with short test values.
pub fn compress_timings(content: &str) -> String {
    TIMING_REWRITES
        .iter()
        .fold(content.to_string(), |acc, (from, to)| acc.replace(from, to))
}

/// Rewrite the `image:` line for one module to `hub/module:tag`.
///
/// The pattern is anchored on the trailing module name so a rewrite for
/// `proxy` cannot touch the `proxy_init` image line.
pub fn update_image(
    content: &str,
    module: &str,
    hub: &str,
    tag: &str,
) -> Result<String, ManifestError> {
    let re = Regex::new(&format!("image: .*(/{}):.*", regex::escape(module)))?;
    let rewritten = format!("image: {hub}/{module}:{tag}");
    Ok(re.replace_all(content, NoExpand(&rewritten)).into_owned())
}

/// Rewrite every `imagePullPolicy:` line to the given policy.
pub fn update_image_pull_policy(content: &str, policy: &str) -> Result<String, ManifestError> {
    let re = Regex::new("imagePullPolicy:.*")?;
    let rewritten = format!("imagePullPolicy: {policy}");
    Ok(re.replace_all(content, NoExpand(&rewritten)).into_owned())
}

/// Switch the first `LoadBalancer` service to `NodePort`. Local clusters
/// cannot bind an external load balancer for the ingress.
pub fn use_node_port(content: &str) -> String {
    content.replacen("LoadBalancer", "NodePort", 1)
}

/// Rewrite an injector image field (`initImage:`, `proxyImage:`) for one
/// module. The injector template carries these outside `image:` lines.
pub fn update_inject_image(
    content: &str,
    field: &str,
    module: &str,
    hub: &str,
    tag: &str,
) -> Result<String, ManifestError> {
    let re = Regex::new(&format!(
        "{}: .*(/{}):.*",
        regex::escape(field),
        regex::escape(module)
    ))?;
    let rewritten = format!("{field}: {hub}/{module}:{tag}");
    Ok(re.replace_all(content, NoExpand(&rewritten)).into_owned())
}

/// Rewrite `version:` lines in the injector template.
pub fn update_inject_version(content: &str, version: &str) -> Result<String, ManifestError> {
    let re = Regex::new("version: .*")?;
    let rewritten = format!("version: {version}");
    Ok(re.replace_all(content, NoExpand(&rewritten)).into_owned())
}

/// Applies the transformation pipelines for one environment.
pub struct ManifestGenerator<'a> {
    config: &'a TestConfig,
}

impl<'a> ManifestGenerator<'a> {
    pub fn new(config: &'a TestConfig) -> Self {
        Self { config }
    }

    /// Full pipeline for the core install manifest (and the validator,
    /// which shares it).
    pub fn transform_core(&self, content: &str) -> Result<String, ManifestError> {
        let config = self.config;
        let mut content = content.to_string();

        if !config.cluster_wide {
            content = replace_namespace(&content, &config.namespace);
            content = scope_config_store(&content, &config.namespace);
        }

        if config.auth_enabled {
            content = append_mtls_exclusions(&content, &config.mtls_excluded_services)?;
        }

        content = compress_timings(&content);

        if config.base_version.is_none() {
            if config.mixer.is_set() {
                content = update_image(&content, "mixer", &config.mixer.hub, &config.mixer.tag)?;
            }
            if config.pilot.is_set() {
                content = update_image(&content, "pilot", &config.pilot.hub, &config.pilot.tag)?;
            }
            if config.proxy.is_set() {
                content = update_image(&content, "proxy", &config.proxy.hub, &config.proxy.tag)?;
            }
            if config.ca.is_set() {
                content = update_image(&content, "istio-ca", &config.ca.hub, &config.ca.tag)?;
            }
            if let Some(policy) = &config.image_pull_policy {
                content = update_image_pull_policy(&content, policy)?;
            }
        }

        if config.local_cluster {
            content = use_node_port(&content);
        }

        Ok(content)
    }

    /// Reduced pipeline for the sidecar injector manifest.
    pub fn transform_injector(&self, content: &str) -> Result<String, ManifestError> {
        let config = self.config;
        let mut content = content.to_string();

        if !config.cluster_wide {
            content = replace_namespace(&content, &config.namespace);
        }

        if config.pilot.is_set() {
            content = update_image(
                &content,
                "sidecar_injector",
                &config.pilot.hub,
                &config.pilot.tag,
            )?;
            content = update_inject_version(&content, &config.pilot.tag)?;
            content = update_inject_image(
                &content,
                "initImage",
                "proxy_init",
                &config.proxy.hub,
                &config.proxy.tag,
            )?;
            content = update_inject_image(
                &content,
                "proxyImage",
                "proxy",
                &config.proxy.hub,
                &config.proxy.tag,
            )?;
        }

        Ok(content)
    }

    /// Addon manifests only need the namespace substitution.
    pub fn transform_addon(&self, content: &str) -> String {
        if self.config.cluster_wide {
            content.to_string()
        } else {
            replace_namespace(content, &self.config.namespace)
        }
    }

    /// Read `src`, run the core pipeline, and write `dst` atomically.
    pub async fn generate_core(&self, src: &Path, dst: &Path) -> Result<(), ManifestError> {
        let content = read_manifest(src).await?;
        let transformed = self.transform_core(&content)?;
        write_manifest(dst, &transformed).await
    }

    /// Read `src`, run the injector pipeline, and write `dst` atomically.
    pub async fn generate_injector(&self, src: &Path, dst: &Path) -> Result<(), ManifestError> {
        let content = read_manifest(src).await?;
        let transformed = self.transform_injector(&content)?;
        write_manifest(dst, &transformed).await
    }

    /// Read `src`, run the addon pipeline, and write `dst` atomically.
    pub async fn generate_addon(&self, src: &Path, dst: &Path) -> Result<(), ManifestError> {
        let content = read_manifest(src).await?;
        let transformed = self.transform_addon(&content);
        write_manifest(dst, &transformed).await
    }
}

async fn read_manifest(path: &Path) -> Result<String, ManifestError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ManifestError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

/// Write the full contents to a temporary sibling, then rename into place.
/// Readers see either the complete file or nothing.
async fn write_manifest(path: &Path, content: &str) -> Result<(), ManifestError> {
    let tmp = path.with_extension("yaml.tmp");
    let write_err = |e: std::io::Error| ManifestError::Write {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    tokio::fs::write(&tmp, content).await.map_err(write_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(write_err)?;

    debug!(path = %path.display(), bytes = content.len(), "Wrote generated manifest");
    Ok(())
}
