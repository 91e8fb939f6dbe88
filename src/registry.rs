//! Cluster registry resolution
//!
//! A registry directory holds one YAML descriptor per cluster. Each
//! descriptor names the kubeconfig (access config) for that cluster and
//! marks whether the pilot control plane runs there:
//!
//! ```yaml
//! kind: Cluster
//! metadata:
//!   name: cluster-a
//!   annotations:
//!     config.istio.io/accessConfigFile: cluster-a.kubeconfig
//!     config.istio.io/pilotCfgStore: "true"
//! ```
//!
//! Exactly one descriptor must carry the pilot marker; it becomes the
//! primary cluster. Any other descriptors are remote clusters. Only a
//! single remote is supported: if several are present, the last one parsed
//! wins and a warning names the clusters that were discarded.
//!
//! Parsing ([`load_registry`]) is separate from client construction
//! ([`resolve`]) so descriptor handling can be tested without a cluster.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::cluster::{ClusterAccess, ClusterError};

const ACCESS_CONFIG_ANNOTATION: &str = "config.istio.io/accessConfigFile";
const PILOT_CFG_STORE_ANNOTATION: &str = "config.istio.io/pilotCfgStore";

/// Errors from registry resolution
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read registry directory {path}: {reason}")]
    DirectoryRead { path: PathBuf, reason: String },

    #[error("Failed to read descriptor {path}: {reason}")]
    DescriptorRead { path: PathBuf, reason: String },

    #[error("Failed to parse descriptor {path}: {reason}")]
    DescriptorParse { path: PathBuf, reason: String },

    #[error("Descriptor {path} is missing the {annotation} annotation")]
    MissingAnnotation { path: PathBuf, annotation: String },

    #[error("Registry {path} has no cluster marked as the pilot config store")]
    NoPilotCluster { path: PathBuf },

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    #[allow(dead_code)]
    kind: Option<String>,
    metadata: DescriptorMeta,
}

#[derive(Debug, Deserialize)]
struct DescriptorMeta {
    name: Option<String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

/// One parsed registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEntry {
    /// Cluster name from the descriptor metadata.
    pub name: String,
    /// Kubeconfig path, resolved relative to the registry directory.
    pub access_config: PathBuf,
    /// Whether the pilot control plane runs on this cluster.
    pub pilot: bool,
}

/// Primary plus optional remote cluster access.
#[derive(Debug, Clone)]
pub struct ResolvedClusters {
    pub primary: ClusterAccess,
    pub remote: Option<ClusterAccess>,
}

/// Parse every `.yaml`/`.yml` descriptor in a registry directory.
///
/// Any unreadable or unparseable descriptor fails the whole load; no
/// partial entry list is returned. Entries come back in file-name order so
/// "last parsed" is deterministic.
pub fn load_registry(dir: &Path) -> Result<Vec<ClusterEntry>, RegistryError> {
    let read_dir = std::fs::read_dir(dir).map_err(|e| RegistryError::DirectoryRead {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut paths: Vec<PathBuf> = read_dir
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml" | "yml")
            )
        })
        .collect();
    paths.sort();

    let mut entries = Vec::with_capacity(paths.len());
    for path in paths {
        let content =
            std::fs::read_to_string(&path).map_err(|e| RegistryError::DescriptorRead {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        let descriptor: Descriptor =
            serde_yaml::from_str(&content).map_err(|e| RegistryError::DescriptorParse {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        let access_config = descriptor
            .metadata
            .annotations
            .get(ACCESS_CONFIG_ANNOTATION)
            .ok_or_else(|| RegistryError::MissingAnnotation {
                path: path.clone(),
                annotation: ACCESS_CONFIG_ANNOTATION.to_string(),
            })?;

        let pilot = descriptor
            .metadata
            .annotations
            .get(PILOT_CFG_STORE_ANNOTATION)
            .is_some_and(|v| v == "true");

        entries.push(ClusterEntry {
            name: descriptor
                .metadata
                .name
                .unwrap_or_else(|| path.display().to_string()),
            access_config: dir.join(access_config),
            pilot,
        });
    }

    Ok(entries)
}

/// Resolve a registry directory into live cluster access.
///
/// The pilot-marked entry becomes the primary; at most one remote is kept
/// (last parsed wins, logged). Any client construction failure fails the
/// whole resolution.
pub async fn resolve(dir: &Path) -> Result<ResolvedClusters, RegistryError> {
    let entries = load_registry(dir)?;

    let primary_entry = entries
        .iter()
        .find(|e| e.pilot)
        .ok_or_else(|| RegistryError::NoPilotCluster {
            path: dir.to_path_buf(),
        })?
        .clone();

    let remotes: Vec<&ClusterEntry> = entries.iter().filter(|e| !e.pilot).collect();
    if remotes.len() > 1 {
        let discarded: Vec<&str> = remotes[..remotes.len() - 1]
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        warn!(
            kept = %remotes[remotes.len() - 1].name,
            discarded = ?discarded,
            "Multiple remote cluster descriptors found; only the last one parsed is used"
        );
    }
    let remote_entry = remotes.last().map(|e| (*e).clone());

    info!(
        primary = %primary_entry.name,
        remote = remote_entry.as_ref().map(|e| e.name.as_str()),
        "Resolved cluster registry"
    );

    let primary = ClusterAccess::connect(&primary_entry.access_config).await?;
    let remote = match remote_entry {
        Some(entry) => Some(ClusterAccess::connect(&entry.access_config).await?),
        None => None,
    };

    Ok(ResolvedClusters { primary, remote })
}

/// Resolve the ambient single-cluster context (no registry directory).
pub async fn resolve_ambient() -> Result<ResolvedClusters, RegistryError> {
    let primary = ClusterAccess::ambient().await?;
    Ok(ResolvedClusters {
        primary,
        remote: None,
    })
}
