//! kubectl invocation
//!
//! Generated manifests hold many resource kinds across several API groups,
//! so applying and deleting them goes through `kubectl` with an explicit
//! kubeconfig rather than through typed API calls.

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, warn};

/// kubectl errors
#[derive(Debug, thiserror::Error)]
pub enum KubectlError {
    #[error("Failed to run kubectl: {0}")]
    Spawn(String),

    #[error("kubectl {verb} {file} failed: {stderr}")]
    Command {
        verb: String,
        file: String,
        stderr: String,
    },
}

/// Apply a manifest file in the given namespace.
pub async fn apply(kubeconfig: &Path, namespace: &str, file: &Path) -> Result<(), KubectlError> {
    run("apply", kubeconfig, namespace, file).await
}

/// Delete the resources defined by a manifest file. A manifest whose
/// resources are already gone is not an error.
pub async fn delete(kubeconfig: &Path, namespace: &str, file: &Path) -> Result<(), KubectlError> {
    match run("delete", kubeconfig, namespace, file).await {
        Ok(()) => Ok(()),
        Err(KubectlError::Command { ref stderr, .. }) if is_not_found(stderr) => {
            debug!(file = %file.display(), "Resources already deleted");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn run(
    verb: &str,
    kubeconfig: &Path,
    namespace: &str,
    file: &Path,
) -> Result<(), KubectlError> {
    debug!(verb, namespace, file = %file.display(), "Running kubectl");

    let output = Command::new("kubectl")
        .arg(verb)
        .arg("-f")
        .arg(file)
        .arg("-n")
        .arg(namespace)
        .arg("--kubeconfig")
        .arg(kubeconfig)
        .output()
        .await
        .map_err(|e| KubectlError::Spawn(e.to_string()))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    warn!(verb, file = %file.display(), stderr = %stderr, "kubectl failed");
    Err(KubectlError::Command {
        verb: verb.to_string(),
        file: file.display().to_string(),
        stderr,
    })
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("NotFound") || stderr.contains("not found")
}
