//! Wait errors with debugging context
//!
//! When a rollout or deletion wait gives up, the error carries the resource
//! reference, the last state observed, and the elapsed/configured times, so
//! a failed run says what was still unhealthy rather than just "timed out".

use std::fmt;
use std::time::Duration;

/// Rich error for a wait that did not complete in time
#[derive(Debug, Clone)]
pub struct WaitError {
    /// Resource reference (e.g., "deployment/istio-pilot")
    pub resource: String,
    /// Description of the last observed state
    pub last_state: String,
    /// How long we waited before giving up
    pub elapsed: Duration,
    /// The timeout that was configured
    pub timeout: Duration,
}

impl WaitError {
    pub fn new(resource: impl Into<String>, timeout: Duration, elapsed: Duration) -> Self {
        Self {
            resource: resource.into(),
            last_state: "unknown".to_string(),
            elapsed,
            timeout,
        }
    }

    /// Set the last observed state
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.last_state = state.into();
        self
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "Wait timeout for {}", self.resource)?;
        writeln!(f, "├─ Last state: {}", self.last_state)?;
        writeln!(f, "├─ Elapsed: {:?}", self.elapsed)?;
        writeln!(f, "└─ Timeout: {:?}", self.timeout)?;
        Ok(())
    }
}

impl std::error::Error for WaitError {}

/// Human-readable state summaries for the resources the harness waits on
pub trait ResourceState {
    fn state_description(&self) -> String;
}

impl ResourceState for k8s_openapi::api::apps::v1::Deployment {
    fn state_description(&self) -> String {
        let spec_replicas = self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let ready = self
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        let available = self
            .status
            .as_ref()
            .and_then(|s| s.available_replicas)
            .unwrap_or(0);
        let unavailable = self
            .status
            .as_ref()
            .and_then(|s| s.unavailable_replicas)
            .unwrap_or(0);

        if unavailable > 0 {
            format!(
                "{}/{} ready, {} unavailable",
                ready, spec_replicas, unavailable
            )
        } else {
            format!(
                "{}/{} ready, {}/{} available",
                ready, spec_replicas, available, spec_replicas
            )
        }
    }
}

impl ResourceState for k8s_openapi::api::core::v1::Pod {
    fn state_description(&self) -> String {
        let phase = self
            .status
            .as_ref()
            .and_then(|s| s.phase.as_ref())
            .map(|s| s.as_str())
            .unwrap_or("Unknown");

        let containers = self
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref());

        match containers {
            Some(statuses) => {
                let total = statuses.len();
                let ready = statuses.iter().filter(|c| c.ready).count();

                let waiting_reasons: Vec<&str> = statuses
                    .iter()
                    .filter_map(|c| {
                        c.state
                            .as_ref()
                            .and_then(|s| s.waiting.as_ref())
                            .and_then(|w| w.reason.as_deref())
                    })
                    .collect();

                if !waiting_reasons.is_empty() {
                    format!(
                        "phase={}, containers {}/{} ready, waiting: {}",
                        phase,
                        ready,
                        total,
                        waiting_reasons.join(", ")
                    )
                } else {
                    format!("phase={}, containers {}/{} ready", phase, ready, total)
                }
            }
            None => format!("phase={}, no container status", phase),
        }
    }
}
