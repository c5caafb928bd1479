//! Typed failure kinds raised by workers.
//!
//! Application code propagates `anyhow::Result`; these variants ride inside
//! the `anyhow::Error` so callers that care (the HTTP layer, tests) can
//! recover the kind with `downcast_ref`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    /// A hard host prerequisite is missing. Fatal to `setup()`.
    #[error("{message} ({hint})")]
    Prerequisite { message: String, hint: String },

    /// The active worker variant does not offer this operation.
    #[error("{operation} is not supported by the {worker} worker")]
    Capability {
        worker: &'static str,
        operation: &'static str,
    },

    /// Bridge, DHCP or NAT provisioning failed.
    #[error("network provisioning failed: {0}")]
    Provisioning(String),

    /// Decompression or destination write failed while flashing.
    #[error("flash failed: {0}")]
    Flash(String),
}

impl WorkerError {
    pub fn prerequisite(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Prerequisite {
            message: message.into(),
            hint: hint.into(),
        }
    }

    pub fn capability(worker: &'static str, operation: &'static str) -> Self {
        Self::Capability { worker, operation }
    }
}

/// Returns the typed kind carried by an `anyhow::Error`, if any.
pub fn worker_error(err: &anyhow::Error) -> Option<&WorkerError> {
    err.chain().find_map(|cause| cause.downcast_ref::<WorkerError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_capability_message() {
        let err = WorkerError::capability("manual", "captureScreen");
        assert_eq!(
            err.to_string(),
            "captureScreen is not supported by the manual worker"
        );
    }

    #[test]
    fn test_kind_survives_context() {
        let err: anyhow::Error = Err::<(), _>(WorkerError::Provisioning("no subnet".into()))
            .context("applying network configuration")
            .unwrap_err();

        assert!(matches!(
            worker_error(&err),
            Some(WorkerError::Provisioning(_))
        ));
        assert_eq!(
            format!("{:#}", err),
            "applying network configuration: network provisioning failed: no subnet"
        );
    }
}
