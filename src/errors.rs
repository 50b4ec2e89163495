use thiserror::Error;

use crate::restore::report::Stage;

/// Service codes the control plane returns when the instance does not exist.
const NOT_FOUND_CODES: &[&str] = &["DBInstanceNotFound", "DBInstanceNotFoundFault"];

/// Service codes worth another poll rather than giving up.
const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "ServiceUnavailable",
    "InternalFailure",
];

/// Failure of a single control-plane call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlPlaneError {
    /// The control plane answered with a structured service error.
    #[error("{operation} rejected by RDS ({}): {message}", .code.as_deref().unwrap_or("no code"))]
    Service {
        operation: &'static str,
        code: Option<String>,
        message: String,
    },

    /// The request never produced a service response (dispatch, timeout, bad response).
    #[error("{operation} transport failure: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },
}

impl ControlPlaneError {
    pub fn code(&self) -> Option<&str> {
        match self {
            ControlPlaneError::Service { code, .. } => code.as_deref(),
            ControlPlaneError::Transport { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code().is_some_and(|c| NOT_FOUND_CODES.contains(&c))
    }

    /// Throttling and transport failures are retried by the barriers.
    pub fn is_transient(&self) -> bool {
        match self {
            ControlPlaneError::Transport { .. } => true,
            ControlPlaneError::Service { code, .. } => code
                .as_deref()
                .is_some_and(|c| TRANSIENT_CODES.contains(&c)),
        }
    }
}

/// Why a barrier stopped waiting.
#[derive(Error, Debug)]
pub enum WaitError {
    #[error("timed out waiting for {what} after {attempts} polls (last status: {last_status})")]
    Timeout {
        what: String,
        attempts: u32,
        last_status: String,
    },

    #[error("{what} reached failure state '{status}'")]
    FailureState { what: String, status: String },

    #[error("control plane error while waiting for {what}")]
    Api {
        what: String,
        #[source]
        source: ControlPlaneError,
    },

    #[error("wait for {what} cancelled")]
    Cancelled { what: String },
}

impl WaitError {
    /// Service code of the underlying control-plane failure, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            WaitError::Api { source, .. } => source.code(),
            _ => None,
        }
    }
}

/// Errors that abort a restore run.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("provisioning the restored instance failed")]
    Provision(#[source] ControlPlaneError),

    #[error("{stage} barrier failed")]
    Availability {
        stage: Stage,
        #[source]
        source: WaitError,
    },

    #[error("run cancelled during {0}")]
    Cancelled(Stage),
}
