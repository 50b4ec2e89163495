// rds-pitr-restore/src/restore/report.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RestoreParams;
use crate::rds::InstanceDescriptor;

/// The ordered stages of a restore run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Teardown,
    DeletionBarrier,
    Provision,
    AwaitProvisioned,
    Reconfigure,
    AwaitReconfigured,
    Restart,
    AwaitRestarted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Teardown => "teardown",
            Stage::DeletionBarrier => "deletion wait",
            Stage::Provision => "provision",
            Stage::AwaitProvisioned => "availability wait (provisioned)",
            Stage::Reconfigure => "reconfigure",
            Stage::AwaitReconfigured => "availability wait (reconfigured)",
            Stage::Restart => "restart",
            Stage::AwaitRestarted => "availability wait (restarted)",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed { detail: Option<String> },
    Skipped { reason: String },
    /// A failure the run carried on past (or the one that stopped it).
    Failed { message: String, code: Option<String> },
}

/// Renders an error together with its `source()` chain.
pub fn error_chain(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(message, ": {}", cause);
        source = cause.source();
    }
    message
}

impl StageOutcome {
    pub fn completed(detail: impl Into<String>) -> Self {
        StageOutcome::Completed {
            detail: Some(detail.into()),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        StageOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn failed(err: &dyn Error, code: Option<&str>) -> Self {
        StageOutcome::Failed {
            message: error_chain(err),
            code: code.map(str::to_string),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StageOutcome::Failed { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            StageOutcome::Completed { .. } => "completed",
            StageOutcome::Skipped { .. } => "skipped",
            StageOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    #[serde(flatten)]
    pub outcome: StageOutcome,
    pub elapsed_ms: u64,
}

/// Machine-readable result of a restore run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source_instance: String,
    pub target_instance: String,
    pub region: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub restore_time: Option<DateTime<Utc>>,
    pub stages: Vec<StageRecord>,
    pub final_instance: Option<InstanceDescriptor>,
}

impl RunReport {
    pub fn new(params: &RestoreParams, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source_instance: params.source_instance.clone(),
            target_instance: params.target_instance.clone(),
            region: params.region.clone(),
            started_at,
            finished_at: None,
            restore_time: None,
            stages: Vec::new(),
            final_instance: None,
        }
    }

    /// Appends a stage result and logs it.
    pub fn record(&mut self, stage: Stage, outcome: StageOutcome, elapsed: Duration) {
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        match &outcome {
            StageOutcome::Completed { detail } => {
                info!(run_id = %self.run_id, %stage, elapsed_ms, detail = detail.as_deref().unwrap_or(""), "✓ stage completed")
            }
            StageOutcome::Skipped { reason } => {
                info!(run_id = %self.run_id, %stage, reason = %reason, "stage skipped")
            }
            StageOutcome::Failed { message, code } => {
                warn!(run_id = %self.run_id, %stage, elapsed_ms, code = code.as_deref().unwrap_or(""), error = %message, "⚠️ stage failed")
            }
        }
        self.stages.push(StageRecord {
            stage,
            outcome,
            elapsed_ms,
        });
    }

    #[cfg(test)]
    pub fn outcome_of(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|record| record.stage == stage)
            .map(|record| &record.outcome)
    }

    pub fn failed_stages(&self) -> Vec<Stage> {
        self.stages
            .iter()
            .filter(|record| record.outcome.is_failed())
            .map(|record| record.stage)
            .collect()
    }

    /// Plain-text summary for terminals.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Restore run {}: {} -> {} ({})",
            self.run_id, self.source_instance, self.target_instance, self.region
        );
        if let Some(restore_time) = self.restore_time {
            let _ = writeln!(out, "Restore point: {}", restore_time.to_rfc3339());
        }
        for record in &self.stages {
            let note = match &record.outcome {
                StageOutcome::Completed { detail } => detail.clone().unwrap_or_default(),
                StageOutcome::Skipped { reason } => reason.clone(),
                StageOutcome::Failed { message, .. } => message.clone(),
            };
            let _ = writeln!(
                out,
                "  {:<34} {:<9} {:>8.1}s  {}",
                record.stage.to_string(),
                record.outcome.label(),
                record.elapsed_ms as f64 / 1000.0,
                note
            );
        }
        if let Some(instance) = &self.final_instance {
            let endpoint = match (&instance.endpoint_address, instance.endpoint_port) {
                (Some(address), Some(port)) => format!("{}:{}", address, port),
                (Some(address), None) => address.clone(),
                _ => "unknown endpoint".to_string(),
            };
            let _ = writeln!(
                out,
                "Instance {} is {} at {}",
                instance.identifier, instance.status, endpoint
            );
        }
        out
    }
}
