mod logic;
pub(crate) mod report;

use tokio_util::sync::CancellationToken;

use crate::config::RestoreParams;
use crate::errors::WorkflowError;
use crate::rds::ControlPlane;
use crate::utils::clock::SystemClock;
use report::RunReport;

/// Public entry point for the restore process.
/// Runs the whole delete/restore/reconfigure/reboot sequence against one control-plane client.
pub async fn run_restore_flow(
    params: &RestoreParams,
    control_plane: &dyn ControlPlane,
    cancel: CancellationToken,
) -> Result<RunReport, WorkflowError> {
    logic::RestoreWorkflow::new(control_plane, &SystemClock, params, cancel)
        .run()
        .await
}
