// rds-pitr-restore/src/restore/logic.rs
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::report::{RunReport, Stage, StageOutcome};
use crate::config::RestoreParams;
use crate::errors::{ControlPlaneError, WaitError, WorkflowError};
use crate::rds::{ControlPlane, InstanceDescriptor, ModifyInstanceRequest, PointInTimeRestoreRequest};
use crate::utils::clock::Clock;
use crate::utils::polling::{PollPolicy, Probe, pause, poll_until};

/// How far behind "now" the restore point is placed.
pub const RESTORE_LAG_MINUTES: i64 = 10;

const POLL_INTERVAL: Duration = Duration::from_secs(30);
// Matches the control plane's own "instance deleted" waiter budget.
const DELETION_MAX_ATTEMPTS: u32 = 60;
const GRACE_PERIOD: Duration = Duration::from_secs(15);

const AVAILABLE_FAILURE_STATES: &[&str] = &[
    "deleted",
    "deleting",
    "failed",
    "incompatible-restore",
    "incompatible-parameters",
];

const DELETED_FAILURE_STATES: &[&str] = &[
    "creating",
    "modifying",
    "rebooting",
    "resetting-master-credentials",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkflowTimings {
    pub poll_interval: Duration,
    pub deletion_max_attempts: u32,
    pub grace_period: Duration,
}

impl Default for WorkflowTimings {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            deletion_max_attempts: DELETION_MAX_ATTEMPTS,
            grace_period: GRACE_PERIOD,
        }
    }
}

#[derive(Debug)]
pub enum DeleteOutcome {
    Deleted(String),
    NotFound,
    Failed(ControlPlaneError),
}

fn probe_available(found: Option<InstanceDescriptor>) -> Probe<InstanceDescriptor> {
    match found {
        Some(instance) if instance.is_available() => Probe::Ready(instance),
        Some(instance) if AVAILABLE_FAILURE_STATES.contains(&instance.status.as_str()) => {
            Probe::Failed(instance.status)
        }
        Some(instance) => Probe::Pending(instance.status),
        // Describe can lag right after the restore call; keep polling.
        None => Probe::Pending("not found".to_string()),
    }
}

fn probe_deleted(found: Option<InstanceDescriptor>) -> Probe<()> {
    match found {
        None => Probe::Ready(()),
        Some(instance) if DELETED_FAILURE_STATES.contains(&instance.status.as_str()) => {
            Probe::Failed(instance.status)
        }
        Some(instance) => Probe::Pending(instance.status),
    }
}

/// Delete, restore, reconfigure and reboot one target instance, strictly in order.
pub struct RestoreWorkflow<'a> {
    control_plane: &'a dyn ControlPlane,
    clock: &'a dyn Clock,
    params: &'a RestoreParams,
    timings: WorkflowTimings,
    cancel: CancellationToken,
}

impl<'a> RestoreWorkflow<'a> {
    pub fn new(
        control_plane: &'a dyn ControlPlane,
        clock: &'a dyn Clock,
        params: &'a RestoreParams,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            control_plane,
            clock,
            params,
            timings: WorkflowTimings::default(),
            cancel,
        }
    }

    #[cfg(test)]
    pub fn with_timings(mut self, timings: WorkflowTimings) -> Self {
        self.timings = timings;
        self
    }

    /// `wait_minutes * 2` polls, so the fixed interval adds up to `wait_minutes` minutes.
    pub fn availability_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: self.timings.poll_interval,
            max_attempts: self.params.wait_minutes.saturating_mul(2),
        }
    }

    fn deletion_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: self.timings.poll_interval,
            max_attempts: self.timings.deletion_max_attempts,
        }
    }

    pub async fn run(&self) -> Result<RunReport, WorkflowError> {
        let mut report = RunReport::new(self.params, self.clock.now());
        info!(
            run_id = %report.run_id,
            source = %self.params.source_instance,
            instance = %self.params.target_instance,
            region = %self.params.region,
            "🔄 Starting point-in-time restore"
        );

        // Teardown of a previous restore is best effort.
        let started = Instant::now();
        let deleted = match self.teardown().await {
            DeleteOutcome::Deleted(status) => {
                report.record(
                    Stage::Teardown,
                    StageOutcome::completed(format!("delete accepted (status {})", status)),
                    started.elapsed(),
                );
                true
            }
            DeleteOutcome::NotFound => {
                report.record(
                    Stage::Teardown,
                    StageOutcome::skipped("no previously restored instance exists"),
                    started.elapsed(),
                );
                false
            }
            DeleteOutcome::Failed(err) => {
                report.record(
                    Stage::Teardown,
                    StageOutcome::failed(&err, err.code()),
                    started.elapsed(),
                );
                false
            }
        };

        let started = Instant::now();
        if deleted {
            match self.await_deleted().await {
                Ok(()) => report.record(
                    Stage::DeletionBarrier,
                    StageOutcome::completed("previous instance is gone"),
                    started.elapsed(),
                ),
                Err(WaitError::Cancelled { .. }) => {
                    return Err(WorkflowError::Cancelled(Stage::DeletionBarrier));
                }
                Err(err) => report.record(
                    Stage::DeletionBarrier,
                    StageOutcome::failed(&err, err.code()),
                    started.elapsed(),
                ),
            }
        } else {
            report.record(
                Stage::DeletionBarrier,
                StageOutcome::skipped("no deletion was requested"),
                started.elapsed(),
            );
        }

        // Everything after this depends on the instance existing.
        let started = Instant::now();
        match self.provision().await {
            Ok((restore_time, instance)) => {
                report.restore_time = Some(restore_time);
                report.record(
                    Stage::Provision,
                    StageOutcome::completed(format!(
                        "restoring to {} (status {})",
                        restore_time.to_rfc3339(),
                        instance.status
                    )),
                    started.elapsed(),
                );
            }
            Err(err) => {
                report.record(
                    Stage::Provision,
                    StageOutcome::failed(&err, err.code()),
                    started.elapsed(),
                );
                error!(run_id = %report.run_id, error = %err, "❌ provisioning failed, aborting run");
                return Err(WorkflowError::Provision(err));
            }
        }

        self.barrier(&mut report, Stage::AwaitProvisioned).await?;

        let started = Instant::now();
        let modified = self.reconfigure().await;
        self.settle(Stage::Reconfigure).await?;
        let outcome = match modified {
            Ok(instance) => StageOutcome::completed(format!("modification submitted (status {})", instance.status)),
            Err(err) => StageOutcome::failed(&err, err.code()),
        };
        report.record(Stage::Reconfigure, outcome, started.elapsed());

        self.barrier(&mut report, Stage::AwaitReconfigured).await?;

        let started = Instant::now();
        let rebooted = self.restart().await;
        self.settle(Stage::Restart).await?;
        let outcome = match rebooted {
            Ok(instance) => StageOutcome::completed(format!("reboot submitted (status {})", instance.status)),
            Err(err) => StageOutcome::failed(&err, err.code()),
        };
        report.record(Stage::Restart, outcome, started.elapsed());

        let instance = self.barrier(&mut report, Stage::AwaitRestarted).await?;
        report.final_instance = Some(instance);
        report.finished_at = Some(self.clock.now());

        info!(
            run_id = %report.run_id,
            instance = %self.params.target_instance,
            failed_stages = report.failed_stages().len(),
            "✅ Restored instance is available"
        );
        Ok(report)
    }

    pub async fn teardown(&self) -> DeleteOutcome {
        let target = &self.params.target_instance;
        info!(instance = %target, "Deleting previously restored instance");
        match self.control_plane.delete_instance(target).await {
            Ok(status) => DeleteOutcome::Deleted(status),
            Err(err) if err.is_not_found() => DeleteOutcome::NotFound,
            Err(err) => DeleteOutcome::Failed(err),
        }
    }

    async fn await_deleted(&self) -> Result<(), WaitError> {
        let control_plane = self.control_plane;
        let target = self.params.target_instance.as_str();
        let what = format!("instance {} to be deleted", target);
        info!(instance = %target, "Waiting for instance to be deleted...");

        poll_until(&self.deletion_policy(), &self.cancel, &what, move || async move {
            control_plane.describe_instance(target).await.map(probe_deleted)
        })
        .await
    }

    pub fn restore_request(&self, now: DateTime<Utc>) -> PointInTimeRestoreRequest {
        PointInTimeRestoreRequest {
            source_identifier: self.params.source_instance.clone(),
            target_identifier: self.params.target_instance.clone(),
            restore_time: now - ChronoDuration::minutes(RESTORE_LAG_MINUTES),
            instance_class: self.params.instance_class.clone(),
            publicly_accessible: self.params.publicly_accessible,
            vpc_security_group_ids: self.params.security_group_ids.clone(),
            parameter_group_name: self.params.parameter_group.clone(),
            multi_az: false,
            auto_minor_version_upgrade: false,
        }
    }

    /// Starts the point-in-time restore; the restore point is taken from the clock at call time.
    pub async fn provision(
        &self,
    ) -> Result<(DateTime<Utc>, InstanceDescriptor), ControlPlaneError> {
        let request = self.restore_request(self.clock.now());
        info!(
            source = %request.source_identifier,
            instance = %request.target_identifier,
            restore_time = %request.restore_time.to_rfc3339(),
            "Creating restored DB instance"
        );
        let instance = self.control_plane.restore_to_point_in_time(&request).await?;
        Ok((request.restore_time, instance))
    }

    async fn await_available(&self) -> Result<InstanceDescriptor, WaitError> {
        let control_plane = self.control_plane;
        let target = self.params.target_instance.as_str();
        let what = format!("instance {} to become available", target);
        info!(instance = %target, max_wait_minutes = self.params.wait_minutes, "Waiting for instance to become available...");

        poll_until(&self.availability_policy(), &self.cancel, &what, move || async move {
            control_plane.describe_instance(target).await.map(probe_available)
        })
        .await
    }

    /// Availability wait that ends the run on any failure.
    async fn barrier(
        &self,
        report: &mut RunReport,
        stage: Stage,
    ) -> Result<InstanceDescriptor, WorkflowError> {
        let started = Instant::now();
        match self.await_available().await {
            Ok(instance) => {
                report.record(
                    stage,
                    StageOutcome::completed(format!("{} is {}", instance.identifier, instance.status)),
                    started.elapsed(),
                );
                Ok(instance)
            }
            Err(WaitError::Cancelled { .. }) => Err(WorkflowError::Cancelled(stage)),
            Err(err) => {
                report.record(stage, StageOutcome::failed(&err, err.code()), started.elapsed());
                error!(run_id = %report.run_id, %stage, error = %err, "❌ instance did not become available, aborting run");
                Err(WorkflowError::Availability { stage, source: err })
            }
        }
    }

    pub fn modify_request(&self) -> ModifyInstanceRequest {
        ModifyInstanceRequest {
            identifier: self.params.target_instance.clone(),
            master_user_password: self.params.master_password.clone(),
            // The restored copy is disposable; no automated backups.
            backup_retention_period: 0,
            apply_immediately: true,
            publicly_accessible: Some(self.params.publicly_accessible),
            vpc_security_group_ids: self.params.security_group_ids.clone(),
            parameter_group_name: self.params.parameter_group.clone(),
        }
    }

    async fn reconfigure(&self) -> Result<InstanceDescriptor, ControlPlaneError> {
        let request = self.modify_request();
        info!(instance = %request.identifier, change_password = request.master_user_password.is_some(), "Changing restored database parameters...");
        self.control_plane.modify_instance(&request).await
    }

    async fn restart(&self) -> Result<InstanceDescriptor, ControlPlaneError> {
        let target = &self.params.target_instance;
        info!(instance = %target, "Restarting restored database...");
        self.control_plane.reboot_instance(target, false).await
    }

    /// Gives the control plane a moment to start applying a change before the next poll.
    async fn settle(&self, stage: Stage) -> Result<(), WorkflowError> {
        if pause(self.timings.grace_period, &self.cancel).await {
            Ok(())
        } else {
            Err(WorkflowError::Cancelled(stage))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rds::MockControlPlane;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Delete(String),
        Describe(String),
        Restore(PointInTimeRestoreRequest),
        Modify(ModifyInstanceRequest),
        Reboot(String, bool),
    }

    impl Call {
        fn kind(&self) -> &'static str {
            match self {
                Call::Delete(_) => "delete",
                Call::Describe(_) => "describe",
                Call::Restore(_) => "restore",
                Call::Modify(_) => "modify",
                Call::Reboot(..) => "reboot",
            }
        }
    }

    /// Records every call and answers describes from a script.
    struct ScriptedControlPlane {
        calls: Mutex<Vec<Call>>,
        describes: Mutex<VecDeque<Result<Option<InstanceDescriptor>, ControlPlaneError>>>,
        describe_fallback: String,
        delete_error: Option<ControlPlaneError>,
        restore_error: Option<ControlPlaneError>,
        modify_error: Option<ControlPlaneError>,
        reboot_error: Option<ControlPlaneError>,
    }

    impl ScriptedControlPlane {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                describes: Mutex::new(VecDeque::new()),
                describe_fallback: "available".to_string(),
                delete_error: None,
                restore_error: None,
                modify_error: None,
                reboot_error: None,
            }
        }

        fn script(self, responses: Vec<Result<Option<InstanceDescriptor>, ControlPlaneError>>) -> Self {
            *self.describes.lock().unwrap() = responses.into();
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn kinds(&self) -> Vec<&'static str> {
            self.calls().iter().map(Call::kind).collect()
        }

        fn log(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ControlPlane for ScriptedControlPlane {
        async fn delete_instance(&self, identifier: &str) -> Result<String, ControlPlaneError> {
            self.log(Call::Delete(identifier.to_string()));
            match &self.delete_error {
                Some(err) => Err(err.clone()),
                None => Ok("deleting".to_string()),
            }
        }

        async fn describe_instance(
            &self,
            identifier: &str,
        ) -> Result<Option<InstanceDescriptor>, ControlPlaneError> {
            self.log(Call::Describe(identifier.to_string()));
            match self.describes.lock().unwrap().pop_front() {
                Some(response) => response,
                None => Ok(Some(instance(identifier, &self.describe_fallback))),
            }
        }

        async fn restore_to_point_in_time(
            &self,
            request: &PointInTimeRestoreRequest,
        ) -> Result<InstanceDescriptor, ControlPlaneError> {
            self.log(Call::Restore(request.clone()));
            match &self.restore_error {
                Some(err) => Err(err.clone()),
                None => Ok(instance(&request.target_identifier, "creating")),
            }
        }

        async fn modify_instance(
            &self,
            request: &ModifyInstanceRequest,
        ) -> Result<InstanceDescriptor, ControlPlaneError> {
            self.log(Call::Modify(request.clone()));
            match &self.modify_error {
                Some(err) => Err(err.clone()),
                None => Ok(instance(&request.identifier, "modifying")),
            }
        }

        async fn reboot_instance(
            &self,
            identifier: &str,
            force_failover: bool,
        ) -> Result<InstanceDescriptor, ControlPlaneError> {
            self.log(Call::Reboot(identifier.to_string(), force_failover));
            match &self.reboot_error {
                Some(err) => Err(err.clone()),
                None => Ok(instance(identifier, "rebooting")),
            }
        }
    }

    struct FixedClock(Mutex<DateTime<Utc>>);

    impl FixedClock {
        fn at(time: DateTime<Utc>) -> Self {
            Self(Mutex::new(time))
        }

        fn set(&self, time: DateTime<Utc>) {
            *self.0.lock().unwrap() = time;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn instance(identifier: &str, status: &str) -> InstanceDescriptor {
        InstanceDescriptor {
            identifier: identifier.to_string(),
            status: status.to_string(),
            instance_class: Some("db.t3.medium".to_string()),
            engine: Some("postgres".to_string()),
            endpoint_address: None,
            endpoint_port: None,
        }
    }

    fn service_error(operation: &'static str, code: &str) -> ControlPlaneError {
        ControlPlaneError::Service {
            operation,
            code: Some(code.to_string()),
            message: format!("{} failed", operation),
        }
    }

    fn params() -> RestoreParams {
        RestoreParams {
            source_instance: "prod-db".to_string(),
            target_instance: "prod-db-restore-test".to_string(),
            region: "eu-west-1".to_string(),
            instance_class: Some("db.t3.medium".to_string()),
            security_group_ids: vec!["sg-0123".to_string()],
            parameter_group: Some("restored-params".to_string()),
            master_password: Some("NewP@ss1".to_string()),
            wait_minutes: 2,
            publicly_accessible: true,
            endpoint_url: None,
        }
    }

    fn fast() -> WorkflowTimings {
        WorkflowTimings {
            poll_interval: Duration::ZERO,
            deletion_max_attempts: 5,
            grace_period: Duration::ZERO,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap()
    }

    async fn run_with(
        control_plane: &dyn ControlPlane,
        params: &RestoreParams,
    ) -> Result<RunReport, WorkflowError> {
        let clock = FixedClock::at(now());
        RestoreWorkflow::new(control_plane, &clock, params, CancellationToken::new())
            .with_timings(fast())
            .run()
            .await
    }

    #[tokio::test]
    async fn test_full_run_issues_each_call_once_in_order() {
        let params = params();
        let control_plane = ScriptedControlPlane::new().script(vec![Ok(None)]);

        let report = run_with(&control_plane, &params).await.unwrap();

        assert_eq!(
            control_plane.kinds(),
            vec![
                "delete", "describe", "restore", "describe", "modify", "describe", "reboot",
                "describe"
            ]
        );
        for call in control_plane.calls() {
            match call {
                Call::Delete(id) | Call::Describe(id) | Call::Reboot(id, _) => {
                    assert_eq!(id, "prod-db-restore-test")
                }
                Call::Restore(request) => {
                    assert_eq!(request.source_identifier, "prod-db");
                    assert_eq!(request.target_identifier, "prod-db-restore-test");
                }
                Call::Modify(request) => {
                    assert_eq!(request.identifier, "prod-db-restore-test");
                    assert_eq!(request.master_user_password.as_deref(), Some("NewP@ss1"));
                }
            }
        }
        assert!(control_plane.calls().contains(&Call::Reboot("prod-db-restore-test".to_string(), false)));

        assert_eq!(report.stages.len(), 8);
        assert!(report.failed_stages().is_empty());
        assert_eq!(report.restore_time, Some(now() - ChronoDuration::minutes(10)));
        let final_instance = report.final_instance.unwrap();
        assert!(final_instance.is_available());
        assert!(report.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_absent_target_skips_deletion_barrier() {
        let params = params();
        let mut control_plane = ScriptedControlPlane::new();
        control_plane.delete_error = Some(service_error("DeleteDBInstance", "DBInstanceNotFound"));

        let report = run_with(&control_plane, &params).await.unwrap();

        assert_eq!(&control_plane.kinds()[..2], &["delete", "restore"]);
        assert!(matches!(report.outcome_of(Stage::Teardown), Some(StageOutcome::Skipped { .. })));
        assert!(matches!(report.outcome_of(Stage::DeletionBarrier), Some(StageOutcome::Skipped { .. })));
    }

    #[tokio::test]
    async fn test_other_delete_failure_is_logged_and_run_continues() {
        let params = params();
        let mut control_plane = ScriptedControlPlane::new();
        control_plane.delete_error = Some(service_error("DeleteDBInstance", "InvalidDBInstanceState"));

        let report = run_with(&control_plane, &params).await.unwrap();

        assert_eq!(&control_plane.kinds()[..2], &["delete", "restore"]);
        match report.outcome_of(Stage::Teardown) {
            Some(StageOutcome::Failed { code, .. }) => {
                assert_eq!(code.as_deref(), Some("InvalidDBInstanceState"))
            }
            other => panic!("unexpected teardown outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deletion_barrier_waits_until_gone() {
        let params = params();
        let control_plane = ScriptedControlPlane::new().script(vec![
            Ok(Some(instance("prod-db-restore-test", "deleting"))),
            Ok(Some(instance("prod-db-restore-test", "deleting"))),
            Ok(None),
        ]);

        run_with(&control_plane, &params).await.unwrap();

        assert_eq!(
            &control_plane.kinds()[..5],
            &["delete", "describe", "describe", "describe", "restore"]
        );
    }

    #[tokio::test]
    async fn test_deletion_barrier_failure_is_not_fatal() {
        let params = params();
        let control_plane = ScriptedControlPlane::new()
            .script(vec![Err(service_error("DescribeDBInstances", "AccessDenied"))]);

        let report = run_with(&control_plane, &params).await.unwrap();

        assert!(report.outcome_of(Stage::DeletionBarrier).unwrap().is_failed());
        assert!(control_plane.kinds().contains(&"restore"));
    }

    #[tokio::test]
    async fn test_deletion_barrier_timeout_is_not_fatal() {
        let params = params();
        let still_deleting = (0..fast().deletion_max_attempts)
            .map(|_| Ok(Some(instance("prod-db-restore-test", "deleting"))))
            .collect();
        let control_plane = ScriptedControlPlane::new().script(still_deleting);

        let report = run_with(&control_plane, &params).await.unwrap();

        match report.outcome_of(Stage::DeletionBarrier) {
            Some(StageOutcome::Failed { message, .. }) => {
                assert!(message.contains("timed out"), "{}", message)
            }
            other => panic!("unexpected deletion barrier outcome {:?}", other),
        }
        let kinds = control_plane.kinds();
        assert_eq!(&kinds[..7], &["delete", "describe", "describe", "describe", "describe", "describe", "restore"]);
        assert!(report.final_instance.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_follows_modify_and_reboot() {
        let params = params();
        let mut control_plane = ScriptedControlPlane::new().script(vec![Ok(None)]);
        control_plane.modify_error = Some(service_error("ModifyDBInstance", "InvalidParameterCombination"));
        let clock = FixedClock::at(now());

        let started = tokio::time::Instant::now();
        let report = RestoreWorkflow::new(&control_plane, &clock, &params, CancellationToken::new())
            .run()
            .await
            .unwrap();
        let elapsed = started.elapsed();

        // Every barrier is satisfied on its first poll, so only the two grace periods pass.
        assert!(elapsed >= GRACE_PERIOD * 2, "{:?}", elapsed);
        assert!(elapsed < GRACE_PERIOD * 2 + POLL_INTERVAL, "{:?}", elapsed);
        assert_eq!(report.failed_stages(), vec![Stage::Reconfigure]);
        assert_eq!(
            &control_plane.kinds()[4..],
            &["modify", "describe", "reboot", "describe"]
        );
    }

    #[tokio::test]
    async fn test_provision_rejected_aborts_before_modify() {
        let params = params();
        let mut control_plane = ScriptedControlPlane::new().script(vec![Ok(None)]);
        control_plane.restore_error = Some(service_error(
            "RestoreDBInstanceToPointInTime",
            "InvalidDBInstanceClass",
        ));

        let err = run_with(&control_plane, &params).await.unwrap_err();

        assert!(matches!(err, WorkflowError::Provision(ref e) if e.code() == Some("InvalidDBInstanceClass")));
        assert_eq!(control_plane.kinds(), vec!["delete", "describe", "restore"]);
    }

    #[tokio::test]
    async fn test_reconfigure_failure_still_restarts_and_waits() {
        let params = params();
        let mut control_plane = ScriptedControlPlane::new().script(vec![Ok(None)]);
        control_plane.modify_error = Some(service_error("ModifyDBInstance", "InvalidParameterCombination"));

        let report = run_with(&control_plane, &params).await.unwrap();

        assert_eq!(
            &control_plane.kinds()[4..],
            &["modify", "describe", "reboot", "describe"]
        );
        assert_eq!(report.failed_stages(), vec![Stage::Reconfigure]);
        assert!(report.final_instance.is_some());
    }

    #[tokio::test]
    async fn test_restart_failure_still_waits_for_availability() {
        let params = params();
        let mut control_plane = ScriptedControlPlane::new().script(vec![Ok(None)]);
        control_plane.reboot_error = Some(ControlPlaneError::Transport {
            operation: "RebootDBInstance",
            message: "connection reset".to_string(),
        });

        let report = run_with(&control_plane, &params).await.unwrap();

        assert_eq!(control_plane.kinds().last(), Some(&"describe"));
        assert_eq!(report.failed_stages(), vec![Stage::Restart]);
    }

    #[tokio::test]
    async fn test_availability_timeout_after_exact_poll_budget() {
        let params = RestoreParams {
            wait_minutes: 3,
            ..params()
        };
        let mut control_plane = ScriptedControlPlane::new().script(vec![Ok(None)]);
        control_plane.describe_fallback = "creating".to_string();

        let err = run_with(&control_plane, &params).await.unwrap_err();

        match err {
            WorkflowError::Availability {
                stage,
                source: WaitError::Timeout { attempts, ref last_status, .. },
            } => {
                assert_eq!(stage, Stage::AwaitProvisioned);
                assert_eq!(attempts, 6);
                assert_eq!(last_status, "creating");
            }
            other => panic!("expected availability timeout, got {:?}", other),
        }
        let kinds = control_plane.kinds();
        let polls_after_restore = kinds
            .iter()
            .skip_while(|k| **k != "restore")
            .filter(|k| **k == "describe")
            .count();
        assert_eq!(polls_after_restore, 6);
        assert!(!kinds.contains(&"modify"));
    }

    #[tokio::test]
    async fn test_success_only_when_latest_poll_is_available() {
        let params = params();
        let control_plane = ScriptedControlPlane::new().script(vec![
            Ok(None),
            Ok(Some(instance("prod-db-restore-test", "creating"))),
            Ok(Some(instance("prod-db-restore-test", "backing-up"))),
            Ok(Some(instance("prod-db-restore-test", "available"))),
        ]);

        let report = run_with(&control_plane, &params).await.unwrap();

        assert_eq!(
            &control_plane.kinds()[2..7],
            &["restore", "describe", "describe", "describe", "modify"]
        );
        assert!(report.outcome_of(Stage::AwaitProvisioned).is_some());
    }

    #[tokio::test]
    async fn test_missing_instance_after_restore_keeps_polling() {
        let params = params();
        let mut control_plane = ScriptedControlPlane::new().script(vec![
            Ok(None),
            Ok(Some(instance("prod-db-restore-test", "available"))),
        ]);
        control_plane.delete_error = Some(service_error("DeleteDBInstance", "DBInstanceNotFound"));

        let report = run_with(&control_plane, &params).await.unwrap();

        assert_eq!(
            &control_plane.kinds()[..5],
            &["delete", "restore", "describe", "describe", "modify"]
        );
        assert!(!report.outcome_of(Stage::AwaitProvisioned).unwrap().is_failed());
        assert!(control_plane.kinds().contains(&"reboot"));
    }

    #[tokio::test]
    async fn test_missing_instance_for_whole_budget_times_out() {
        let params = params();
        let mut control_plane = ScriptedControlPlane::new()
            .script(vec![Ok(None), Ok(None), Ok(None), Ok(None)]);
        control_plane.delete_error = Some(service_error("DeleteDBInstance", "DBInstanceNotFound"));

        let err = run_with(&control_plane, &params).await.unwrap_err();

        match err {
            WorkflowError::Availability {
                stage: Stage::AwaitProvisioned,
                source: WaitError::Timeout { attempts, ref last_status, .. },
            } => {
                assert_eq!(attempts, 4);
                assert_eq!(last_status, "not found");
            }
            other => panic!("expected availability timeout, got {:?}", other),
        }
        assert!(!control_plane.kinds().contains(&"modify"));
    }

    #[tokio::test]
    async fn test_failure_state_is_fatal() {
        let params = params();
        let control_plane = ScriptedControlPlane::new().script(vec![
            Ok(None),
            Ok(Some(instance("prod-db-restore-test", "incompatible-restore"))),
        ]);

        let err = run_with(&control_plane, &params).await.unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::Availability {
                source: WaitError::FailureState { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_at_first_wait() {
        let params = params();
        let control_plane = ScriptedControlPlane::new();
        let clock = FixedClock::at(now());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = RestoreWorkflow::new(&control_plane, &clock, &params, cancel)
            .with_timings(fast())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::Cancelled(Stage::DeletionBarrier)));
        assert_eq!(control_plane.kinds(), vec!["delete"]);
    }

    #[tokio::test]
    async fn test_restore_time_is_taken_at_call_time() {
        let params = params();
        let control_plane = ScriptedControlPlane::new();
        let clock = FixedClock::at(now());
        let workflow = RestoreWorkflow::new(&control_plane, &clock, &params, CancellationToken::new());

        let (first, _) = workflow.provision().await.unwrap();
        assert_eq!(first, now() - ChronoDuration::minutes(10));

        let later = now() + ChronoDuration::hours(2);
        clock.set(later);
        let (second, _) = workflow.provision().await.unwrap();
        assert_eq!(second, later - ChronoDuration::minutes(10));

        let restores: Vec<_> = control_plane
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Restore(request) => Some(request.restore_time),
                _ => None,
            })
            .collect();
        assert_eq!(restores, vec![first, second]);
    }

    #[test]
    fn test_restore_request_fixed_settings() {
        let params = params();
        let control_plane = ScriptedControlPlane::new();
        let clock = FixedClock::at(now());
        let workflow = RestoreWorkflow::new(&control_plane, &clock, &params, CancellationToken::new());

        let request = workflow.restore_request(now());
        assert!(!request.multi_az);
        assert!(!request.auto_minor_version_upgrade);
        assert!(request.publicly_accessible);
        assert_eq!(request.instance_class.as_deref(), Some("db.t3.medium"));
        assert_eq!(request.vpc_security_group_ids, vec!["sg-0123".to_string()]);
        assert_eq!(request.parameter_group_name.as_deref(), Some("restored-params"));
    }

    #[test]
    fn test_modify_request_always_disables_backups_and_applies_immediately() {
        let bare = RestoreParams {
            instance_class: None,
            security_group_ids: Vec::new(),
            parameter_group: None,
            master_password: None,
            publicly_accessible: false,
            ..params()
        };
        let control_plane = ScriptedControlPlane::new();
        let clock = FixedClock::at(now());

        for p in [params(), bare] {
            let workflow = RestoreWorkflow::new(&control_plane, &clock, &p, CancellationToken::new());
            let request = workflow.modify_request();
            assert_eq!(request.backup_retention_period, 0);
            assert!(request.apply_immediately);
            assert_eq!(request.identifier, "prod-db-restore-test");
        }
    }

    #[test]
    fn test_availability_policy_uses_two_polls_per_minute() {
        let params = RestoreParams {
            wait_minutes: 35,
            ..params()
        };
        let control_plane = ScriptedControlPlane::new();
        let clock = FixedClock::at(now());
        let workflow = RestoreWorkflow::new(&control_plane, &clock, &params, CancellationToken::new());

        let policy = workflow.availability_policy();
        assert_eq!(policy.max_attempts, 70);
        assert_eq!(policy.interval, Duration::from_secs(30));
    }

    #[test]
    fn test_probe_classification() {
        assert!(matches!(probe_available(Some(instance("db", "available"))), Probe::Ready(_)));
        assert_eq!(
            probe_available(Some(instance("db", "modifying"))),
            Probe::Pending("modifying".to_string())
        );
        assert_eq!(
            probe_available(Some(instance("db", "failed"))),
            Probe::Failed("failed".to_string())
        );
        assert_eq!(probe_available(None), Probe::Pending("not found".to_string()));

        assert_eq!(probe_deleted(None), Probe::Ready(()));
        assert_eq!(
            probe_deleted(Some(instance("db", "deleting"))),
            Probe::Pending("deleting".to_string())
        );
        assert_eq!(
            probe_deleted(Some(instance("db", "rebooting"))),
            Probe::Failed("rebooting".to_string())
        );
    }

    #[tokio::test]
    async fn test_provision_failure_with_mock_never_modifies() {
        let mut mock = MockControlPlane::new();
        mock.expect_delete_instance()
            .times(1)
            .returning(|_| Err(service_error("DeleteDBInstance", "DBInstanceNotFound")));
        mock.expect_describe_instance().never();
        mock.expect_restore_to_point_in_time()
            .times(1)
            .returning(|_| Err(service_error("RestoreDBInstanceToPointInTime", "PointInTimeRestoreNotEnabled")));
        mock.expect_modify_instance().never();
        mock.expect_reboot_instance().never();

        let params = params();
        let err = run_with(&mock, &params).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Provision(_)));
    }

    #[tokio::test]
    async fn test_teardown_outcomes_with_mock() {
        let mut mock = MockControlPlane::new();
        mock.expect_delete_instance()
            .times(1)
            .returning(|_| Ok("deleting".to_string()));

        let params = params();
        let clock = FixedClock::at(now());
        let workflow = RestoreWorkflow::new(&mock, &clock, &params, CancellationToken::new());
        assert!(matches!(workflow.teardown().await, DeleteOutcome::Deleted(ref s) if s == "deleting"));
    }
}
