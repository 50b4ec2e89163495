// rds-pitr-restore/src/rds/mod.rs
pub(crate) mod client;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::errors::ControlPlaneError;

pub const STATUS_AVAILABLE: &str = "available";

/// Snapshot of an instance as reported by a single describe call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceDescriptor {
    pub identifier: String,
    pub status: String,
    pub instance_class: Option<String>,
    pub engine: Option<String>,
    pub endpoint_address: Option<String>,
    pub endpoint_port: Option<i32>,
}

impl InstanceDescriptor {
    pub fn is_available(&self) -> bool {
        self.status == STATUS_AVAILABLE
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointInTimeRestoreRequest {
    pub source_identifier: String,
    pub target_identifier: String,
    pub restore_time: DateTime<Utc>,
    pub instance_class: Option<String>,
    pub publicly_accessible: bool,
    pub vpc_security_group_ids: Vec<String>,
    pub parameter_group_name: Option<String>,
    pub multi_az: bool,
    pub auto_minor_version_upgrade: bool,
}

#[derive(Clone, PartialEq)]
pub struct ModifyInstanceRequest {
    pub identifier: String,
    pub master_user_password: Option<String>,
    pub backup_retention_period: i32,
    pub apply_immediately: bool,
    pub publicly_accessible: Option<bool>,
    pub vpc_security_group_ids: Vec<String>,
    pub parameter_group_name: Option<String>,
}

// Keeps the new master password out of logs.
impl fmt::Debug for ModifyInstanceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModifyInstanceRequest")
            .field("identifier", &self.identifier)
            .field(
                "master_user_password",
                &self.master_user_password.as_ref().map(|_| "<redacted>"),
            )
            .field("backup_retention_period", &self.backup_retention_period)
            .field("apply_immediately", &self.apply_immediately)
            .field("publicly_accessible", &self.publicly_accessible)
            .field("vpc_security_group_ids", &self.vpc_security_group_ids)
            .field("parameter_group_name", &self.parameter_group_name)
            .finish()
    }
}

/// The managed-database administrative API consumed by the restore workflow.
///
/// Every call is scoped to the region the implementation was built for.
/// `describe_instance` returns `Ok(None)` when the instance does not exist.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Deletes the instance without a final snapshot, returning the reported status.
    async fn delete_instance(&self, identifier: &str) -> Result<String, ControlPlaneError>;
    async fn describe_instance(
        &self,
        identifier: &str,
    ) -> Result<Option<InstanceDescriptor>, ControlPlaneError>;
    async fn restore_to_point_in_time(
        &self,
        request: &PointInTimeRestoreRequest,
    ) -> Result<InstanceDescriptor, ControlPlaneError>;
    async fn modify_instance(
        &self,
        request: &ModifyInstanceRequest,
    ) -> Result<InstanceDescriptor, ControlPlaneError>;
    async fn reboot_instance(
        &self,
        identifier: &str,
        force_failover: bool,
    ) -> Result<InstanceDescriptor, ControlPlaneError>;
}
