// rds-pitr-restore/src/rds/client.rs
use async_trait::async_trait;
use aws_sdk_rds as rds;
use chrono::{DateTime, Utc};
use rds::config::Region;
use rds::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use rds::types::DbInstance;
use tracing::debug;

use super::{ControlPlane, InstanceDescriptor, ModifyInstanceRequest, PointInTimeRestoreRequest};
use crate::errors::ControlPlaneError;

/// `ControlPlane` backed by the AWS RDS API.
///
/// Built once per run; credentials come from the default provider chain.
pub struct RdsControlPlane {
    client: rds::Client,
}

impl RdsControlPlane {
    pub async fn connect(region: &str, endpoint_url: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(rds::config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()));
        if let Some(endpoint) = endpoint_url {
            // Local emulators (e.g. localstack)
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        debug!(region, endpoint_url, "RDS client configured");
        Self {
            client: rds::Client::new(&sdk_config),
        }
    }
}

/// Splits SDK failures into structured service errors and everything else.
fn classify<E, R>(operation: &'static str, err: SdkError<E, R>) -> ControlPlaneError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match err.as_service_error() {
        Some(service_err) => ControlPlaneError::Service {
            operation,
            code: service_err.code().map(str::to_string),
            message: service_err
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| service_err.to_string()),
        },
        None => ControlPlaneError::Transport {
            operation,
            message: DisplayErrorContext(&err).to_string(),
        },
    }
}

fn to_smithy_time(time: DateTime<Utc>) -> aws_smithy_types::DateTime {
    aws_smithy_types::DateTime::from_millis(time.timestamp_millis())
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}

fn descriptor_from(instance: &DbInstance) -> InstanceDescriptor {
    InstanceDescriptor {
        identifier: instance.db_instance_identifier().unwrap_or_default().to_string(),
        status: instance.db_instance_status().unwrap_or("unknown").to_string(),
        instance_class: instance.db_instance_class().map(str::to_string),
        engine: instance.engine().map(str::to_string),
        endpoint_address: instance
            .endpoint()
            .and_then(|e| e.address())
            .map(str::to_string),
        endpoint_port: instance.endpoint().and_then(|e| e.port()),
    }
}

/// Mutating calls may come back without an instance body; fall back to what we asked for.
fn descriptor_or(instance: Option<&DbInstance>, identifier: &str, status: &str) -> InstanceDescriptor {
    instance.map(descriptor_from).unwrap_or_else(|| InstanceDescriptor {
        identifier: identifier.to_string(),
        status: status.to_string(),
        instance_class: None,
        engine: None,
        endpoint_address: None,
        endpoint_port: None,
    })
}

#[async_trait]
impl ControlPlane for RdsControlPlane {
    async fn delete_instance(&self, identifier: &str) -> Result<String, ControlPlaneError> {
        let output = self
            .client
            .delete_db_instance()
            .db_instance_identifier(identifier)
            .skip_final_snapshot(true)
            .send()
            .await
            .map_err(|e| classify("DeleteDBInstance", e))?;

        Ok(descriptor_or(output.db_instance(), identifier, "deleting").status)
    }

    async fn describe_instance(
        &self,
        identifier: &str,
    ) -> Result<Option<InstanceDescriptor>, ControlPlaneError> {
        match self
            .client
            .describe_db_instances()
            .db_instance_identifier(identifier)
            .send()
            .await
        {
            Ok(output) => Ok(output.db_instances().first().map(descriptor_from)),
            Err(err) => {
                let err = classify("DescribeDBInstances", err);
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn restore_to_point_in_time(
        &self,
        request: &PointInTimeRestoreRequest,
    ) -> Result<InstanceDescriptor, ControlPlaneError> {
        let output = self
            .client
            .restore_db_instance_to_point_in_time()
            .source_db_instance_identifier(&request.source_identifier)
            .target_db_instance_identifier(&request.target_identifier)
            .restore_time(to_smithy_time(request.restore_time))
            .set_db_instance_class(request.instance_class.clone())
            .publicly_accessible(request.publicly_accessible)
            .set_vpc_security_group_ids(non_empty(&request.vpc_security_group_ids))
            .set_db_parameter_group_name(request.parameter_group_name.clone())
            .multi_az(request.multi_az)
            .auto_minor_version_upgrade(request.auto_minor_version_upgrade)
            .send()
            .await
            .map_err(|e| classify("RestoreDBInstanceToPointInTime", e))?;

        Ok(descriptor_or(
            output.db_instance(),
            &request.target_identifier,
            "creating",
        ))
    }

    async fn modify_instance(
        &self,
        request: &ModifyInstanceRequest,
    ) -> Result<InstanceDescriptor, ControlPlaneError> {
        let output = self
            .client
            .modify_db_instance()
            .db_instance_identifier(&request.identifier)
            .apply_immediately(request.apply_immediately)
            .backup_retention_period(request.backup_retention_period)
            .set_master_user_password(request.master_user_password.clone())
            .set_publicly_accessible(request.publicly_accessible)
            .set_vpc_security_group_ids(non_empty(&request.vpc_security_group_ids))
            .set_db_parameter_group_name(request.parameter_group_name.clone())
            .send()
            .await
            .map_err(|e| classify("ModifyDBInstance", e))?;

        Ok(descriptor_or(output.db_instance(), &request.identifier, "modifying"))
    }

    async fn reboot_instance(
        &self,
        identifier: &str,
        force_failover: bool,
    ) -> Result<InstanceDescriptor, ControlPlaneError> {
        let output = self
            .client
            .reboot_db_instance()
            .db_instance_identifier(identifier)
            .force_failover(force_failover)
            .send()
            .await
            .map_err(|e| classify("RebootDBInstance", e))?;

        Ok(descriptor_or(output.db_instance(), identifier, "rebooting"))
    }
}
