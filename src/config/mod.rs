// rds-pitr-restore/src/config/mod.rs
use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::utils::identifiers::{same_instance, validate_instance_identifier};

/// A point-in-time restore can take around 30 minutes, so wait a bit longer than that.
pub const DEFAULT_WAIT_MINUTES: u32 = 35;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JsonSecurityGroups {
    One(String),
    Many(Vec<String>),
}

#[derive(Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub source_instance: Option<String>,
    pub target_instance: Option<String>,
    pub region: Option<String>,
    pub instance_class: Option<String>,
    pub security_group_ids: Option<JsonSecurityGroups>,
    pub parameter_group: Option<String>,
    pub master_password: Option<String>,
    pub wait_minutes: Option<u32>,
    pub publicly_accessible: Option<bool>,
    pub endpoint_url: Option<String>,
}

impl RawJsonConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })
    }
}

/// Run parameters accepted on the command line (or from the environment).
///
/// The long aliases keep the flag names of the older Go tool working.
#[derive(Args, Clone, Default)]
pub struct ParamArgs {
    /// Source DB instance to restore from (never modified)
    #[arg(long = "source", visible_alias = "database", env = "RDS_RESTORE_SOURCE")]
    pub source: Option<String>,

    /// Identifier of the restored instance; an existing instance with this name is deleted
    #[arg(
        long = "target",
        visible_alias = "restoretargetdatabase",
        env = "RDS_RESTORE_TARGET"
    )]
    pub target: Option<String>,

    /// AWS region of the instances
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Instance class of the restored instance (defaults to the source's class)
    #[arg(
        long = "instance-class",
        visible_alias = "dbtype",
        env = "RDS_RESTORE_INSTANCE_CLASS"
    )]
    pub instance_class: Option<String>,

    /// VPC security group id(s), comma-separated
    #[arg(
        long = "security-group",
        visible_alias = "securitygroup",
        env = "RDS_RESTORE_SECURITY_GROUP"
    )]
    pub security_group: Option<String>,

    /// DB parameter group for the restored instance
    #[arg(
        long = "parameter-group",
        visible_alias = "dbparametergroup",
        env = "RDS_RESTORE_PARAMETER_GROUP"
    )]
    pub parameter_group: Option<String>,

    /// New master password for the restored instance
    #[arg(
        long = "master-password",
        visible_alias = "restoredmasterpassword",
        env = "RDS_RESTORE_MASTER_PASSWORD",
        hide_env_values = true
    )]
    pub master_password: Option<String>,

    /// Minutes to wait for the instance to become available after each step
    #[arg(
        long = "wait-minutes",
        visible_alias = "waitingDbTimeInMinutes",
        env = "RDS_RESTORE_WAIT_MINUTES"
    )]
    pub wait_minutes: Option<u32>,

    /// Override the RDS endpoint (for local emulators)
    #[arg(long = "endpoint-url", env = "RDS_RESTORE_ENDPOINT_URL")]
    pub endpoint_url: Option<String>,
}

// Application's internal configuration
#[derive(Clone, PartialEq)]
pub struct RestoreParams {
    pub source_instance: String,
    pub target_instance: String,
    pub region: String,
    pub instance_class: Option<String>,
    pub security_group_ids: Vec<String>,
    pub parameter_group: Option<String>,
    pub master_password: Option<String>,
    pub wait_minutes: u32,
    pub publicly_accessible: bool,
    pub endpoint_url: Option<String>,
}

impl fmt::Debug for RestoreParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreParams")
            .field("source_instance", &self.source_instance)
            .field("target_instance", &self.target_instance)
            .field("region", &self.region)
            .field("instance_class", &self.instance_class)
            .field("security_group_ids", &self.security_group_ids)
            .field("parameter_group", &self.parameter_group)
            .field(
                "master_password",
                &self.master_password.as_ref().map(|_| "<redacted>"),
            )
            .field("wait_minutes", &self.wait_minutes)
            .field("publicly_accessible", &self.publicly_accessible)
            .field("endpoint_url", &self.endpoint_url)
            .finish()
    }
}

/// Loads the optional JSON file and layers CLI/env values on top of it.
pub fn resolve_params(config_path: Option<&Path>, args: &ParamArgs) -> Result<RestoreParams> {
    let raw = match config_path {
        Some(path) => RawJsonConfig::load_from_json(path)?,
        None => RawJsonConfig::default(),
    };
    merge_params(raw, args)
}

/// Empty strings count as "not set".
fn pick(cli: &Option<String>, json: Option<String>) -> Option<String> {
    cli.clone()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| json.filter(|s| !s.trim().is_empty()))
        .map(|s| s.trim().to_string())
}

/// Like `pick`, but keeps the value byte for byte; only an empty string counts as unset.
fn pick_secret(cli: &Option<String>, json: Option<String>) -> Option<String> {
    cli.clone()
        .filter(|s| !s.is_empty())
        .or_else(|| json.filter(|s| !s.is_empty()))
}

/// Splits a comma-separated list the same way for CLI and JSON string values.
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_security_groups(
    cli: &Option<String>,
    json: Option<JsonSecurityGroups>,
) -> Vec<String> {
    if let Some(value) = cli.as_deref().filter(|s| !s.trim().is_empty()) {
        return split_list(value);
    }
    match json {
        Some(JsonSecurityGroups::One(value)) => split_list(&value),
        Some(JsonSecurityGroups::Many(values)) => values
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => Vec::new(),
    }
}

fn merge_params(raw: RawJsonConfig, args: &ParamArgs) -> Result<RestoreParams> {
    let source_instance = pick(&args.source, raw.source_instance)
        .context("source instance must be set (--source or source_instance in config.json)")?;
    let target_instance = pick(&args.target, raw.target_instance)
        .context("target instance must be set (--target or target_instance in config.json)")?;
    let region = pick(&args.region, raw.region)
        .context("region must be set (--region, AWS_REGION or region in config.json)")?;

    validate_instance_identifier("target instance", &target_instance)?;
    if same_instance(&source_instance, &target_instance) {
        anyhow::bail!(
            "target instance '{}' is the source instance; refusing to delete the source",
            target_instance
        );
    }

    let wait_minutes = args
        .wait_minutes
        .or(raw.wait_minutes)
        .unwrap_or(DEFAULT_WAIT_MINUTES);
    if wait_minutes == 0 {
        anyhow::bail!("wait minutes must be at least 1");
    }

    Ok(RestoreParams {
        source_instance,
        target_instance,
        region,
        instance_class: pick(&args.instance_class, raw.instance_class),
        security_group_ids: parse_security_groups(&args.security_group, raw.security_group_ids),
        parameter_group: pick(&args.parameter_group, raw.parameter_group),
        master_password: pick_secret(&args.master_password, raw.master_password),
        wait_minutes,
        publicly_accessible: raw.publicly_accessible.unwrap_or(true),
        endpoint_url: pick(&args.endpoint_url, raw.endpoint_url),
    })
}
