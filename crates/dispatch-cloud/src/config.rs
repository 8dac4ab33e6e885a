// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for dispatch-cloud.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use dispatch_cloud_driver::{ImageId, InstanceSetId, InstanceTags, InstanceType};
use sha2::{Digest, Sha256};

use crate::executor::ssh::SshKey;

const PREFIX: &str = "DISPATCH_CLOUD_";

/// Dispatcher timeouts.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Idle time before an idle worker is shut down.
    pub idle: Duration,
    /// Time allowed for a new instance to pass its boot probe.
    pub booting: Duration,
    /// Time a booted worker may fail probes before it is shut down.
    pub probe: Duration,
    /// Time after which a failed destroy is retried.
    pub shutdown: Duration,
    /// Time spent sending SIGTERM before giving up on a supervisor.
    pub term: Duration,
    /// Interval between SIGTERM attempts.
    pub signal: Duration,
    /// Time a stale run lock may be reported before the host counts as broken.
    pub stale_run_lock: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            booting: Duration::from_secs(600),
            probe: Duration::from_secs(600),
            shutdown: Duration::from_secs(10),
            term: Duration::from_secs(120),
            signal: Duration::from_secs(5),
            stale_run_lock: Duration::from_secs(60),
        }
    }
}

/// Dispatcher configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control plane base URL.
    pub api_host: String,
    /// Control plane bearer token.
    pub api_token: String,
    /// Configured instance types, keyed by name.
    pub instance_types: BTreeMap<String, InstanceType>,
    /// Cloud driver name.
    pub driver: String,
    /// Opaque driver parameters.
    pub driver_parameters: serde_json::Value,
    /// Image for new instances.
    pub image_id: ImageId,
    /// OpenSSH private key file used by the SSH executor.
    pub ssh_private_key_path: Option<PathBuf>,
    /// The parsed private key, loaded from `ssh_private_key_path`.
    pub ssh_private_key: Option<SshKey>,
    /// Public key installed on new instances.
    pub ssh_public_key_path: Option<PathBuf>,
    /// SSH port used when an instance address has none.
    pub ssh_port: u16,
    /// Remote supervisor command.
    pub supervisor_command: String,
    /// Bootstrap probe command.
    pub boot_probe_command: String,
    /// Prefix for reserved tag keys.
    pub tag_key_prefix: String,
    /// Tags added to every instance.
    pub resource_tags: InstanceTags,
    /// Cluster ID; `--list` lines not starting with it are ignored when set.
    pub cluster_id: String,
    /// Bind address for the management surface.
    pub management_addr: Option<SocketAddr>,
    /// Bearer token for the management surface.
    pub management_token: String,
    /// Queue update interval.
    pub poll_interval: Duration,
    /// Instance list interval.
    pub sync_interval: Duration,
    /// Worker probe interval.
    pub probe_interval: Duration,
    /// Global probe rate limit.
    pub max_probes_per_second: u32,
    /// Cloud operations rate limit; 0 means unlimited.
    pub max_cloud_ops_per_second: u32,
    /// Worker timeouts.
    pub timeouts: Timeouts,
    /// Time to wait for workers to leave Unknown before fixing stale locks.
    pub stale_lock_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &'static str| lookup(&format!("{}{}", PREFIX, name));
        let required = |name: &'static str| {
            var(name)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingEnvVar(name))
        };
        let secs = |name: &'static str, default: u64| -> Result<Duration, ConfigError> {
            match var(name) {
                Some(v) => v
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::InvalidValue(name, v)),
                None => Ok(Duration::from_secs(default)),
            }
        };
        let number = |name: &'static str, default: u32| -> Result<u32, ConfigError> {
            match var(name) {
                Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue(name, v)),
                None => Ok(default),
            }
        };

        let api_host = required("API_HOST")?;
        let api_token = required("API_TOKEN")?;

        let types_json = required("INSTANCE_TYPES")?;
        let types: Vec<InstanceType> = serde_json::from_str(&types_json)
            .map_err(|e| ConfigError::InvalidJson("INSTANCE_TYPES", e.to_string()))?;
        let mut instance_types = BTreeMap::new();
        for it in types {
            if instance_types.insert(it.name.clone(), it.clone()).is_some() {
                return Err(ConfigError::DuplicateInstanceType(it.name));
            }
        }

        let driver = var("DRIVER").unwrap_or_else(|| "stub".to_string());
        let driver_parameters = match var("DRIVER_PARAMETERS") {
            Some(v) => serde_json::from_str(&v)
                .map_err(|e| ConfigError::InvalidJson("DRIVER_PARAMETERS", e.to_string()))?,
            None => serde_json::Value::Object(Default::default()),
        };

        let ssh_private_key_path = var("SSH_PRIVATE_KEY_PATH").map(PathBuf::from);
        if ssh_private_key_path.is_none() && driver != "stub" {
            return Err(ConfigError::MissingEnvVar("SSH_PRIVATE_KEY_PATH"));
        }
        let ssh_private_key = ssh_private_key_path
            .as_deref()
            .map(SshKey::from_file)
            .transpose()?;
        let ssh_public_key_path = var("SSH_PUBLIC_KEY_PATH").map(PathBuf::from).or_else(|| {
            ssh_private_key_path
                .as_ref()
                .map(|p| PathBuf::from(format!("{}.pub", p.display())))
        });

        let ssh_port = match var("SSH_PORT") {
            Some(v) => v.parse().map_err(|_| ConfigError::InvalidPort)?,
            None => 22,
        };

        let resource_tags = match var("RESOURCE_TAGS") {
            Some(v) => serde_json::from_str(&v)
                .map_err(|e| ConfigError::InvalidJson("RESOURCE_TAGS", e.to_string()))?,
            None => InstanceTags::new(),
        };

        let management_addr = match var("MANAGEMENT_ADDR") {
            Some(v) if !v.is_empty() => Some(
                v.parse()
                    .map_err(|_| ConfigError::InvalidValue("MANAGEMENT_ADDR", v))?,
            ),
            _ => None,
        };

        let timeouts = Timeouts {
            idle: secs("TIMEOUT_IDLE_SECS", 60)?,
            booting: secs("TIMEOUT_BOOTING_SECS", 600)?,
            probe: secs("TIMEOUT_PROBE_SECS", 600)?,
            shutdown: secs("TIMEOUT_SHUTDOWN_SECS", 10)?,
            term: secs("TIMEOUT_TERM_SECS", 120)?,
            signal: secs("TIMEOUT_SIGNAL_SECS", 5)?,
            stale_run_lock: secs("TIMEOUT_STALE_RUN_LOCK_SECS", 60)?,
        };

        Ok(Self {
            api_host,
            api_token,
            instance_types,
            driver,
            driver_parameters,
            image_id: ImageId(var("IMAGE_ID").unwrap_or_default()),
            ssh_private_key_path,
            ssh_private_key,
            ssh_public_key_path,
            ssh_port,
            supervisor_command: var("SUPERVISOR_COMMAND")
                .unwrap_or_else(|| "dispatch-supervisor".to_string()),
            boot_probe_command: var("BOOT_PROBE_COMMAND").unwrap_or_else(|| "true".to_string()),
            tag_key_prefix: var("TAG_KEY_PREFIX").unwrap_or_else(|| "dispatch-".to_string()),
            resource_tags,
            cluster_id: var("CLUSTER_ID").unwrap_or_default(),
            management_addr,
            management_token: var("MANAGEMENT_TOKEN").unwrap_or_default(),
            poll_interval: secs("POLL_INTERVAL_SECS", 1)?,
            sync_interval: secs("SYNC_INTERVAL_SECS", 60)?,
            probe_interval: secs("PROBE_INTERVAL_SECS", 10)?,
            max_probes_per_second: number("MAX_PROBES_PER_SECOND", 10)?,
            max_cloud_ops_per_second: number("MAX_CLOUD_OPS_PER_SECOND", 0)?,
            timeouts,
            stale_lock_timeout: secs("STALE_LOCK_TIMEOUT_SECS", 60)?,
        })
    }

    /// Instance set ID derived from the API token.
    ///
    /// A `v2/<uuid>/<secret>` token yields its UUID; any other token yields
    /// the hex SHA-256 of the whole token.
    pub fn instance_set_id(&self) -> InstanceSetId {
        instance_set_id_for_token(&self.api_token)
    }
}

/// Derive an instance set ID from a control plane token.
pub fn instance_set_id_for_token(token: &str) -> InstanceSetId {
    let parts: Vec<&str> = token.split('/').collect();
    if parts.len() == 3 && parts[0] == "v2" && !parts[1].is_empty() {
        return InstanceSetId(parts[1].to_string());
    }
    InstanceSetId(hex::encode(Sha256::digest(token.as_bytes())))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: DISPATCH_CLOUD_{0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// A variable could not be parsed.
    #[error("Invalid value for DISPATCH_CLOUD_{0}: {1:?}")]
    InvalidValue(&'static str, String),
    /// A JSON-valued variable could not be parsed.
    #[error("Invalid JSON in DISPATCH_CLOUD_{0}: {1}")]
    InvalidJson(&'static str, String),
    /// Two instance types share a name.
    #[error("Duplicate instance type name: {0}")]
    DuplicateInstanceType(String),
    /// The driver name is not known.
    #[error("Unknown cloud driver: {0}")]
    UnknownDriver(String),
    /// The SSH key could not be read or parsed.
    #[error("Invalid SSH key {path}: {reason}")]
    InvalidSshKey {
        /// Key file.
        path: PathBuf,
        /// Parse or read failure.
        reason: String,
    },
}
