//! Environment configuration of the mothership scheduler.

use std::collections::HashMap;
use std::time::Duration;

use crate::bookkeeper::{BookkeeperConfig, DEFAULT_BOOKKEEPING_INTERVAL};
use crate::cleaner::{
    CleanerConfig, DEFAULT_CLEANER_INTERVAL, DEFAULT_MAX_ENTITY_AGE, DEFAULT_RETAIN_RECONCILIATIONS,
};
use crate::error::SchedulerError;
use crate::handler::{ComponentOrder, CRD_COMPONENT};
use crate::inventory_watch::{
    InventoryWatchConfig, DEFAULT_RECONCILE_INTERVAL, DEFAULT_WATCH_INTERVAL,
};
use crate::invoker::CallbackEndpoint;
use crate::remote_scheduler::{RemoteSchedulerConfig, DEFAULT_POOL_SIZE};
use crate::status_updater::DEFAULT_PROGRESS_TIMEOUT;
use crate::transition::{TransitionConfig, DEFAULT_STATUS_MAX_RETRIES};
use crate::worker::{
    WorkerConfig, DEFAULT_DISPATCH_TIMEOUT, DEFAULT_MAX_DURATION, DEFAULT_MAX_RETRIES,
    DEFAULT_TICK_INTERVAL,
};
use crate::worker_factory::{ReconcilerRegistry, DEFAULT_RECONCILER};

const ENV_PREFIX: &str = "MOTHERSHIP_";
const RECONCILER_URL_PREFIX: &str = "MOTHERSHIP_RECONCILER_";
const RECONCILER_URL_SUFFIX: &str = "_URL";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Sqlite,
    Postgres,
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub backend: StorageBackend,
    pub sqlite_db_path: String,
    pub postgres_dsn: Option<String>,
    pub listen_addr: String,
    pub pool_size: usize,
    pub watch_interval: Duration,
    pub reconcile_interval: Duration,
    pub worker: WorkerConfig,
    pub status_max_retries: usize,
    pub callback: CallbackEndpoint,
    pub prerequisites: Vec<String>,
    pub crd_components: Vec<String>,
    pub default_reconciler: String,
    /// Reconciler URL per component name (lower case).
    pub reconcilers: HashMap<String, String>,
    pub purge_deleted: bool,
    pub bookkeeper: BookkeeperConfig,
    pub cleaner: CleanerConfig,
}

impl SchedulerConfig {
    pub fn from_env(default_sqlite_db_path: &str) -> Result<Self, String> {
        let envs: HashMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect();
        Self::from_env_map(default_sqlite_db_path, &envs)
    }

    pub fn from_env_map(
        default_sqlite_db_path: &str,
        envs: &HashMap<String, String>,
    ) -> Result<Self, String> {
        let get = |key: &str| {
            envs.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let backend = match get("MOTHERSHIP_STORAGE_BACKEND")
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_else(|| "sqlite".to_string())
            .as_str()
        {
            "sqlite" => StorageBackend::Sqlite,
            "postgres" => StorageBackend::Postgres,
            other => {
                return Err(format!(
                    "invalid MOTHERSHIP_STORAGE_BACKEND='{}'. expected one of: sqlite, postgres",
                    other
                ));
            }
        };
        let postgres_dsn = get("MOTHERSHIP_POSTGRES_DSN");
        if backend == StorageBackend::Postgres && postgres_dsn.is_none() {
            return Err(
                "MOTHERSHIP_STORAGE_BACKEND=postgres requires MOTHERSHIP_POSTGRES_DSN".to_string(),
            );
        }

        let pool_size = parse_number(envs, "MOTHERSHIP_POOL_SIZE", DEFAULT_POOL_SIZE as u64)?;
        if pool_size == 0 {
            return Err("MOTHERSHIP_POOL_SIZE must be greater than 0".to_string());
        }

        let callback_port = parse_number(envs, "MOTHERSHIP_CALLBACK_PORT", 8080)?;
        let callback_port = u16::try_from(callback_port)
            .map_err(|_| format!("invalid MOTHERSHIP_CALLBACK_PORT='{}'", callback_port))?;

        let worker = WorkerConfig {
            tick_interval: parse_secs(envs, "MOTHERSHIP_WORKER_TICK_SECS", DEFAULT_TICK_INTERVAL)?,
            max_retries: parse_number(
                envs,
                "MOTHERSHIP_WORKER_MAX_RETRIES",
                u64::from(DEFAULT_MAX_RETRIES),
            )?
            .try_into()
            .map_err(|_| "MOTHERSHIP_WORKER_MAX_RETRIES is too large".to_string())?,
            max_duration: parse_secs(
                envs,
                "MOTHERSHIP_WORKER_MAX_DURATION_SECS",
                DEFAULT_MAX_DURATION,
            )?,
            dispatch_timeout: parse_secs(
                envs,
                "MOTHERSHIP_WORKER_DISPATCH_TIMEOUT_SECS",
                DEFAULT_DISPATCH_TIMEOUT,
            )?,
        };

        let bookkeeper = BookkeeperConfig {
            interval: parse_secs(
                envs,
                "MOTHERSHIP_BOOKKEEPER_INTERVAL_SECS",
                DEFAULT_BOOKKEEPING_INTERVAL,
            )?,
            // Runs still within the worker limit may have a live worker.
            orphan_timeout: parse_secs(
                envs,
                "MOTHERSHIP_BOOKKEEPER_ORPHAN_TIMEOUT_SECS",
                worker.max_duration,
            )?,
        };
        if bookkeeper.interval.is_zero() {
            return Err("MOTHERSHIP_BOOKKEEPER_INTERVAL_SECS must be greater than 0".to_string());
        }

        let cleaner = CleanerConfig {
            interval: parse_secs(envs, "MOTHERSHIP_CLEANER_INTERVAL_SECS", DEFAULT_CLEANER_INTERVAL)?,
            retain_reconciliations: parse_number(
                envs,
                "MOTHERSHIP_CLEANER_RETAIN_RECONCILIATIONS",
                DEFAULT_RETAIN_RECONCILIATIONS as u64,
            )?
            .try_into()
            .map_err(|_| "MOTHERSHIP_CLEANER_RETAIN_RECONCILIATIONS is too large".to_string())?,
            max_reconciliation_age: parse_secs(
                envs,
                "MOTHERSHIP_CLEANER_MAX_AGE_SECS",
                DEFAULT_MAX_ENTITY_AGE,
            )?,
            max_status_age: parse_secs(
                envs,
                "MOTHERSHIP_CLEANER_STATUS_MAX_AGE_SECS",
                DEFAULT_MAX_ENTITY_AGE,
            )?,
        };
        if cleaner.interval.is_zero() {
            return Err("MOTHERSHIP_CLEANER_INTERVAL_SECS must be greater than 0".to_string());
        }

        let mut reconcilers = HashMap::new();
        for (key, value) in envs {
            let Some(name) = key
                .strip_prefix(RECONCILER_URL_PREFIX)
                .and_then(|rest| rest.strip_suffix(RECONCILER_URL_SUFFIX))
            else {
                continue;
            };
            let url = value.trim();
            if name.is_empty() || url.is_empty() {
                return Err(format!("invalid reconciler entry {}='{}'", key, value));
            }
            reconcilers.insert(name.to_ascii_lowercase().replace('_', "-"), url.to_string());
        }

        Ok(Self {
            backend,
            sqlite_db_path: get("MOTHERSHIP_SQLITE_DB")
                .unwrap_or_else(|| default_sqlite_db_path.to_string()),
            postgres_dsn,
            listen_addr: get("MOTHERSHIP_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            pool_size: pool_size as usize,
            watch_interval: parse_secs(envs, "MOTHERSHIP_WATCH_INTERVAL_SECS", DEFAULT_WATCH_INTERVAL)?,
            reconcile_interval: parse_secs(
                envs,
                "MOTHERSHIP_RECONCILE_INTERVAL_SECS",
                DEFAULT_RECONCILE_INTERVAL,
            )?,
            worker,
            status_max_retries: parse_number(
                envs,
                "MOTHERSHIP_STATUS_MAX_RETRIES",
                DEFAULT_STATUS_MAX_RETRIES as u64,
            )? as usize,
            callback: CallbackEndpoint {
                scheme: get("MOTHERSHIP_CALLBACK_SCHEME").unwrap_or_else(|| "http".to_string()),
                host: get("MOTHERSHIP_CALLBACK_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: callback_port,
            },
            prerequisites: parse_list(envs, "MOTHERSHIP_PREREQUISITES"),
            crd_components: parse_list(envs, "MOTHERSHIP_CRD_COMPONENTS"),
            default_reconciler: get("MOTHERSHIP_DEFAULT_RECONCILER")
                .map(|v| v.to_ascii_lowercase())
                .unwrap_or_else(|| DEFAULT_RECONCILER.to_string()),
            reconcilers,
            purge_deleted: envs
                .get("MOTHERSHIP_PURGE_DELETED")
                .map(|v| parse_bool(v))
                .unwrap_or(false),
            bookkeeper,
            cleaner,
        })
    }

    pub fn component_order(&self) -> ComponentOrder {
        ComponentOrder {
            crd_component: CRD_COMPONENT.to_string(),
            prerequisites: self.prerequisites.clone(),
            crd_components: self.crd_components.clone(),
        }
    }

    pub fn watch_config(&self) -> InventoryWatchConfig {
        InventoryWatchConfig {
            watch_interval: self.watch_interval,
            reconcile_interval: self.reconcile_interval,
        }
    }

    pub fn transition_config(&self) -> TransitionConfig {
        TransitionConfig {
            max_retries: self.status_max_retries,
            purge_deleted: self.purge_deleted,
        }
    }

    /// Reconciler URLs by component. Fails when the default reconciler has no URL.
    pub fn reconciler_registry(&self) -> Result<ReconcilerRegistry<String>, SchedulerError> {
        ReconcilerRegistry::new(self.reconcilers.clone(), self.default_reconciler.as_str())
    }

    pub fn remote_scheduler_config(&self) -> RemoteSchedulerConfig {
        RemoteSchedulerConfig {
            pool_size: self.pool_size,
            progress_timeout: DEFAULT_PROGRESS_TIMEOUT,
        }
    }
}

fn parse_number(envs: &HashMap<String, String>, key: &str, default: u64) -> Result<u64, String> {
    match envs.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| format!("invalid {}='{}'. expected a non-negative integer", key, raw)),
        None => Ok(default),
    }
}

fn parse_secs(
    envs: &HashMap<String, String>,
    key: &str,
    default: Duration,
) -> Result<Duration, String> {
    parse_number(envs, key, default.as_secs()).map(Duration::from_secs)
}

fn parse_list(envs: &HashMap<String, String>, key: &str) -> Vec<String> {
    envs.get(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
