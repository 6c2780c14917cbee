// Groupcast Engine — Configuration
// EngineConfig and its sections, TOML loading, environment overrides.
//
// Every section is `#[serde(default)]` so a config file only needs the keys
// an operator wants to change. Delays are milliseconds; tests build configs
// with `EngineConfig::immediate()` so no loop ever sleeps.

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::PlanStatus;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub gateway: GatewayConfig,
    pub lifecycle: LifecycleConfig,
    pub sync: SyncConfig,
    pub reaper: ReaperConfig,
    pub storage: StorageConfig,
    pub plan: PlanConfig,
}

// ── Sections ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Channel-scoped REST surface (bearer = channel token).
    pub base_url: String,
    /// Partner manager surface for channel CRUD (bearer = partner token).
    pub partner_url: String,
    pub partner_token: String,
    /// Partner project new channels are provisioned under.
    pub project_id: String,
    pub request_timeout_secs: u64,
    /// Client-side retries for idempotent GETs on 429/5xx/timeout.
    pub max_retries: u32,
    /// Multiplier applied to client retry sleeps (0.0 in tests).
    pub retry_scale: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            base_url: DEFAULT_GATEWAY_URL.into(),
            partner_url: DEFAULT_PARTNER_URL.into(),
            partner_token: String::new(),
            project_id: String::new(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_retries: DEFAULT_GATEWAY_RETRIES,
            retry_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub ready_base_delay_ms: u64,
    pub ready_max_delay_ms: u64,
    pub ready_max_attempts: u32,
    /// Spawn the readiness poll right after `create_channel`.
    pub auto_poll_ready: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            ready_base_delay_ms: DEFAULT_READY_BASE_MS,
            ready_max_delay_ms: DEFAULT_READY_MAX_MS,
            ready_max_attempts: DEFAULT_READY_MAX_ATTEMPTS,
            auto_poll_ready: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub collection_batch_size: u32,
    pub max_api_calls: u32,
    pub pace_base_ms: u64,
    pub pace_step_ms: u64,
    pub pace_ceiling_ms: u64,
    pub rate_limit_base_ms: u64,
    pub rate_limit_ceiling_ms: u64,
    pub max_consecutive_rate_limits: u32,
    pub classify_batch_size: usize,
    pub classify_item_retries: u32,
    pub cooldown_secs: i64,
    pub progress_stale_secs: i64,
    pub broadcast_pace_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            collection_batch_size: DEFAULT_GROUP_BATCH,
            max_api_calls: DEFAULT_MAX_API_CALLS,
            pace_base_ms: DEFAULT_PACE_BASE_MS,
            pace_step_ms: DEFAULT_PACE_STEP_MS,
            pace_ceiling_ms: DEFAULT_PACE_CEILING_MS,
            rate_limit_base_ms: DEFAULT_RATE_LIMIT_BASE_MS,
            rate_limit_ceiling_ms: DEFAULT_RATE_LIMIT_CEILING_MS,
            max_consecutive_rate_limits: DEFAULT_MAX_CONSECUTIVE_RATE_LIMITS,
            classify_batch_size: DEFAULT_CLASSIFY_BATCH,
            classify_item_retries: DEFAULT_CLASSIFY_ITEM_RETRIES,
            cooldown_secs: DEFAULT_SYNC_COOLDOWN_SECS,
            progress_stale_secs: DEFAULT_PROGRESS_STALE_SECS,
            broadcast_pace_ms: DEFAULT_BROADCAST_PACE_MS,
        }
    }
}

impl SyncConfig {
    /// Requested batch size, clamped to the gateway-safe range.
    pub fn batch_size(&self) -> u32 {
        self.collection_batch_size.clamp(1, MAX_GROUP_BATCH)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub transient_timeout_mins: i64,
    pub revalidate_after_hours: i64,
    pub abandoned_run_mins: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig {
            transient_timeout_mins: DEFAULT_TRANSIENT_TIMEOUT_MINS,
            revalidate_after_hours: DEFAULT_REVALIDATE_AFTER_HOURS,
            abandoned_run_mins: DEFAULT_ABANDONED_RUN_MINS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to `<data dir>/groupcast/groupcast.db`.
    pub db_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(DATA_DIR_NAME)
                .join(DB_FILE_NAME)
        })
    }
}

/// Static plan table for deployments without a billing collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    pub default_plan: PlanStatus,
    pub users: HashMap<String, PlanStatus>,
}

impl Default for PlanConfig {
    fn default() -> Self {
        PlanConfig { default_plan: PlanStatus::Trial, users: HashMap::new() }
    }
}

// ── Loading ────────────────────────────────────────────────────────────────

impl EngineConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> EngineResult<Self> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` (if it exists) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                info!("[config] Loading {:?}", p);
                Self::from_toml(&std::fs::read_to_string(p)?)?
            }
            Some(p) => {
                info!("[config] {:?} not found, using defaults", p);
                EngineConfig::default()
            }
            None => EngineConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides for endpoints and secrets.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("GROUPCAST_GATEWAY_URL") {
            self.gateway.base_url = v;
        }
        if let Some(v) = lookup("GROUPCAST_PARTNER_URL") {
            self.gateway.partner_url = v;
        }
        if let Some(v) = lookup("GROUPCAST_PARTNER_TOKEN") {
            self.gateway.partner_token = v;
        }
        if let Some(v) = lookup("GROUPCAST_DB_PATH") {
            self.storage.db_path = Some(PathBuf::from(v));
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.sync.classify_batch_size == 0 {
            return Err(EngineError::Config("sync.classify_batch_size must be > 0".into()));
        }
        if self.sync.max_api_calls == 0 {
            return Err(EngineError::Config("sync.max_api_calls must be > 0".into()));
        }
        if self.lifecycle.ready_max_attempts == 0 {
            return Err(EngineError::Config("lifecycle.ready_max_attempts must be > 0".into()));
        }
        if self.gateway.retry_scale < 0.0 {
            return Err(EngineError::Config("gateway.retry_scale must be >= 0".into()));
        }
        Ok(())
    }

    /// Same shape as the defaults with every sleep set to zero.
    pub fn immediate() -> Self {
        let mut config = EngineConfig::default();
        config.gateway.retry_scale = 0.0;
        config.lifecycle.ready_base_delay_ms = 0;
        config.lifecycle.ready_max_delay_ms = 0;
        config.lifecycle.auto_poll_ready = false;
        config.sync.pace_base_ms = 0;
        config.sync.pace_step_ms = 0;
        config.sync.pace_ceiling_ms = 0;
        config.sync.rate_limit_base_ms = 0;
        config.sync.rate_limit_ceiling_ms = 0;
        config.sync.broadcast_pace_ms = 0;
        config
    }
}
