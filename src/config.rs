use std::{
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    KartcamError,
    fleet::{
        CameraStatus, FleetLayout, LOW_BATTERY_THRESHOLD, SchedulerConfig, TransitionConfig,
        scheduler::{
            DEFAULT_DISCOVERY_INTERVAL_MS, DEFAULT_DISCOVERY_PROBABILITY,
            DEFAULT_RECONCILE_INTERVAL_MS,
        },
    },
};

const CONFIG_DIR_NAME: &str = "kartcam";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub camera_count: u32,
    pub camera_name_prefix: String,
    pub reconcile_interval_ms: u64,
    pub discovery_interval_ms: u64,
    pub discovery_probability: f64,
    pub battery_update_probability: f64,
    pub battery_charge_step_max: u8,
    pub battery_drain_step_max: u8,
    pub low_battery_threshold: u8,
    pub download_step_min: u8,
    pub download_step_max: u8,
    pub memory_accrual_probability: f64,
    pub memory_increment_bytes: u64,
    pub memory_total_bytes: u64,
    pub spontaneous_transition_probability: f64,
    pub spontaneous_targets: Vec<CameraStatus>,
    pub error_message_probability: f64,
    pub error_reasons: Vec<String>,
    /// Seed for reproducible runs, entropy seeded when absent
    pub seed: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let transitions = TransitionConfig::default();
        let layout = FleetLayout::default();
        Self {
            camera_count: layout.camera_count,
            camera_name_prefix: layout.name_prefix,
            reconcile_interval_ms: DEFAULT_RECONCILE_INTERVAL_MS,
            discovery_interval_ms: DEFAULT_DISCOVERY_INTERVAL_MS,
            discovery_probability: DEFAULT_DISCOVERY_PROBABILITY,
            battery_update_probability: transitions.battery_update_probability,
            battery_charge_step_max: transitions.battery_charge_step_max,
            battery_drain_step_max: transitions.battery_drain_step_max,
            low_battery_threshold: LOW_BATTERY_THRESHOLD,
            download_step_min: transitions.download_step_min,
            download_step_max: transitions.download_step_max,
            memory_accrual_probability: transitions.memory_accrual_probability,
            memory_increment_bytes: transitions.memory_increment_bytes,
            memory_total_bytes: layout.memory_total_bytes,
            spontaneous_transition_probability: transitions.spontaneous_transition_probability,
            spontaneous_targets: transitions.spontaneous_targets,
            error_message_probability: transitions.error_message_probability,
            error_reasons: transitions.error_reasons,
            seed: None,
        }
    }
}

impl AppConfig {
    pub fn default_path() -> Result<PathBuf, KartcamError> {
        Ok(dirs::config_dir()
            .ok_or(KartcamError::NoConfigDir)?
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME))
    }

    /// Loads the config from the user's config directory. Returns `None` when there is no
    /// config file or it cannot be read.
    pub fn from_local_file() -> Option<Self> {
        let config_path = Self::default_path().ok()?;
        if !config_path.exists() {
            debug!("No config file at {:?}, using defaults", config_path);
            return None;
        }
        match Self::from_file(&config_path) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Ignoring config file {:?}: {}", config_path, e);
                None
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, KartcamError> {
        let file = File::open(path).map_err(|e| KartcamError::ConfigIOError { source: e })?;
        serde_json::from_reader(file).map_err(|e| KartcamError::ConfigSerializeError { source: e })
    }

    pub fn save(&self) -> Result<(), KartcamError> {
        self.save_to(&Self::default_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<(), KartcamError> {
        if let Some(parent) = config_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| KartcamError::ConfigIOError { source: e })?;
            }
        }

        let file =
            File::create(config_path).map_err(|e| KartcamError::ConfigIOError { source: e })?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| KartcamError::ConfigSerializeError { source: e })
    }

    pub fn validate(&self) -> Result<(), KartcamError> {
        if self.camera_count == 0 {
            return Err(KartcamError::InvalidConfig {
                reason: "the fleet needs at least one camera".to_string(),
            });
        }
        if self.memory_increment_bytes > self.memory_total_bytes {
            return Err(KartcamError::InvalidConfig {
                reason: format!(
                    "memory increment {} exceeds the total memory {}",
                    self.memory_increment_bytes, self.memory_total_bytes
                ),
            });
        }
        self.transition_config().validate()?;
        self.scheduler_config().validate()
    }

    pub fn transition_config(&self) -> TransitionConfig {
        TransitionConfig {
            battery_update_probability: self.battery_update_probability,
            battery_charge_step_max: self.battery_charge_step_max,
            battery_drain_step_max: self.battery_drain_step_max,
            low_battery_threshold: self.low_battery_threshold,
            download_step_min: self.download_step_min,
            download_step_max: self.download_step_max,
            memory_accrual_probability: self.memory_accrual_probability,
            memory_increment_bytes: self.memory_increment_bytes,
            spontaneous_transition_probability: self.spontaneous_transition_probability,
            spontaneous_targets: self.spontaneous_targets.clone(),
            error_message_probability: self.error_message_probability,
            error_reasons: self.error_reasons.clone(),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            reconcile_interval: Duration::from_millis(self.reconcile_interval_ms),
            discovery_interval: Duration::from_millis(self.discovery_interval_ms),
            discovery_probability: self.discovery_probability,
        }
    }

    pub fn fleet_layout(&self) -> FleetLayout {
        FleetLayout {
            camera_count: self.camera_count,
            name_prefix: self.camera_name_prefix.clone(),
            memory_total_bytes: self.memory_total_bytes,
        }
    }
}
