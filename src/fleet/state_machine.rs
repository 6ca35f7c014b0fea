use chrono::{DateTime, Utc};
use log::debug;

use crate::KartcamError;

use super::{
    CameraStatus, DeviceRecord, FleetEvent, LOW_BATTERY_THRESHOLD, VideoRecord,
    random::RandomSource,
};

const DEFAULT_BATTERY_UPDATE_PROBABILITY: f64 = 0.3;
const DEFAULT_BATTERY_CHARGE_STEP_MAX: u8 = 2;
const DEFAULT_BATTERY_DRAIN_STEP_MAX: u8 = 1;
const DEFAULT_DOWNLOAD_STEP_MIN: u8 = 5;
const DEFAULT_DOWNLOAD_STEP_MAX: u8 = 20;
const DEFAULT_MEMORY_ACCRUAL_PROBABILITY: f64 = 0.5;
pub(crate) const DEFAULT_MEMORY_INCREMENT_BYTES: u64 = 100 * 1024 * 1024;
pub(crate) const DEFAULT_MEMORY_TOTAL_BYTES: u64 = 32 * 1024 * 1024 * 1024;
const DEFAULT_SPONTANEOUS_TRANSITION_PROBABILITY: f64 = 0.1;
const DEFAULT_ERROR_MESSAGE_PROBABILITY: f64 = 0.5;
const INITIAL_CHARGING_PROBABILITY: f64 = 0.3;
const INITIAL_ERROR_MESSAGE_PROBABILITY: f64 = 0.2;

pub(crate) fn default_spontaneous_targets() -> Vec<CameraStatus> {
    vec![
        CameraStatus::Idle,
        CameraStatus::Recording,
        CameraStatus::Downloaded,
        CameraStatus::Error,
    ]
}

pub(crate) fn default_error_reasons() -> Vec<String> {
    vec![
        "Connection lost".to_string(),
        "Recording error".to_string(),
        "Storage full".to_string(),
    ]
}

/// Tunables of the per-device state machine.
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionConfig {
    pub battery_update_probability: f64,
    pub battery_charge_step_max: u8,
    pub battery_drain_step_max: u8,
    pub low_battery_threshold: u8,
    pub download_step_min: u8,
    pub download_step_max: u8,
    pub memory_accrual_probability: f64,
    pub memory_increment_bytes: u64,
    pub spontaneous_transition_probability: f64,
    /// States a spontaneous transition may land in
    pub spontaneous_targets: Vec<CameraStatus>,
    pub error_message_probability: f64,
    pub error_reasons: Vec<String>,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            battery_update_probability: DEFAULT_BATTERY_UPDATE_PROBABILITY,
            battery_charge_step_max: DEFAULT_BATTERY_CHARGE_STEP_MAX,
            battery_drain_step_max: DEFAULT_BATTERY_DRAIN_STEP_MAX,
            low_battery_threshold: LOW_BATTERY_THRESHOLD,
            download_step_min: DEFAULT_DOWNLOAD_STEP_MIN,
            download_step_max: DEFAULT_DOWNLOAD_STEP_MAX,
            memory_accrual_probability: DEFAULT_MEMORY_ACCRUAL_PROBABILITY,
            memory_increment_bytes: DEFAULT_MEMORY_INCREMENT_BYTES,
            spontaneous_transition_probability: DEFAULT_SPONTANEOUS_TRANSITION_PROBABILITY,
            spontaneous_targets: default_spontaneous_targets(),
            error_message_probability: DEFAULT_ERROR_MESSAGE_PROBABILITY,
            error_reasons: default_error_reasons(),
        }
    }
}

impl TransitionConfig {
    pub fn validate(&self) -> Result<(), KartcamError> {
        for (name, probability) in [
            ("battery_update_probability", self.battery_update_probability),
            ("memory_accrual_probability", self.memory_accrual_probability),
            (
                "spontaneous_transition_probability",
                self.spontaneous_transition_probability,
            ),
            ("error_message_probability", self.error_message_probability),
        ] {
            validate_probability(name, probability)?;
        }
        if self.download_step_min == 0 || self.download_step_min > self.download_step_max {
            return Err(KartcamError::InvalidConfig {
                reason: format!(
                    "download step range {}..={} must be non-empty and start above zero",
                    self.download_step_min, self.download_step_max
                ),
            });
        }
        if self.low_battery_threshold > 100 {
            return Err(KartcamError::InvalidConfig {
                reason: format!(
                    "low battery threshold {} is above 100",
                    self.low_battery_threshold
                ),
            });
        }
        if self.spontaneous_targets.is_empty() {
            return Err(KartcamError::InvalidConfig {
                reason: "at least one spontaneous transition target is required".to_string(),
            });
        }
        if self.error_reasons.is_empty() {
            return Err(KartcamError::InvalidConfig {
                reason: "at least one error reason is required".to_string(),
            });
        }
        Ok(())
    }
}

pub(crate) fn validate_probability(name: &str, probability: f64) -> Result<(), KartcamError> {
    if (0.0..=1.0).contains(&probability) {
        Ok(())
    } else {
        Err(KartcamError::InvalidConfig {
            reason: format!("{name} must be within [0, 1], got {probability}"),
        })
    }
}

/// Shape of the fleet created at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct FleetLayout {
    pub camera_count: u32,
    pub name_prefix: String,
    pub memory_total_bytes: u64,
}

impl Default for FleetLayout {
    fn default() -> Self {
        Self {
            camera_count: 10,
            name_prefix: "Camera".to_string(),
            memory_total_bytes: DEFAULT_MEMORY_TOTAL_BYTES,
        }
    }
}

/// Creates the fleet with randomized starting values. Ids start at 1.
pub fn spawn_fleet(
    layout: &FleetLayout,
    error_reasons: &[String],
    random: &mut dyn RandomSource,
    now: DateTime<Utc>,
) -> Vec<DeviceRecord> {
    (1..=layout.camera_count)
        .map(|id| {
            let battery_level = random.range_inclusive(0, 99) as u8;
            let is_charging = random.chance(INITIAL_CHARGING_PROBABILITY);
            let status = CameraStatus::ALL[random.pick(CameraStatus::ALL.len())];
            let download_progress = match status {
                CameraStatus::Downloading => Some(random.range_inclusive(0, 99) as u8),
                _ => None,
            };
            let error_message = match status {
                CameraStatus::Error if random.chance(INITIAL_ERROR_MESSAGE_PROBABILITY) => {
                    error_reasons.first().cloned()
                }
                _ => None,
            };
            let memory_used = (random.next_unit() * layout.memory_total_bytes as f64) as u64;

            DeviceRecord {
                id,
                name: format!("{} {}", layout.name_prefix, id),
                battery_level,
                is_charging,
                status,
                download_progress,
                error_message,
                memory_used: memory_used.min(layout.memory_total_bytes),
                memory_total: layout.memory_total_bytes,
                assigned_kart: None,
                last_updated: now,
            }
        })
        .collect()
}

/// Outcome of advancing one device by one tick.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub next: DeviceRecord,
    /// Set when the tick completed a download
    pub video: Option<VideoRecord>,
    pub events: Vec<FleetEvent>,
}

/// Pure per-device transition function.
///
/// Random draws are taken in a fixed order, which tests rely on:
/// 1. battery: `chance(battery_update_probability)`, then the step size when selected
/// 2. download (only while downloading): the progress step
/// 3. memory (only while recording): `chance(memory_accrual_probability)`
/// 4. spontaneous transition (skipped when the tick starts in `downloading`, including the
///    tick that completes the download): `chance`, target index, and for
///    `error` targets `chance(error_message_probability)` followed by the reason index
#[derive(Clone, Debug, Default)]
pub struct DeviceStateMachine {
    config: TransitionConfig,
}

impl DeviceStateMachine {
    pub fn new(config: TransitionConfig) -> Result<Self, KartcamError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TransitionConfig {
        &self.config
    }

    pub fn advance(
        &self,
        device: &DeviceRecord,
        now: DateTime<Utc>,
        random: &mut dyn RandomSource,
    ) -> Transition {
        let mut next = device.clone();
        let mut events = Vec::new();
        let mut video = None;

        self.update_battery(&mut next, now, random, &mut events);

        if next.status == CameraStatus::Downloading {
            let step = random.range_inclusive(
                self.config.download_step_min as u32,
                self.config.download_step_max as u32,
            );
            let progress = (next.download_progress.unwrap_or(0) as u32 + step).min(100) as u8;
            if progress >= 100 {
                next.status = CameraStatus::Downloaded;
                next.download_progress = None;
                let record = VideoRecord::completed(&next, now);
                events.push(FleetEvent::download_completed(&record));
                video = Some(record);
            } else {
                next.download_progress = Some(progress);
            }
        }

        if next.status == CameraStatus::Recording
            && random.chance(self.config.memory_accrual_probability)
        {
            next.memory_used = next
                .memory_used
                .saturating_add(self.config.memory_increment_bytes)
                .min(next.memory_total);
        }

        // a device that started the tick downloading only finishes or keeps downloading
        if device.status != CameraStatus::Downloading
            && random.chance(self.config.spontaneous_transition_probability)
        {
            self.spontaneous_transition(&mut next, now, random, &mut events);
        }

        next.last_updated = now;
        Transition {
            next,
            video,
            events,
        }
    }

    /// Moves an eligible device into `downloading`. Devices already downloading or in
    /// error are left alone and `None` is returned.
    pub fn start_download(&self, device: &DeviceRecord, now: DateTime<Utc>) -> Option<Transition> {
        if matches!(
            device.status,
            CameraStatus::Downloading | CameraStatus::Error
        ) {
            return None;
        }
        let mut next = device.clone();
        next.status = CameraStatus::Downloading;
        next.download_progress = Some(0);
        next.error_message = None;
        next.last_updated = now;
        let events = vec![FleetEvent::download_started(&next, now)];
        Some(Transition {
            next,
            video: None,
            events,
        })
    }

    fn update_battery(
        &self,
        next: &mut DeviceRecord,
        now: DateTime<Utc>,
        random: &mut dyn RandomSource,
        events: &mut Vec<FleetEvent>,
    ) {
        if !random.chance(self.config.battery_update_probability) {
            return;
        }
        let previous = next.battery_level.min(100);
        let level = if next.is_charging {
            let step = random.range_inclusive(0, self.config.battery_charge_step_max as u32);
            (previous as u32 + step).min(100) as u8
        } else {
            let step = random.range_inclusive(0, self.config.battery_drain_step_max as u32);
            (previous as u32).saturating_sub(step) as u8
        };
        next.battery_level = level;

        let threshold = self.config.low_battery_threshold;
        if previous >= threshold && level < threshold {
            events.push(FleetEvent::low_battery(next, level, now));
        }
    }

    fn spontaneous_transition(
        &self,
        next: &mut DeviceRecord,
        now: DateTime<Utc>,
        random: &mut dyn RandomSource,
        events: &mut Vec<FleetEvent>,
    ) {
        let targets = &self.config.spontaneous_targets;
        if targets.is_empty() {
            return;
        }
        let status = targets[random.pick(targets.len())];
        debug!("{} spontaneously moves {} -> {}", next.name, next.status, status);
        next.status = status;
        next.error_message = None;
        next.download_progress = None;

        match status {
            CameraStatus::Error => {
                if random.chance(self.config.error_message_probability) {
                    let reasons = &self.config.error_reasons;
                    if let Some(reason) = reasons.get(random.pick(reasons.len())) {
                        events.push(FleetEvent::error_entered(next, reason, now));
                        next.error_message = Some(reason.clone());
                    }
                }
            }
            CameraStatus::Downloading => {
                next.download_progress = Some(0);
                events.push(FleetEvent::download_started(next, now));
            }
            _ => {}
        }
    }
}
