pub mod assignment;
pub mod dispatcher;
pub mod random;
pub mod registry;
pub mod scheduler;
pub mod state_machine;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::KartcamError;

pub use assignment::{Assignment, KartAssignmentService};
pub use dispatcher::{
    ChannelSubscriber, EventPublisher, EventSubscriber, LogSubscriber, NotificationDispatcher,
};
pub use random::{RandomSource, ScriptedRandom, SeededRandom};
pub use registry::FleetRegistry;
pub use scheduler::{SchedulerConfig, TickScheduler};
pub use state_machine::{
    DeviceStateMachine, FleetLayout, Transition, TransitionConfig, spawn_fleet,
};

/// Default battery level below which a camera is considered low on battery.
pub const LOW_BATTERY_THRESHOLD: u8 = 20;
/// Battery level below which a camera is no longer considered healthy.
pub const MEDIUM_BATTERY_THRESHOLD: u8 = 50;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Idle,
    Recording,
    Downloading,
    Downloaded,
    Error,
}

impl CameraStatus {
    pub const ALL: [CameraStatus; 5] = [
        CameraStatus::Idle,
        CameraStatus::Recording,
        CameraStatus::Downloading,
        CameraStatus::Downloaded,
        CameraStatus::Error,
    ];
}

impl fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CameraStatus::Idle => "idle",
            CameraStatus::Recording => "recording",
            CameraStatus::Downloading => "downloading",
            CameraStatus::Downloaded => "downloaded",
            CameraStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Coarse battery classification used by status displays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatteryBand {
    Low,
    Medium,
    High,
}

impl BatteryBand {
    /// Classifies `level` against the configured low battery threshold, so a band of
    /// `Low` always agrees with `LowBatteryCrossed` notifications.
    pub fn from_level(level: u8, low_threshold: u8) -> Self {
        if level < low_threshold {
            BatteryBand::Low
        } else if level < MEDIUM_BATTERY_THRESHOLD.max(low_threshold) {
            BatteryBand::Medium
        } else {
            BatteryBand::High
        }
    }
}

/// Current observable state of one camera.
///
/// Records are only ever mutated by the [`FleetRegistry`], readers always work on
/// cloned snapshots.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: u32,
    pub name: String,
    /// Battery charge, 0 to 100 inclusive
    pub battery_level: u8,
    pub is_charging: bool,
    pub status: CameraStatus,
    /// Only present while `status == Downloading`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_progress: Option<u8>,
    /// Only present while `status == Error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Bytes of on-device storage in use
    pub memory_used: u64,
    /// Bytes of on-device storage available in total
    pub memory_total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_kart: Option<u32>,
    pub last_updated: DateTime<Utc>,
}

impl DeviceRecord {
    pub fn battery_band(&self, low_threshold: u8) -> BatteryBand {
        BatteryBand::from_level(self.battery_level, low_threshold)
    }

    pub fn is_low_battery(&self, low_threshold: u8) -> bool {
        self.battery_level < low_threshold
    }

    /// Applies a patch without touching `last_updated`, the registry owns that field.
    ///
    /// Fields tied to a status are normalized afterwards: progress only exists while
    /// downloading (starting at 0) and an error message only while in error.
    pub(crate) fn apply(&mut self, patch: &DevicePatch) {
        if let Some(battery_level) = patch.battery_level {
            self.battery_level = battery_level.min(100);
        }
        if let Some(is_charging) = patch.is_charging {
            self.is_charging = is_charging;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(download_progress) = patch.download_progress {
            self.download_progress = download_progress.map(|p| p.min(100));
        }
        if let Some(error_message) = &patch.error_message {
            self.error_message = error_message.clone();
        }
        if let Some(memory_used) = patch.memory_used {
            self.memory_used = memory_used.min(self.memory_total);
        }
        if let Some(assigned_kart) = patch.assigned_kart {
            self.assigned_kart = assigned_kart;
        }

        match self.status {
            CameraStatus::Downloading => {
                self.download_progress.get_or_insert(0);
            }
            _ => self.download_progress = None,
        }
        if self.status != CameraStatus::Error {
            self.error_message = None;
        }
    }
}

/// Partial update of a [`DeviceRecord`]. `None` leaves the field untouched, for optional
/// fields `Some(None)` clears the value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DevicePatch {
    pub battery_level: Option<u8>,
    pub is_charging: Option<bool>,
    pub status: Option<CameraStatus>,
    pub download_progress: Option<Option<u8>>,
    pub error_message: Option<Option<String>>,
    pub memory_used: Option<u64>,
    pub assigned_kart: Option<Option<u32>>,
}

/// One completed download.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: String,
    pub camera_id: u32,
    pub camera_name: String,
    pub timestamp: DateTime<Utc>,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_kart: Option<u32>,
}

impl VideoRecord {
    /// Builds the record for a download that completed on `device` at `completed_at`.
    pub fn completed(device: &DeviceRecord, completed_at: DateTime<Utc>) -> Self {
        Self {
            id: format!("{}-{}", completed_at.timestamp_micros(), device.id),
            camera_id: device.id,
            camera_name: device.name.clone(),
            timestamp: completed_at,
            file_name: format!(
                "camera{}_{}.mp4",
                device.id,
                completed_at.format("%Y%m%d_%H%M%S")
            ),
            assigned_kart: device.assigned_kart,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VideoFilter {
    #[default]
    All,
    Unassigned,
    Kart(u32),
}

impl VideoFilter {
    pub fn matches(&self, video: &VideoRecord) -> bool {
        match self {
            VideoFilter::All => true,
            VideoFilter::Unassigned => video.assigned_kart.is_none(),
            VideoFilter::Kart(kart) => video.assigned_kart == Some(*kart),
        }
    }

    /// Parses `all`, `unassigned` or a kart number.
    pub fn parse(value: &str) -> Result<Self, KartcamError> {
        match value.trim().to_lowercase().as_str() {
            "all" => Ok(VideoFilter::All),
            "unassigned" => Ok(VideoFilter::Unassigned),
            other => match other.parse::<u32>() {
                Ok(kart) if kart > 0 => Ok(VideoFilter::Kart(kart)),
                _ => Err(KartcamError::InvalidUserInput {
                    field: "kart".to_string(),
                    reason: format!("expected 'all', 'unassigned' or a kart number, got '{value}'"),
                }),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    LowBatteryCrossed,
    ErrorEntered,
    DownloadStarted,
    DownloadCompleted,
    KartAssigned,
}

/// Notification emitted by the state machine or the assignment service.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetEvent {
    pub kind: EventKind,
    pub device_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kart_id: Option<u32>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl FleetEvent {
    pub fn low_battery(device: &DeviceRecord, level: u8, at: DateTime<Utc>) -> Self {
        Self {
            kind: EventKind::LowBatteryCrossed,
            device_id: device.id,
            video_id: None,
            kart_id: None,
            message: format!("Low battery: {} at {}%", device.name, level),
            timestamp: at,
        }
    }

    pub fn error_entered(device: &DeviceRecord, reason: &str, at: DateTime<Utc>) -> Self {
        Self {
            kind: EventKind::ErrorEntered,
            device_id: device.id,
            video_id: None,
            kart_id: None,
            message: format!("Error: {}: {}", device.name, reason),
            timestamp: at,
        }
    }

    pub fn download_started(device: &DeviceRecord, at: DateTime<Utc>) -> Self {
        Self {
            kind: EventKind::DownloadStarted,
            device_id: device.id,
            video_id: None,
            kart_id: None,
            message: format!("Download started: {}", device.name),
            timestamp: at,
        }
    }

    pub fn download_completed(video: &VideoRecord) -> Self {
        Self {
            kind: EventKind::DownloadCompleted,
            device_id: video.camera_id,
            video_id: Some(video.id.clone()),
            kart_id: video.assigned_kart,
            message: format!("Download completed: {} ({})", video.camera_name, video.file_name),
            timestamp: video.timestamp,
        }
    }

    pub fn kart_assigned(
        device: &DeviceRecord,
        kart_id: u32,
        video_id: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        let message = match &video_id {
            Some(video_id) => format!("{} assigned to kart {} (video {})", device.name, kart_id, video_id),
            None => format!("{} assigned to kart {}", device.name, kart_id),
        };
        Self {
            kind: EventKind::KartAssigned,
            device_id: device.id,
            video_id,
            kart_id: Some(kart_id),
            message,
            timestamp: at,
        }
    }
}

/// Aggregate view of a fleet snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FleetSummary {
    pub idle: usize,
    pub recording: usize,
    pub downloading: usize,
    pub downloaded: usize,
    pub error: usize,
    pub low_battery: usize,
    pub charging: usize,
}

impl FleetSummary {
    pub fn from_devices(devices: &[DeviceRecord], low_threshold: u8) -> Self {
        let mut summary = FleetSummary::default();
        for device in devices {
            match device.status {
                CameraStatus::Idle => summary.idle += 1,
                CameraStatus::Recording => summary.recording += 1,
                CameraStatus::Downloading => summary.downloading += 1,
                CameraStatus::Downloaded => summary.downloaded += 1,
                CameraStatus::Error => summary.error += 1,
            }
            if device.is_low_battery(low_threshold) {
                summary.low_battery += 1;
            }
            if device.is_charging {
                summary.charging += 1;
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.idle + self.recording + self.downloading + self.downloaded + self.error
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{device, epoch};
    use super::*;

    #[test]
    fn test_video_record_derives_name_and_id() {
        let mut camera = device(3, CameraStatus::Downloading);
        camera.assigned_kart = Some(4);
        let video = VideoRecord::completed(&camera, epoch(0));

        assert_eq!(video.camera_id, 3);
        assert_eq!(video.camera_name, "Camera 3");
        assert_eq!(video.file_name, "camera3_20231114_221320.mp4");
        assert_eq!(video.id, format!("{}-3", epoch(0).timestamp_micros()));
        assert_eq!(video.assigned_kart, Some(4));
    }

    #[test]
    fn test_video_filter_parse() {
        assert_eq!(VideoFilter::parse("all").unwrap(), VideoFilter::All);
        assert_eq!(VideoFilter::parse("Unassigned").unwrap(), VideoFilter::Unassigned);
        assert_eq!(VideoFilter::parse("7").unwrap(), VideoFilter::Kart(7));
        assert!(VideoFilter::parse("0").is_err());
        assert!(VideoFilter::parse("kart").is_err());
    }

    #[test]
    fn test_battery_band() {
        let band = |level| BatteryBand::from_level(level, LOW_BATTERY_THRESHOLD);
        assert_eq!(band(0), BatteryBand::Low);
        assert_eq!(band(19), BatteryBand::Low);
        assert_eq!(band(20), BatteryBand::Medium);
        assert_eq!(band(49), BatteryBand::Medium);
        assert_eq!(band(50), BatteryBand::High);

        // a raised threshold moves the low band with it
        assert_eq!(BatteryBand::from_level(25, 30), BatteryBand::Low);
        assert_eq!(BatteryBand::from_level(30, 30), BatteryBand::Medium);
        assert_eq!(BatteryBand::from_level(55, 60), BatteryBand::Low);
        assert_eq!(BatteryBand::from_level(60, 60), BatteryBand::High);
    }

    #[test]
    fn test_patch_clears_optional_fields() {
        let mut camera = device(1, CameraStatus::Error);
        camera.error_message = Some("Storage full".to_string());

        camera.apply(&DevicePatch {
            status: Some(CameraStatus::Idle),
            error_message: Some(None),
            memory_used: Some(5_000),
            ..Default::default()
        });

        assert_eq!(camera.status, CameraStatus::Idle);
        assert_eq!(camera.error_message, None);
        assert_eq!(camera.memory_used, camera.memory_total);
    }

    #[test]
    fn test_device_serializes_camel_case_iso_timestamps() {
        let camera = device(2, CameraStatus::Downloading);
        let json = serde_json::to_value(&camera).unwrap();

        assert_eq!(json["batteryLevel"], 80);
        assert_eq!(json["downloadProgress"], 0);
        assert_eq!(json["status"], "downloading");
        assert_eq!(json["lastUpdated"], "2023-11-14T22:13:20Z");
        assert!(json.get("errorMessage").is_none());
    }

    #[test]
    fn test_fleet_summary() {
        let mut low = device(2, CameraStatus::Error);
        low.battery_level = 5;
        let devices = vec![device(1, CameraStatus::Idle), low, device(3, CameraStatus::Idle)];

        let summary = FleetSummary::from_devices(&devices, LOW_BATTERY_THRESHOLD);
        assert_eq!(summary.idle, 2);
        assert_eq!(summary.error, 1);
        assert_eq!(summary.low_battery, 1);
        assert_eq!(summary.total(), 3);

        // devices at 80% are low once the threshold is above them
        let summary = FleetSummary::from_devices(&devices, 90);
        assert_eq!(summary.low_battery, 3);
    }
}
