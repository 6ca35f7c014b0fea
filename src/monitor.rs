use std::sync::mpsc::Receiver;

use chrono::Utc;
use log::info;

use crate::{
    KartcamError,
    config::AppConfig,
    fleet::{
        Assignment, DeviceRecord, DeviceStateMachine, EventPublisher, EventSubscriber,
        FleetEvent, FleetRegistry, FleetSummary, KartAssignmentService, NotificationDispatcher,
        RandomSource, SeededRandom, TickScheduler, VideoFilter, VideoRecord, spawn_fleet,
    },
};

/// The running fleet: one registry plus the services that advance and query it.
///
/// This is the surface presentation layers talk to: snapshots for reads, `assign` for
/// commands and subscriptions for notifications.
pub struct FleetMonitor {
    registry: FleetRegistry,
    dispatcher: NotificationDispatcher,
    scheduler: TickScheduler,
    assignments: KartAssignmentService,
    seed: Option<u64>,
    low_battery_threshold: u8,
}

impl FleetMonitor {
    /// Builds the fleet described by `config`, randomizing starting values with `random`.
    pub fn new(config: &AppConfig, random: &mut dyn RandomSource) -> Result<Self, KartcamError> {
        config.validate()?;
        let machine = DeviceStateMachine::new(config.transition_config())?;
        let devices = spawn_fleet(
            &config.fleet_layout(),
            &config.error_reasons,
            random,
            Utc::now(),
        );
        let registry = FleetRegistry::new(devices);
        let dispatcher = NotificationDispatcher::start()?;
        let scheduler = TickScheduler::new(
            registry.clone(),
            machine,
            dispatcher.publisher(),
            config.scheduler_config(),
        )?;
        let assignments = KartAssignmentService::new(registry.clone(), dispatcher.publisher());

        info!("Fleet of {} cameras ready", registry.device_count());
        Ok(Self {
            registry,
            dispatcher,
            scheduler,
            assignments,
            seed: config.seed,
            low_battery_threshold: config.low_battery_threshold,
        })
    }

    /// Builds the fleet seeded from the config, or from entropy when no seed is set.
    pub fn from_config(config: &AppConfig) -> Result<Self, KartcamError> {
        let mut random = match config.seed {
            Some(seed) => SeededRandom::new(seed),
            None => SeededRandom::from_entropy(),
        };
        Self::new(config, &mut random)
    }

    /// Starts both periodic cycles.
    pub fn start(&mut self) -> Result<(), KartcamError> {
        let (reconcile_random, discovery_random) = match self.seed {
            Some(seed) => (
                SeededRandom::new(seed.wrapping_add(1)),
                SeededRandom::new(seed.wrapping_add(2)),
            ),
            None => (SeededRandom::from_entropy(), SeededRandom::from_entropy()),
        };
        self.scheduler.start(reconcile_random, discovery_random)
    }

    /// Stops the cycles, then drains pending notifications. No commits happen after the
    /// scheduler half returns.
    pub fn stop(&mut self) -> Result<(), KartcamError> {
        self.scheduler.stop()?;
        self.dispatcher.shutdown()
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn registry(&self) -> &FleetRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &TickScheduler {
        &self.scheduler
    }

    pub fn publisher(&self) -> EventPublisher {
        self.dispatcher.publisher()
    }

    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.registry.snapshot_all()
    }

    pub fn device(&self, device_id: u32) -> Option<DeviceRecord> {
        self.registry.snapshot_device(device_id)
    }

    pub fn videos(&self, filter: VideoFilter) -> Vec<VideoRecord> {
        self.registry.snapshot_videos(filter)
    }

    /// Status counts for the current snapshot, low battery measured against the
    /// configured threshold.
    pub fn summary(&self) -> FleetSummary {
        FleetSummary::from_devices(&self.registry.snapshot_all(), self.low_battery_threshold)
    }

    pub fn assign(&self, device_id: u32, kart_id: u32) -> Result<Assignment, KartcamError> {
        self.assignments.assign(device_id, kart_id)
    }

    pub fn subscribe(&self, subscriber: impl EventSubscriber + 'static) {
        self.dispatcher.subscribe(subscriber);
    }

    pub fn subscribe_channel(&self, name: impl Into<String>) -> Receiver<FleetEvent> {
        self.dispatcher.subscribe_channel(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::ScriptedRandom;

    #[test]
    fn test_monitor_builds_configured_fleet() {
        let config = AppConfig {
            camera_count: 4,
            camera_name_prefix: "Cam".to_string(),
            ..Default::default()
        };
        let monitor = FleetMonitor::new(&config, &mut ScriptedRandom::new(Vec::new())).unwrap();

        let devices = monitor.devices();
        assert_eq!(devices.len(), 4);
        assert_eq!(devices[3].name, "Cam 4");
        assert_eq!(monitor.summary().total(), 4);
        assert!(monitor.videos(VideoFilter::All).is_empty());
    }

    #[test]
    fn test_summary_uses_configured_low_battery_threshold() {
        let config = AppConfig {
            camera_count: 3,
            low_battery_threshold: 101,
            ..Default::default()
        };
        assert!(FleetMonitor::new(&config, &mut ScriptedRandom::new(Vec::new())).is_err());

        let config = AppConfig {
            camera_count: 3,
            low_battery_threshold: 100,
            ..Default::default()
        };
        let monitor = FleetMonitor::new(&config, &mut ScriptedRandom::new(Vec::new())).unwrap();

        // every spawned battery level is below 100
        assert_eq!(monitor.summary().low_battery, 3);
    }

    #[test]
    fn test_monitor_rejects_invalid_config() {
        let config = AppConfig {
            camera_count: 0,
            ..Default::default()
        };
        assert!(FleetMonitor::from_config(&config).is_err());
    }

    #[test]
    fn test_monitor_start_stop() {
        let config = AppConfig {
            camera_count: 2,
            reconcile_interval_ms: 5,
            discovery_interval_ms: 5,
            seed: Some(3),
            ..Default::default()
        };
        let mut monitor = FleetMonitor::from_config(&config).unwrap();

        monitor.start().unwrap();
        assert!(monitor.is_running());
        monitor.stop().unwrap();
        assert!(!monitor.is_running());
    }
}
