use std::{
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::KartcamError;

use super::{
    DeviceStateMachine, EventPublisher, FleetEvent, FleetRegistry, random::RandomSource,
    state_machine::validate_probability,
};

pub const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_DISCOVERY_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_DISCOVERY_PROBABILITY: f64 = 0.3;

const RECONCILE_CYCLE: &str = "reconcile";
const DISCOVERY_CYCLE: &str = "discovery";

#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerConfig {
    pub reconcile_interval: Duration,
    pub discovery_interval: Duration,
    /// Chance that a discovery firing picks a camera at all
    pub discovery_probability: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_millis(DEFAULT_RECONCILE_INTERVAL_MS),
            discovery_interval: Duration::from_millis(DEFAULT_DISCOVERY_INTERVAL_MS),
            discovery_probability: DEFAULT_DISCOVERY_PROBABILITY,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), KartcamError> {
        if self.reconcile_interval.is_zero() || self.discovery_interval.is_zero() {
            return Err(KartcamError::InvalidConfig {
                reason: "cycle intervals must be greater than zero".to_string(),
            });
        }
        validate_probability("discovery_probability", self.discovery_probability)
    }
}

/// Everything one cycle needs to advance the fleet. Cheap to clone, every field is a
/// handle onto shared state.
#[derive(Clone)]
struct CycleContext {
    registry: FleetRegistry,
    machine: DeviceStateMachine,
    publisher: EventPublisher,
    discovery_probability: f64,
}

impl CycleContext {
    fn reconcile(&self, random: &mut dyn RandomSource) -> Vec<FleetEvent> {
        let events = self
            .registry
            .commit_batch(|device, now| Some(self.machine.advance(device, now, &mut *random)));
        self.publish(&events);
        events
    }

    fn discover(&self, random: &mut dyn RandomSource) -> Vec<FleetEvent> {
        if !random.chance(self.discovery_probability) {
            return Vec::new();
        }
        let ids = self.registry.device_ids();
        if ids.is_empty() {
            return Vec::new();
        }
        let device_id = ids[random.pick(ids.len())];
        let events = match self
            .registry
            .commit_device(device_id, |device, now| self.machine.start_download(device, now))
        {
            Ok(events) => events,
            Err(e) => {
                warn!("Discovery could not update camera {}: {}", device_id, e);
                Vec::new()
            }
        };
        if events.is_empty() {
            debug!("Discovery picked camera {}, not eligible for a download", device_id);
        }
        self.publish(&events);
        events
    }

    fn publish(&self, events: &[FleetEvent]) {
        // state is already committed, a closed dispatcher only loses the notification
        if let Err(e) = self.publisher.publish_all(events.iter().cloned()) {
            warn!("Could not queue {} fleet events: {}", events.len(), e);
        }
    }
}

struct RunningCycle {
    name: &'static str,
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Drives the reconciliation and discovery cycles.
///
/// Both cycles can also be fired by hand with [`TickScheduler::reconcile_once`] and
/// [`TickScheduler::discover_once`], which is how tests drive the fleet deterministically.
pub struct TickScheduler {
    context: CycleContext,
    config: SchedulerConfig,
    running: Vec<RunningCycle>,
}

impl TickScheduler {
    pub fn new(
        registry: FleetRegistry,
        machine: DeviceStateMachine,
        publisher: EventPublisher,
        config: SchedulerConfig,
    ) -> Result<Self, KartcamError> {
        config.validate()?;
        Ok(Self {
            context: CycleContext {
                registry,
                machine,
                publisher,
                discovery_probability: config.discovery_probability,
            },
            config,
            running: Vec::new(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        !self.running.is_empty()
    }

    /// One reconciliation firing: advances every camera and commits the batch.
    pub fn reconcile_once(&self, random: &mut dyn RandomSource) -> Vec<FleetEvent> {
        self.context.reconcile(random)
    }

    /// One discovery firing: maybe starts a download on a randomly chosen camera.
    pub fn discover_once(&self, random: &mut dyn RandomSource) -> Vec<FleetEvent> {
        self.context.discover(random)
    }

    /// Spawns one thread per cycle. Each cycle owns its random source.
    pub fn start<R>(&mut self, reconcile_random: R, discovery_random: R) -> Result<(), KartcamError>
    where
        R: RandomSource + Send + 'static,
    {
        if self.is_running() {
            return Err(KartcamError::SchedulerAlreadyRunning);
        }

        let reconcile_context = self.context.clone();
        let mut reconcile_random = reconcile_random;
        let reconcile = spawn_cycle(RECONCILE_CYCLE, self.config.reconcile_interval, move || {
            reconcile_context.reconcile(&mut reconcile_random);
        })?;
        self.running.push(reconcile);

        let discovery_context = self.context.clone();
        let mut discovery_random = discovery_random;
        match spawn_cycle(DISCOVERY_CYCLE, self.config.discovery_interval, move || {
            discovery_context.discover(&mut discovery_random);
        }) {
            Ok(cycle) => self.running.push(cycle),
            Err(e) => return Err(self.abandon_start(e)),
        }

        info!(
            "Tick scheduler started: reconcile every {:?}, discovery every {:?}",
            self.config.reconcile_interval, self.config.discovery_interval
        );
        Ok(())
    }

    /// Stops whatever cycles a failed `start` already spawned and hands back the cause.
    fn abandon_start(&mut self, cause: KartcamError) -> KartcamError {
        if let Err(stop_error) = self.stop() {
            warn!(
                "Error while stopping cycles after a failed start: {}",
                stop_error
            );
        }
        cause
    }

    /// Stops both cycles and waits for them. Once this returns no further commits happen.
    /// Safe to call when the scheduler is not running.
    pub fn stop(&mut self) -> Result<(), KartcamError> {
        if self.running.is_empty() {
            return Ok(());
        }
        for cycle in &self.running {
            // a cycle that already exited has dropped its receiver
            let _ = cycle.stop.send(());
        }
        let mut result = Ok(());
        for cycle in self.running.drain(..) {
            if cycle.handle.join().is_err() {
                result = Err(KartcamError::ThreadJoinError {
                    name: format!("{} cycle", cycle.name),
                });
            }
        }
        info!("Tick scheduler stopped");
        result
    }
}

impl Drop for TickScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Error while stopping tick scheduler: {}", e);
        }
    }
}

fn spawn_cycle<F>(
    name: &'static str,
    interval: Duration,
    tick: F,
) -> Result<RunningCycle, KartcamError>
where
    F: FnMut() + Send + 'static,
{
    let (stop, stop_rx) = mpsc::channel::<()>();
    let handle = thread::Builder::new()
        .name(format!("kartcam-{name}"))
        .spawn(move || run_cycle(name, interval, stop_rx, tick))
        .map_err(|e| KartcamError::ThreadSpawnError {
            name: format!("{name} cycle"),
            source: e,
        })?;
    Ok(RunningCycle { name, stop, handle })
}

/// Fires `tick` at a fixed rate until a stop signal arrives or the stop sender is dropped.
fn run_cycle<F>(name: &str, interval: Duration, stop: Receiver<()>, mut tick: F)
where
    F: FnMut(),
{
    let mut next_fire = Instant::now() + interval;
    loop {
        let wait = next_fire.saturating_duration_since(Instant::now());
        match stop.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {
                tick();
                next_fire += interval;
                let now = Instant::now();
                if next_fire < now {
                    debug!("{} cycle overran its interval, skipping missed firings", name);
                    next_fire = now + interval;
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("{} cycle exited", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{
        CameraStatus, EventKind, EventSubscriber, NotificationDispatcher, ScriptedRandom,
        SeededRandom, test_support::device,
    };

    fn setup(statuses: &[CameraStatus]) -> (FleetRegistry, NotificationDispatcher, TickScheduler) {
        let registry = FleetRegistry::new(
            statuses
                .iter()
                .enumerate()
                .map(|(i, status)| device(i as u32 + 1, *status))
                .collect(),
        );
        let dispatcher = NotificationDispatcher::start().unwrap();
        let scheduler = TickScheduler::new(
            registry.clone(),
            DeviceStateMachine::default(),
            dispatcher.publisher(),
            SchedulerConfig {
                reconcile_interval: Duration::from_millis(5),
                discovery_interval: Duration::from_millis(5),
                discovery_probability: 1.0,
            },
        )
        .unwrap();
        (registry, dispatcher, scheduler)
    }

    #[test]
    fn test_discovery_starts_download_on_idle_camera() {
        let (registry, _dispatcher, scheduler) =
            setup(&[CameraStatus::Idle, CameraStatus::Idle, CameraStatus::Idle]);
        // selected, pick index 2 -> camera 3
        let mut random = ScriptedRandom::new([0.0, 0.7]);

        let events = scheduler.discover_once(&mut random);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::DownloadStarted);
        assert_eq!(events[0].device_id, 3);
        let camera = registry.snapshot_device(3).unwrap();
        assert_eq!(camera.status, CameraStatus::Downloading);
        assert_eq!(camera.download_progress, Some(0));
    }

    #[test]
    fn test_discovery_skips_ineligible_camera_without_retry() {
        let (registry, _dispatcher, scheduler) =
            setup(&[CameraStatus::Error, CameraStatus::Downloading]);
        let before = registry.snapshot_all();

        for pick in [0.0, 0.9] {
            let mut random = ScriptedRandom::new([0.0, pick]);
            assert!(scheduler.discover_once(&mut random).is_empty());
            assert_eq!(random.remaining(), 0);
        }
        assert_eq!(registry.snapshot_all(), before);
    }

    #[test]
    fn test_discovery_draw_can_fail() {
        let (registry, _dispatcher, mut scheduler) = setup(&[CameraStatus::Idle]);
        scheduler.context.discovery_probability = 0.3;
        let mut random = ScriptedRandom::new([0.5]);

        assert!(scheduler.discover_once(&mut random).is_empty());
        assert_eq!(
            registry.snapshot_device(1).unwrap().status,
            CameraStatus::Idle
        );
    }

    #[test]
    fn test_reconcile_publishes_committed_events() {
        let (registry, dispatcher, scheduler) = setup(&[CameraStatus::Downloading]);
        let receiver = dispatcher.subscribe_channel("test");
        // battery skipped, maximum download steps until completion
        let mut random = ScriptedRandom::new([0.99, 0.999].repeat(5));

        let mut events = Vec::new();
        for _ in 0..5 {
            events.extend(scheduler.reconcile_once(&mut random));
        }

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::DownloadCompleted);
        assert_eq!(registry.video_count(), 1);
        let delivered = receiver.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(delivered, events[0]);
    }

    #[test]
    fn test_start_stop_halts_commits() {
        let (registry, _dispatcher, mut scheduler) =
            setup(&[CameraStatus::Idle, CameraStatus::Recording]);
        scheduler
            .start(SeededRandom::new(1), SeededRandom::new(2))
            .unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(
            scheduler.start(SeededRandom::new(3), SeededRandom::new(4)),
            Err(KartcamError::SchedulerAlreadyRunning)
        ));

        thread::sleep(Duration::from_millis(50));
        scheduler.stop().unwrap();
        assert!(!scheduler.is_running());

        let stopped = registry.snapshot_all();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.snapshot_all(), stopped);

        // stopping again is harmless
        scheduler.stop().unwrap();
    }

    #[test]
    fn test_failed_start_stops_spawned_cycles() {
        let (_registry, _dispatcher, mut scheduler) = setup(&[CameraStatus::Idle]);
        let reconcile_context = scheduler.context.clone();
        let mut random = SeededRandom::new(1);
        let cycle = spawn_cycle(RECONCILE_CYCLE, Duration::from_millis(5), move || {
            reconcile_context.reconcile(&mut random);
        })
        .unwrap();
        scheduler.running.push(cycle);

        let error = scheduler.abandon_start(KartcamError::ThreadSpawnError {
            name: DISCOVERY_CYCLE.to_string(),
            source: std::io::Error::other("no threads left"),
        });

        assert!(matches!(error, KartcamError::ThreadSpawnError { .. }));
        assert!(!scheduler.is_running());
    }

    struct SlowSubscriber;

    impl EventSubscriber for SlowSubscriber {
        fn name(&self) -> &str {
            "slow"
        }

        fn notify(&mut self, _event: &FleetEvent) -> Result<(), KartcamError> {
            thread::sleep(Duration::from_millis(100));
            Ok(())
        }
    }

    #[test]
    fn test_slow_subscriber_does_not_stall_commits() {
        let (registry, dispatcher, scheduler) = setup(&[CameraStatus::Downloading]);
        dispatcher.subscribe(SlowSubscriber);
        let started = Instant::now();

        let camera = registry.snapshot_device(1).unwrap();
        dispatcher
            .publisher()
            .publish_all(
                (0..3).map(|_| FleetEvent::download_started(&camera, camera.last_updated)),
            )
            .unwrap();
        // battery skipped, largest download step
        let mut random = ScriptedRandom::new([0.99, 0.999]);
        let events = scheduler.reconcile_once(&mut random);

        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(events.is_empty());
        assert_eq!(registry.snapshot_device(1).unwrap().download_progress, Some(20));
    }

    #[test]
    fn test_invalid_scheduler_config() {
        let config = SchedulerConfig {
            reconcile_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(KartcamError::InvalidConfig { .. })
        ));
        let config = SchedulerConfig {
            discovery_probability: -0.1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
