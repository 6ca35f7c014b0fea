use std::{
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{DateTime, Duration, SubsecRound, Utc};
use log::{debug, error};

use crate::KartcamError;

use super::{DevicePatch, DeviceRecord, FleetEvent, Transition, VideoFilter, VideoRecord};

/// Owner of all device and video state.
///
/// Cloning a registry hands out another handle to the same fleet. Every mutation takes the
/// write lock for its whole duration, so readers only ever observe fully committed records
/// and concurrent writers (reconciliation cycle, discovery cycle, kart assignments) never
/// interleave on the same device.
#[derive(Clone, Debug)]
pub struct FleetRegistry {
    inner: Arc<RwLock<FleetState>>,
}

#[derive(Debug, Default)]
pub(crate) struct FleetState {
    devices: BTreeMap<u32, DeviceRecord>,
    videos: Vec<VideoRecord>,
}

impl FleetState {
    pub(crate) fn device(&self, device_id: u32) -> Option<&DeviceRecord> {
        self.devices.get(&device_id)
    }

    /// Applies a patch to one device and refreshes its `last_updated`.
    pub(crate) fn apply_patch(
        &mut self,
        device_id: u32,
        patch: &DevicePatch,
    ) -> Result<DeviceRecord, KartcamError> {
        let device = self
            .devices
            .get_mut(&device_id)
            .ok_or(KartcamError::UnknownDevice { device_id })?;
        device.apply(patch);
        device.last_updated = commit_time(device.last_updated);
        Ok(device.clone())
    }

    /// Most recent video of `camera_id` that has no kart yet.
    pub(crate) fn latest_unassigned_video_mut(
        &mut self,
        camera_id: u32,
    ) -> Option<&mut VideoRecord> {
        self.videos
            .iter_mut()
            .rev()
            .find(|v| v.camera_id == camera_id && v.assigned_kart.is_none())
    }

    fn commit(&mut self, transition: Transition) -> Vec<FleetEvent> {
        let Transition {
            next,
            video,
            events,
        } = transition;
        if let Some(video) = video {
            self.videos.push(video);
        }
        self.devices.insert(next.id, next);
        events
    }
}

/// Commit timestamp for a record last updated at `previous`. Timestamps are kept at
/// microsecond precision and strictly increase per record.
fn commit_time(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now().trunc_subsecs(6);
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

impl FleetRegistry {
    pub fn new(devices: Vec<DeviceRecord>) -> Self {
        let state = FleetState {
            devices: devices.into_iter().map(|d| (d.id, d)).collect(),
            videos: Vec::new(),
        };
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    // The state is only replaced by fully built values, so a poisoned lock still
    // guards a consistent fleet.
    fn read(&self) -> RwLockReadGuard<'_, FleetState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FleetState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Point-in-time copy of every device, ordered by id.
    pub fn snapshot_all(&self) -> Vec<DeviceRecord> {
        self.read().devices.values().cloned().collect()
    }

    pub fn snapshot_device(&self, device_id: u32) -> Option<DeviceRecord> {
        self.read().devices.get(&device_id).cloned()
    }

    /// Copy of the video log in completion order.
    pub fn snapshot_videos(&self, filter: VideoFilter) -> Vec<VideoRecord> {
        self.read()
            .videos
            .iter()
            .filter(|v| filter.matches(v))
            .cloned()
            .collect()
    }

    pub fn device_ids(&self) -> Vec<u32> {
        self.read().devices.keys().copied().collect()
    }

    pub fn device_count(&self) -> usize {
        self.read().devices.len()
    }

    pub fn video_count(&self) -> usize {
        self.read().videos.len()
    }

    pub fn apply_device_update(
        &self,
        device_id: u32,
        patch: &DevicePatch,
    ) -> Result<DeviceRecord, KartcamError> {
        self.write().apply_patch(device_id, patch)
    }

    pub fn append_video(&self, record: VideoRecord) {
        self.write().videos.push(record);
    }

    /// Runs `step` for every device and commits the resulting transitions as one batch.
    ///
    /// Each device only sees its own committed record. A step that returns `None` or
    /// panics leaves its device unchanged for this batch. Returns the events of all
    /// committed transitions, to be published once the lock is released.
    pub fn commit_batch<F>(&self, mut step: F) -> Vec<FleetEvent>
    where
        F: FnMut(&DeviceRecord, DateTime<Utc>) -> Option<Transition>,
    {
        let mut state = self.write();
        let ids: Vec<u32> = state.devices.keys().copied().collect();
        let mut events = Vec::new();
        let mut committed = 0;

        for id in ids {
            let Some(device) = state.devices.get(&id) else {
                continue;
            };
            let now = commit_time(device.last_updated);
            match panic::catch_unwind(AssertUnwindSafe(|| step(device, now))) {
                Ok(Some(transition)) => {
                    events.extend(state.commit(transition));
                    committed += 1;
                }
                Ok(None) => {}
                Err(cause) => {
                    error!(
                        "Update of camera {} panicked, leaving it unchanged for this tick: {}",
                        id,
                        panic_message(cause.as_ref())
                    );
                }
            }
        }
        debug!(
            "Committed batch: {} devices updated, {} events",
            committed,
            events.len()
        );
        events
    }

    /// Runs `step` against a single device and commits the transition if one is returned.
    pub fn commit_device<F>(&self, device_id: u32, step: F) -> Result<Vec<FleetEvent>, KartcamError>
    where
        F: FnOnce(&DeviceRecord, DateTime<Utc>) -> Option<Transition>,
    {
        let mut state = self.write();
        let device = state
            .devices
            .get(&device_id)
            .ok_or(KartcamError::UnknownDevice { device_id })?;
        let now = commit_time(device.last_updated);
        Ok(match step(device, now) {
            Some(transition) => state.commit(transition),
            None => Vec::new(),
        })
    }

    /// Runs `f` with exclusive access to the fleet.
    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&mut FleetState) -> T) -> T {
        f(&mut self.write())
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = cause.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
