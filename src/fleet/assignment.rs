use chrono::Utc;
use log::{info, warn};

use crate::KartcamError;

use super::{DevicePatch, EventPublisher, FleetEvent, FleetRegistry};

/// Outcome of a kart assignment.
#[derive(Clone, Debug, PartialEq)]
pub struct Assignment {
    pub device_id: u32,
    pub kart_id: u32,
    /// Video that was bound to the kart, if an unassigned one existed
    pub video_id: Option<String>,
    pub event: FleetEvent,
}

/// Binds cameras, and their latest unassigned download, to karts.
#[derive(Clone)]
pub struct KartAssignmentService {
    registry: FleetRegistry,
    publisher: EventPublisher,
}

impl KartAssignmentService {
    pub fn new(registry: FleetRegistry, publisher: EventPublisher) -> Self {
        Self {
            registry,
            publisher,
        }
    }

    /// Assigns `kart_id` to the camera and to its most recent video without a kart.
    ///
    /// The camera record is always updated; older or already assigned videos are never
    /// touched. Both updates happen under one registry lock so a completing download cannot
    /// slip in between them.
    pub fn assign(&self, device_id: u32, kart_id: u32) -> Result<Assignment, KartcamError> {
        if kart_id == 0 {
            return Err(KartcamError::InvalidKart { kart_id });
        }

        let (device, video_id) = self.registry.with_state(|state| {
            let device = state.apply_patch(
                device_id,
                &DevicePatch {
                    assigned_kart: Some(Some(kart_id)),
                    ..Default::default()
                },
            )?;
            let video_id = state.latest_unassigned_video_mut(device_id).map(|video| {
                video.assigned_kart = Some(kart_id);
                video.id.clone()
            });
            Ok::<_, KartcamError>((device, video_id))
        })?;

        let event = FleetEvent::kart_assigned(&device, kart_id, video_id.clone(), Utc::now());
        match &video_id {
            Some(video_id) => info!(
                "{} assigned to kart {}, bound video {}",
                device.name, kart_id, video_id
            ),
            None => info!(
                "{} assigned to kart {}, no unassigned video to bind",
                device.name, kart_id
            ),
        }
        if let Err(e) = self.publisher.publish(event.clone()) {
            warn!("Could not queue kart assignment notification: {}", e);
        }

        Ok(Assignment {
            device_id,
            kart_id,
            video_id,
            event,
        })
    }
}
