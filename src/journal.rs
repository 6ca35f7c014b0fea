use std::{collections::HashMap, path::Path};

use itertools::Itertools;
use log::info;

use crate::{
    KartcamError,
    fleet::{DeviceRecord, EventKind, FleetEvent, VideoFilter, VideoRecord},
    writer::JournalEntry,
};

/// State rebuilt from a journal written by a previous run.
#[derive(Clone, Debug, Default)]
pub struct Journal {
    pub videos: Vec<VideoRecord>,
    pub events: Vec<FleetEvent>,
    /// Most recent fleet snapshot in the journal
    pub last_snapshot: Option<Vec<DeviceRecord>>,
}

impl Journal {
    pub fn videos(&self, filter: VideoFilter) -> Vec<&VideoRecord> {
        self.videos.iter().filter(|v| filter.matches(v)).collect()
    }

    /// Number of events per kind, in kind order.
    pub fn event_counts(&self) -> Vec<(EventKind, usize)> {
        self.events
            .iter()
            .map(|e| e.kind)
            .counts()
            .into_iter()
            .sorted_by_key(|(kind, _)| *kind as u8)
            .collect()
    }
}

pub fn load_journal(source_file: &Path) -> Result<Journal, KartcamError> {
    if !source_file.exists() {
        return Err(KartcamError::InvalidJournalFile {
            path: format!("{:?}", source_file),
        });
    }

    let entries = serde_jsonlines::json_lines(source_file)
        .map_err(|e| KartcamError::JournalLoaderError { source: e })?
        .collect::<Result<Vec<JournalEntry>, std::io::Error>>()
        .map_err(|e| KartcamError::JournalLoaderError { source: e })?;

    let mut journal = Journal::default();
    // a kart can be bound before the video entry is journaled
    let mut bound_karts: HashMap<String, u32> = HashMap::new();
    for entry in entries {
        match entry {
            JournalEntry::Event(event) => {
                if event.kind == EventKind::KartAssigned {
                    if let (Some(video_id), Some(kart_id)) = (&event.video_id, event.kart_id) {
                        bound_karts.insert(video_id.clone(), kart_id);
                    }
                }
                journal.events.push(event);
            }
            JournalEntry::Video(video) => {
                if !journal.videos.iter().any(|v| v.id == video.id) {
                    journal.videos.push(video);
                }
            }
            JournalEntry::Snapshot(devices) => journal.last_snapshot = Some(devices),
        }
    }
    for video in journal.videos.iter_mut() {
        if video.assigned_kart.is_none() {
            video.assigned_kart = bound_karts.get(&video.id).copied();
        }
    }

    info!(
        "Loaded {:?}, found {} videos and {} events",
        source_file,
        journal.videos.len(),
        journal.events.len()
    );
    Ok(journal)
}
