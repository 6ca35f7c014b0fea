use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::mpsc::{Receiver, Sender},
};

use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::{
    KartcamError,
    fleet::{DeviceRecord, EventKind, EventSubscriber, FleetEvent, FleetRegistry, VideoFilter, VideoRecord},
};

/// One line of the JSON-lines journal.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum JournalEntry {
    Event(FleetEvent),
    Video(VideoRecord),
    Snapshot(Vec<DeviceRecord>),
}

pub fn write_journal(
    file: &Path,
    journal_receiver: Receiver<JournalEntry>,
) -> Result<(), KartcamError> {
    let journal_file = File::create(file).map_err(|e| KartcamError::WriterError { source: e })?;
    let mut journal_writer = BufWriter::new(journal_file);
    let mut written = 0usize;
    for entry in &journal_receiver {
        let line = match serde_json::to_string(&entry)
            .map_err(|e| KartcamError::WriterSerializeError { source: e })
        {
            Ok(line) => line,
            Err(e) => {
                error!("Skipping journal entry: {}", e);
                continue;
            }
        };
        writeln!(journal_writer, "{}", line).map_err(|e| KartcamError::WriterError { source: e })?;
        written += 1;
    }
    journal_writer
        .flush()
        .map_err(|e| KartcamError::WriterError { source: e })?;
    debug!("Journal {:?} closed after {} entries", file, written);
    Ok(())
}

/// Feeds fleet events into the journal writer. Completed downloads are followed by the
/// full video record, read back from the registry.
pub struct JournalSubscriber {
    registry: FleetRegistry,
    sender: Sender<JournalEntry>,
}

impl JournalSubscriber {
    pub fn new(registry: FleetRegistry, sender: Sender<JournalEntry>) -> Self {
        Self { registry, sender }
    }
}

impl EventSubscriber for JournalSubscriber {
    fn name(&self) -> &str {
        "journal"
    }

    fn notify(&mut self, event: &FleetEvent) -> Result<(), KartcamError> {
        self.sender.send(JournalEntry::Event(event.clone()))?;
        if event.kind == EventKind::DownloadCompleted {
            let video = event.video_id.as_ref().and_then(|video_id| {
                self.registry
                    .snapshot_videos(VideoFilter::All)
                    .into_iter()
                    .find(|v| &v.id == video_id)
            });
            if let Some(video) = video {
                self.sender.send(JournalEntry::Video(video))?;
            }
        }
        Ok(())
    }
}
