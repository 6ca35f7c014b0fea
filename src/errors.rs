// Error types for kartcam

use crate::writer::JournalEntry;
use snafu::Snafu;
use std::{io, sync::mpsc::SendError};

#[derive(Debug, Snafu)]
pub enum KartcamError {
    // Assignment validation errors
    #[snafu(display("Unknown camera: {device_id}"))]
    UnknownDevice { device_id: u32 },
    #[snafu(display("Invalid kart id: {kart_id}, kart ids start at 1"))]
    InvalidKart { kart_id: u32 },

    // Scheduler errors
    #[snafu(display("The tick scheduler is already running"))]
    SchedulerAlreadyRunning,
    #[snafu(display("Could not spawn the {name} thread"))]
    ThreadSpawnError { name: String, source: io::Error },
    #[snafu(display("The {name} thread terminated abnormally"))]
    ThreadJoinError { name: String },

    // Notification errors
    #[snafu(display("The notification queue is closed"))]
    DispatcherClosed,
    #[snafu(display("Subscriber {name} rejected an event: {reason}"))]
    SubscriberError { name: String, reason: String },
    #[snafu(display("Error broadcasting journal entry"))]
    JournalBroadcastError {
        source: Box<SendError<JournalEntry>>,
    },

    // Errors for the journal writer and loader
    #[snafu(display("Error writing journal file"))]
    WriterError { source: io::Error },
    #[snafu(display("Error serializing journal entry"))]
    WriterSerializeError { source: serde_json::Error },
    #[snafu(display("Invalid journal file: {path}"))]
    InvalidJournalFile { path: String },
    #[snafu(display("Error loading journal file"))]
    JournalLoaderError { source: io::Error },

    // Config management errors
    #[snafu(display("Could not find application data directory to save config file"))]
    NoConfigDir,
    #[snafu(display("Error writing config file"))]
    ConfigIOError { source: io::Error },
    #[snafu(display("Error serializing config file"))]
    ConfigSerializeError { source: serde_json::Error },
    #[snafu(display("Invalid configuration: {reason}"))]
    InvalidConfig { reason: String },

    #[snafu(display("Could not install the Ctrl-C handler"))]
    SignalHandlerError { source: ctrlc::Error },

    // User input validation errors
    #[snafu(display("Invalid user input: {field} - {reason}"))]
    InvalidUserInput { field: String, reason: String },
}

impl From<SendError<JournalEntry>> for KartcamError {
    fn from(value: SendError<JournalEntry>) -> Self {
        KartcamError::JournalBroadcastError {
            source: Box::new(value),
        }
    }
}
