use std::{
    io::{self, BufRead},
    path::PathBuf,
    sync::mpsc::{self, RecvTimeoutError, Sender},
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand, arg};
use kartcam::{
    AppConfig, DeviceRecord, FleetMonitor, KartcamError, VideoFilter, VideoRecord,
    fleet::LogSubscriber,
    journal,
    writer::{self, JournalEntry, JournalSubscriber},
};
use log::{error, info, warn};

const COMMAND_POLL_MS: u64 = 250;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the camera fleet and accept operator commands on stdin
    Run {
        #[arg(short, long)]
        cameras: Option<u32>,

        #[arg(short, long)]
        seed: Option<u64>,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration_s: Option<u64>,

        #[arg(long)]
        reconcile_ms: Option<u64>,

        #[arg(long)]
        discovery_ms: Option<u64>,

        /// Write a JSON-lines journal of every event and completed video
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List the videos recorded in a journal
    Videos {
        #[arg(short, long)]
        input: PathBuf,

        /// all, unassigned or a kart number
        #[arg(short, long, default_value = "all")]
        kart: String,
    },
    /// Print the effective configuration
    Config {
        #[arg(long, default_value_t = false)]
        save: bool,
    },
}

#[derive(Debug, PartialEq)]
enum OperatorCommand {
    Assign { device_id: u32, kart_id: u32 },
    Videos(VideoFilter),
    Status,
    Quit,
}

fn parse_command(line: &str) -> Result<OperatorCommand, KartcamError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["assign", device_id, kart_id] => Ok(OperatorCommand::Assign {
            device_id: parse_number("camera", device_id)?,
            kart_id: parse_number("kart", kart_id)?,
        }),
        ["videos"] => Ok(OperatorCommand::Videos(VideoFilter::All)),
        ["videos", filter] => Ok(OperatorCommand::Videos(VideoFilter::parse(filter)?)),
        ["status"] => Ok(OperatorCommand::Status),
        ["quit"] | ["exit"] => Ok(OperatorCommand::Quit),
        _ => Err(KartcamError::InvalidUserInput {
            field: "command".to_string(),
            reason: format!(
                "unknown command '{}', expected: assign <camera> <kart> | videos [all|unassigned|<kart>] | status | quit",
                line.trim()
            ),
        }),
    }
}

fn parse_number(field: &str, value: &str) -> Result<u32, KartcamError> {
    value.parse().map_err(|_| KartcamError::InvalidUserInput {
        field: field.to_string(),
        reason: format!("'{value}' is not a number"),
    })
}

fn print_devices(devices: &[DeviceRecord]) {
    println!(
        "{:>3}  {:<12} {:>8}  {:<12} {:>9}  {:>13}  {:>5}  {}",
        "id", "name", "battery", "status", "progress", "memory (MiB)", "kart", "error"
    );
    for device in devices {
        println!(
            "{:>3}  {:<12} {:>7}%{} {:<12} {:>9}  {:>6}/{:<6}  {:>5}  {}",
            device.id,
            device.name,
            device.battery_level,
            if device.is_charging { "+" } else { " " },
            device.status.to_string(),
            device
                .download_progress
                .map(|p| format!("{p}%"))
                .unwrap_or_default(),
            device.memory_used / (1024 * 1024),
            device.memory_total / (1024 * 1024),
            device
                .assigned_kart
                .map(|k| k.to_string())
                .unwrap_or_else(|| "-".to_string()),
            device.error_message.as_deref().unwrap_or(""),
        );
    }
}

fn print_videos<'a>(videos: impl IntoIterator<Item = &'a VideoRecord>) {
    let mut count = 0;
    for video in videos {
        count += 1;
        println!(
            "{:<12} {:<32} {:<26} {}",
            video.camera_name,
            video.file_name,
            video.timestamp.to_rfc3339(),
            video
                .assigned_kart
                .map(|k| format!("Kart {k}"))
                .unwrap_or_else(|| "Unassigned".to_string()),
        );
    }
    if count == 0 {
        println!("No downloaded videos");
    }
}

fn handle_command(monitor: &FleetMonitor, command: OperatorCommand) -> bool {
    match command {
        OperatorCommand::Assign { device_id, kart_id } => {
            match monitor.assign(device_id, kart_id) {
                Ok(assignment) => println!("{}", assignment.event.message),
                Err(e) => println!("Assignment rejected: {}", e),
            }
        }
        OperatorCommand::Videos(filter) => print_videos(&monitor.videos(filter)),
        OperatorCommand::Status => {
            print_devices(&monitor.devices());
            let summary = monitor.summary();
            println!(
                "{} idle, {} recording, {} downloading, {} downloaded, {} in error, {} low battery",
                summary.idle,
                summary.recording,
                summary.downloading,
                summary.downloaded,
                summary.error,
                summary.low_battery
            );
        }
        OperatorCommand::Quit => return false,
    }
    true
}

fn spawn_stdin_reader(commands: Sender<OperatorCommand>) {
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(command) => {
                    if commands.send(command).is_err() {
                        break;
                    }
                }
                Err(e) => println!("{}", e),
            }
        }
    });
}

fn run(
    config: AppConfig,
    duration: Option<Duration>,
    output: Option<PathBuf>,
) -> Result<(), KartcamError> {
    let mut monitor = FleetMonitor::from_config(&config)?;
    monitor.subscribe(LogSubscriber);

    // if we need to write a journal the dispatcher also feeds the writer thread
    let journal = match output {
        Some(output_file) => {
            let (journal_tx, journal_rx) = mpsc::channel::<JournalEntry>();
            let writer =
                thread::spawn(move || writer::write_journal(&output_file, journal_rx));
            journal_tx.send(JournalEntry::Snapshot(monitor.devices()))?;
            monitor.subscribe(JournalSubscriber::new(
                monitor.registry().clone(),
                journal_tx.clone(),
            ));
            Some((journal_tx, writer))
        }
        None => None,
    };

    let (command_tx, command_rx) = mpsc::channel::<OperatorCommand>();
    let ctrlc_tx = command_tx.clone();
    ctrlc::set_handler(move || {
        println!("Exiting...");
        let _ = ctrlc_tx.send(OperatorCommand::Quit);
    })
    .map_err(|e| KartcamError::SignalHandlerError { source: e })?;
    spawn_stdin_reader(command_tx);

    monitor.start()?;
    let deadline = duration.map(|d| Instant::now() + d);
    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            info!("Run duration elapsed");
            break;
        }
        match command_rx.recv_timeout(Duration::from_millis(COMMAND_POLL_MS)) {
            Ok(command) => {
                if !handle_command(&monitor, command) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    monitor.stop()?;
    let summary = monitor.summary();
    info!(
        "Stopped with {} videos downloaded, {} cameras in error",
        monitor.videos(VideoFilter::All).len(),
        summary.error
    );

    if let Some((journal_tx, writer)) = journal {
        journal_tx.send(JournalEntry::Snapshot(monitor.devices()))?;
        // the journal subscriber holds the last sender clone
        drop(monitor);
        drop(journal_tx);
        match writer.join() {
            Ok(result) => result?,
            Err(_) => {
                return Err(KartcamError::ThreadJoinError {
                    name: "journal writer".to_string(),
                });
            }
        }
    }
    Ok(())
}

fn videos(input: &PathBuf, kart: &str) -> Result<(), KartcamError> {
    let filter = VideoFilter::parse(kart)?;
    let journal = journal::load_journal(input)?;
    print_videos(journal.videos(filter));
    for (kind, count) in journal.event_counts() {
        println!("{:?}: {}", kind, count);
    }
    Ok(())
}

fn show_config(config: &AppConfig, save: bool) -> Result<(), KartcamError> {
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| KartcamError::ConfigSerializeError { source: e })?;
    println!("{}", json);
    if save {
        config.save()?;
        info!("Saved config to {:?}", AppConfig::default_path()?);
    }
    Ok(())
}

fn main() {
    #[cfg(debug_assertions)]
    colog::init();

    let cli = Args::parse();
    let mut config = AppConfig::from_local_file().unwrap_or_default();

    let result = match &cli.command {
        Commands::Run {
            cameras,
            seed,
            duration_s,
            reconcile_ms,
            discovery_ms,
            output,
        } => {
            if let Some(cameras) = cameras {
                config.camera_count = *cameras;
            }
            if seed.is_some() {
                config.seed = *seed;
            }
            if let Some(reconcile_ms) = reconcile_ms {
                config.reconcile_interval_ms = *reconcile_ms;
            }
            if let Some(discovery_ms) = discovery_ms {
                config.discovery_interval_ms = *discovery_ms;
            }
            run(
                config,
                duration_s.map(Duration::from_secs),
                output.clone(),
            )
        }
        Commands::Videos { input, kart } => videos(input, kart),
        Commands::Config { save } => show_config(&config, *save),
    };

    if let Err(e) = result {
        error!("{}", e);
        if let KartcamError::InvalidConfig { .. } = e {
            warn!("Check {:?}", AppConfig::default_path().ok());
        }
        std::process::exit(1);
    }
}
