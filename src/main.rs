// src/main.rs

use anyhow::Result;
use clap::{Parser, ValueEnum};
use simplelog::{ColorChoice, CombinedLogger, Config, LevelFilter, SharedLogger, TermLogger, TerminalMode, WriteLogger};
use std::fs::File;
use std::path::PathBuf;
use std::process;

mod app;
mod assign;
mod config;
mod conflict;
mod error;
mod midi;
mod organ;
mod relay;
mod scheduler;
mod timeline;

use config::{DEFAULT_HUB_ADDRESS, DEFAULT_MAX_OFFSET, PlayerConfig};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[value(rename_all = "lower")]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, arg_required_else_help = true)]
struct Args {
    /// MIDI file to play
    #[arg(value_name = "MIDI_FILE")]
    midi_file: PathBuf,

    /// `@<tempo>` to force a tempo, `<channel 1-16>:<volume 0-10>` to set a channel's volume
    #[arg(value_name = "SETTINGS")]
    settings: Vec<String>,

    /// Address of the relay hub
    #[arg(long, value_name = "ADDRESS", default_value = DEFAULT_HUB_ADDRESS)]
    ip: String,

    /// Shorten notes according to their velocity
    #[arg(long = "dyn")]
    dynamics: bool,

    /// Go through the motions without firing any relay
    #[arg(long)]
    mute: bool,

    /// Log every note as it is scheduled
    #[arg(long)]
    verbose: bool,

    /// Ignore pipes with an offset above this
    #[arg(long, value_name = "OFFSET", default_value_t = DEFAULT_MAX_OFFSET)]
    max: u8,

    /// Set the application log level
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Also write the log to this file
    #[arg(long, value_name = "LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<PlayerConfig, error::PipelineError> {
        let mut config = PlayerConfig::new(self.midi_file);
        for setting in &self.settings {
            config.apply_setting(setting)?;
        }
        config.hub_address = self.ip;
        config.dynamics = self.dynamics;
        config.dry_run = self.mute;
        config.verbose = self.verbose;
        config.max_offset = self.max;
        Ok(config)
    }
}

fn init_logging(level: LevelFilter, log_file: Option<&PathBuf>) -> Result<()> {
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = log_file {
        loggers.push(WriteLogger::new(level, Config::default(), File::create(path)?));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

fn main() -> Result<()> {
    let args = match Args::try_parse_from(config::normalize_legacy_args(std::env::args_os())) {
        Ok(args) => args,
        // --help and --version land here too, and must not fail
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            process::exit(1);
        }
    };

    // --- Setup logging ---
    init_logging(args.log_level.into(), args.log_file.as_ref())?;

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            process::exit(1);
        }
    };

    match app::run(&config) {
        Ok(summary) => {
            log::info!(
                "{} notes on basenote {} ({:.1}% playable), {} cancelled by conflicts",
                summary.notes,
                summary.assignment.basenote,
                summary.assignment.final_coverage(),
                summary.resolution.cancelled
            );
            let playback = summary.playback;
            if playback.resyncs > 0 || playback.failed_pulses > 0 {
                log::warn!(
                    "Fell behind {} times (worst {}ms, {}ms waiting on busy pipes), {} pulses failed",
                    playback.resyncs,
                    playback.max_lag_ms,
                    playback.busy_delay_ms,
                    playback.failed_pulses
                );
            }
            Ok(())
        }
        Err(e) => {
            log::error!("{}", e);
            process::exit(1);
        }
    }
}
