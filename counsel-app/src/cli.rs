//! Command-line interface for counsel.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Voice and text counselling assistant
#[derive(Parser, Debug)]
#[command(name = "counsel", version, about = "Voice and text counselling assistant")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the settings file (default: platform data directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub settings: Option<PathBuf>,

    /// Verbose logging (-v: debug for counsel crates, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a real-time voice session; Ctrl-C ends it
    Voice {
        /// Input device name (overrides the settings file)
        #[arg(long, value_name = "DEVICE")]
        device: Option<String>,

        /// Prebuilt voice for the assistant (overrides the settings file)
        #[arg(long, value_name = "NAME")]
        voice: Option<String>,
    },

    /// Text chat on stdin/stdout (/clear resets, /quit exits)
    Chat,

    /// List audio input devices
    Devices {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show effective settings (API key redacted)
    Config {
        /// Write the normalized settings back to the settings file
        #[arg(long)]
        write: bool,
    },
}

impl Cli {
    /// `RUST_LOG`-style directive implied by `-v` flags.
    pub fn log_directive(&self) -> &'static str {
        match self.verbose {
            0 => "counsel=info,counsel_core=info",
            1 => "counsel=debug,counsel_core=debug",
            _ => "counsel=trace,counsel_core=trace",
        }
    }
}
