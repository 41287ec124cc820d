//! Command-line interface for tutorlink
//!
//! Provides argument parsing using clap derive macros.

use crate::session::context::Mode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

/// Headless client for a real-time tutoring session
#[derive(Parser, Debug)]
#[command(
    name = "tutorlink",
    version,
    about = "Headless client for a real-time voice/text tutoring session"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Websocket endpoint of the tutoring agent service
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// User id carried as a connection parameter
    #[arg(long, value_name = "ID")]
    pub user: Option<String>,

    /// Subject to study
    #[arg(long, default_value = "general")]
    pub subject: String,

    /// Chapter within the subject
    #[arg(long, default_value = "")]
    pub chapter: String,

    /// Topic within the chapter
    #[arg(long, default_value = "")]
    pub topic: String,

    /// Tutoring mode: quiz, interview, or flashcard
    #[arg(long, default_value = "quiz", value_parser = Mode::from_str)]
    pub mode: Mode,

    /// Start with microphone capture and audio playback enabled
    #[arg(long)]
    pub audio: bool,

    /// Audio input device (see `tutorlink devices`)
    #[arg(long, value_name = "DEVICE")]
    pub device: Option<String>,

    /// Verbose output (-v: info, -vv: debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List available audio input devices
    Devices,
}
