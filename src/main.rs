use anyhow::Result;
use clap::Parser;
use std::io::Write as _;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;
use tutorlink::cli::{Cli, Commands};
use tutorlink::config::Config;
use tutorlink::session::connector::WsConnector;
use tutorlink::session::context::{Mode, SessionContext};
use tutorlink::session::controller::{SessionController, SessionEvent};
use tutorlink::session::frame::Role;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!(version = %tutorlink::version_string(), "tutorlink starting");

    match cli.command {
        Some(Commands::Devices) => list_audio_devices(),
        None => run_session(cli).await,
    }
}

/// Log to stderr so session output on stdout stays clean.
fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(feature = "cpal-audio")]
fn list_audio_devices() -> Result<()> {
    let devices = tutorlink::audio::device::list_capture_devices()?;
    if devices.is_empty() {
        println!("No audio input devices found");
    } else {
        println!("Available audio input devices:");
        for device in devices {
            println!("  {}", device);
        }
    }
    Ok(())
}

#[cfg(not(feature = "cpal-audio"))]
fn list_audio_devices() -> Result<()> {
    anyhow::bail!("built without the cpal-audio feature; no device support")
}

async fn run_session(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path).with_env_overrides();
    if let Some(endpoint) = cli.endpoint {
        config.session.endpoint = endpoint;
    }
    if let Some(user) = cli.user {
        config.session.user_id = user;
    }
    if let Some(device) = cli.device {
        config.audio.device = Some(device);
    }

    let context = SessionContext {
        user_id: config.session.user_id.clone(),
        subject: cli.subject,
        chapter: cli.chapter,
        topic: cli.topic,
        mode: cli.mode,
        audio_enabled: false,
    };

    let (mut controller, mut events) = SessionController::with_audio_config(
        config.session.endpoint.clone(),
        context,
        Arc::new(WsConnector),
        capture_factory(&config),
        config.capture_config(),
        config.renderer_config(),
    );

    if cli.audio && let Err(e) = enable_audio(&mut controller).await {
        eprintln!("audio unavailable, continuing without: {}", e);
    }

    let session_id = controller.start_session(cli.mode).await?;
    println!("session {} open ({})", session_id, controller.context().mode);
    println!("type a message; /audio on|off, /topic <topic>, /start <mode>, /quit");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => print_event(&event),
                    None => break,
                }
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !handle_line(&mut controller, line.trim()).await {
                            break;
                        }
                    }
                    None => break, // stdin closed
                }
            }
        }
    }

    disable_playback(&controller);
    controller.shutdown().await;
    Ok(())
}

#[cfg(feature = "cpal-audio")]
fn capture_factory(config: &Config) -> tutorlink::session::controller::CaptureSourceFactory {
    tutorlink::session::controller::cpal_capture_factory(config.audio.device.clone())
}

#[cfg(not(feature = "cpal-audio"))]
fn capture_factory(_config: &Config) -> tutorlink::session::controller::CaptureSourceFactory {
    Box::new(|| {
        Err(tutorlink::error::TutorlinkError::CaptureUnavailable {
            message: "built without the cpal-audio feature".to_string(),
        })
    })
}

/// Toggle capture on and start rendering agent audio.
async fn enable_audio(controller: &mut SessionController) -> tutorlink::Result<()> {
    controller.set_audio(true).await?;
    #[cfg(feature = "cpal-audio")]
    controller.renderer().start()?;
    Ok(())
}

fn disable_playback(controller: &SessionController) {
    #[cfg(feature = "cpal-audio")]
    if let Err(e) = controller.renderer().stop() {
        tracing::warn!(error = %e, "failed to stop playback");
    }
    #[cfg(not(feature = "cpal-audio"))]
    let _ = controller;
}

/// Returns false when the session should end.
async fn handle_line(controller: &mut SessionController, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }

    if line == "/quit" {
        return false;
    }

    if line == "/audio on" {
        match enable_audio(controller).await {
            Ok(()) => println!("audio on"),
            Err(e) => eprintln!("audio unavailable: {}", e),
        }
        return true;
    }

    if line == "/audio off" {
        disable_playback(controller);
        if let Err(e) = controller.set_audio(false).await {
            eprintln!("failed to disable audio: {}", e);
        } else {
            println!("audio off");
        }
        return true;
    }

    if let Some(topic) = line.strip_prefix("/topic ") {
        controller.set_topic(topic.trim()).await;
        println!("topic changed; session closed. /start to begin a new one");
        return true;
    }

    if line == "/start" || line.starts_with("/start ") {
        let mode = match line.strip_prefix("/start").map(str::trim) {
            Some("") | None => controller.context().mode,
            Some(name) => match Mode::from_str(name) {
                Ok(mode) => mode,
                Err(e) => {
                    eprintln!("{}", e);
                    return true;
                }
            },
        };
        match controller.start_session(mode).await {
            Ok(session_id) => println!("session {} open ({})", session_id, mode),
            Err(e) => eprintln!("failed to start session: {}", e),
        }
        return true;
    }

    if let Err(e) = controller.send_user_text(line).await {
        eprintln!("send failed: {}", e);
    }
    true
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Model => "tutor",
        Role::System => "system",
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::SessionStarted { .. } => {}
        SessionEvent::MessageStarted { role, .. } => {
            print!("[{}] ", role_label(*role));
            let _ = std::io::stdout().flush();
        }
        SessionEvent::MessageUpdated { text, .. } => {
            // Redraw the streaming line with the accumulated text.
            print!("\r[tutor] {}", text);
            let _ = std::io::stdout().flush();
        }
        SessionEvent::AudioAttached { .. } => {}
        SessionEvent::TurnCompleted { .. } => println!(),
        SessionEvent::SessionClosed => println!("\n[session] closed by remote"),
        SessionEvent::SessionFailed { message } => eprintln!("\n[session] failed: {}", message),
        SessionEvent::AudioUnavailable { message } => {
            eprintln!("\n[audio] unavailable: {}", message)
        }
    }
}
