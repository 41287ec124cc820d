//! Session orchestration: context changes, audio toggles, and the wiring
//! between capture, transport, turn machine, and playback.
//!
//! The controller is the one place reconnection decisions are made. The
//! transport never reconnects on its own; the controller closes it on any
//! context change and opens a fresh one only on an explicit mode
//! selection, so the remote agent always sees the parameters it was
//! connected with.

use crate::audio::capture::{
    AudioCapture, CaptureBlock, CaptureConfig, CaptureHandle, CaptureSource,
};
use crate::audio::codec;
use crate::audio::playback::{AudioRenderer, RendererConfig};
use crate::defaults;
use crate::error::{Result, TutorlinkError};
use crate::session::connector::Connector;
use crate::session::context::{Mode, SessionContext};
use crate::session::frame::{MimeType, Role, WireFrame};
use crate::session::transport::{AudioFeed, SessionTransport, TransportEvent};
use crate::session::turn::{ConversationMessage, MessageId, TurnEvent, TurnStateMachine};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle as ThreadHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Produces a fresh capture source each time audio is toggled on.
///
/// The controller never holds a device while audio is off; a failed
/// factory call surfaces as `CaptureUnavailable` and reverts the toggle.
pub type CaptureSourceFactory = Box<dyn Fn() -> Result<Box<dyn CaptureSource>> + Send + Sync>;

/// Factory opening the real microphone via cpal.
#[cfg(feature = "cpal-audio")]
pub fn cpal_capture_factory(device: Option<String>) -> CaptureSourceFactory {
    use crate::audio::device::CpalCaptureSource;
    Box::new(move || {
        let source = CpalCaptureSource::new(device.as_deref())?;
        Ok(Box::new(source) as Box<dyn CaptureSource>)
    })
}

/// Session lifecycle and transcript changes surfaced to the embedding
/// application. Events carry ids plus content so observers need no shared
/// ownership of the transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A new connection is open under the given session id.
    SessionStarted { session_id: String },
    /// A new message opened in the transcript.
    MessageStarted { id: MessageId, role: Role },
    /// An open message grew; `text` is its full accumulated text.
    MessageUpdated { id: MessageId, text: String },
    /// Audio became part of an open message.
    AudioAttached { id: MessageId },
    /// The current turn closed, freezing `id` if a message was open.
    TurnCompleted { id: Option<MessageId> },
    /// The remote peer closed the connection.
    SessionClosed,
    /// The connection failed irrecoverably.
    SessionFailed { message: String },
    /// Capture failed or could not start; the audio toggle is off.
    AudioUnavailable { message: String },
}

/// A running capture pipeline plus the channel its blocks arrive on.
struct CaptureSession {
    rx: crossbeam_channel::Receiver<CaptureBlock>,
    handle: CaptureHandle,
}

/// Thread bridging capture blocks into the transport's outbound queue.
///
/// Runs off both real-time boundaries: it blocks on the capture channel
/// and performs the codec conversion, leaving the capture callback free of
/// framing work. One forwarder exists per connection; it dies with the
/// connection and is rebuilt on reconnect.
struct AudioForwarder {
    stop: Arc<AtomicBool>,
    thread: Option<ThreadHandle<()>>,
}

impl AudioForwarder {
    fn spawn(rx: crossbeam_channel::Receiver<CaptureBlock>, feed: AudioFeed) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread = thread::spawn(move || {
            while !thread_stop.load(Ordering::SeqCst) {
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(block) => {
                        let bytes = codec::pcm16_to_bytes(&block.samples);
                        if feed.send(&bytes).is_err() {
                            debug!("transport closed, ending audio forwarding");
                            return;
                        }
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                }
            }
        });
        Self {
            stop,
            thread: Some(thread),
        }
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("audio forwarding thread panicked during shutdown");
        }
    }
}

/// Orchestrates one tutoring session end to end.
pub struct SessionController {
    endpoint: String,
    connector: Arc<dyn Connector>,
    context: SessionContext,
    capture_config: CaptureConfig,
    capture_factory: CaptureSourceFactory,
    renderer: Arc<AudioRenderer>,
    transcript: Arc<Mutex<TurnStateMachine>>,
    events_tx: mpsc::Sender<SessionEvent>,
    transport: Option<SessionTransport>,
    pump_task: Option<JoinHandle<()>>,
    capture: Option<CaptureSession>,
    forwarder: Option<AudioForwarder>,
}

impl SessionController {
    /// Create a controller and the event stream it reports on.
    ///
    /// No connection is opened here; a session starts only on an explicit
    /// [`start_session`](Self::start_session).
    pub fn new(
        endpoint: impl Into<String>,
        context: SessionContext,
        connector: Arc<dyn Connector>,
        capture_factory: CaptureSourceFactory,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        Self::with_audio_config(
            endpoint,
            context,
            connector,
            capture_factory,
            CaptureConfig::default(),
            RendererConfig::default(),
        )
    }

    /// Create a controller with custom capture and playback settings.
    pub fn with_audio_config(
        endpoint: impl Into<String>,
        context: SessionContext,
        connector: Arc<dyn Connector>,
        capture_factory: CaptureSourceFactory,
        capture_config: CaptureConfig,
        renderer_config: RendererConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(defaults::EVENT_QUEUE_DEPTH);
        let controller = Self {
            endpoint: endpoint.into(),
            connector,
            context,
            capture_config,
            capture_factory,
            renderer: Arc::new(AudioRenderer::with_config(renderer_config)),
            transcript: Arc::new(Mutex::new(TurnStateMachine::new())),
            events_tx,
            transport: None,
            pump_task: None,
            capture: None,
            forwarder: None,
        };
        (controller, events_rx)
    }

    /// Current session context.
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Whether the audio toggle is on.
    pub fn audio_enabled(&self) -> bool {
        self.context.audio_enabled
    }

    /// Whether a transport is currently connected.
    pub fn session_active(&self) -> bool {
        self.transport.is_some()
    }

    /// Session id of the live connection, if any.
    pub fn session_id(&self) -> Option<String> {
        self.transport
            .as_ref()
            .and_then(|t| t.session_id().map(str::to_string))
    }

    /// Playback pipeline fed by inbound agent audio. The embedding
    /// application starts and stops the output device around audio use.
    pub fn renderer(&self) -> Arc<AudioRenderer> {
        self.renderer.clone()
    }

    /// Snapshot of the transcript, oldest message first.
    pub fn transcript(&self) -> Vec<ConversationMessage> {
        self.lock_transcript().messages().to_vec()
    }

    /// Change the subject. Closes the live transport; a new session must
    /// be started explicitly.
    pub async fn set_subject(&mut self, subject: impl Into<String>) {
        let subject = subject.into();
        if self.context.subject != subject {
            self.context.subject = subject;
            self.invalidate().await;
        }
    }

    /// Change the chapter. Closes the live transport.
    pub async fn set_chapter(&mut self, chapter: impl Into<String>) {
        let chapter = chapter.into();
        if self.context.chapter != chapter {
            self.context.chapter = chapter;
            self.invalidate().await;
        }
    }

    /// Change the topic. Closes the live transport.
    pub async fn set_topic(&mut self, topic: impl Into<String>) {
        let topic = topic.into();
        if self.context.topic != topic {
            self.context.topic = topic;
            self.invalidate().await;
        }
    }

    /// Change the user. Closes the live transport.
    pub async fn set_user(&mut self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        if self.context.user_id != user_id {
            self.context.user_id = user_id;
            self.invalidate().await;
        }
    }

    /// Start a session in `mode`, replacing any live connection.
    ///
    /// The old transport is fully closed before the new one opens; at no
    /// point are two connections open for this controller.
    ///
    /// # Errors
    /// `TransportConnect` when the connection cannot be established.
    pub async fn start_session(&mut self, mode: Mode) -> Result<String> {
        self.sweep_capture_failure().await;
        self.context.mode = mode;
        self.close_transport().await;
        self.open_transport().await
    }

    /// Turn audio on or off.
    ///
    /// Both directions tear the connection down and rebuild it, because
    /// the remote agent reads `is_audio` once at connect time. Toggling on
    /// acquires the microphone first, so a capture failure reverts the
    /// toggle before any connection is touched wastefully: the sequence is
    /// close → start capture → reconnect → wire blocks into the transport.
    ///
    /// # Errors
    /// `CaptureUnavailable` when the microphone cannot be acquired (the
    /// toggle stays off), `TransportConnect` when the reconnect fails.
    pub async fn set_audio(&mut self, enabled: bool) -> Result<()> {
        self.sweep_capture_failure().await;
        if enabled == self.context.audio_enabled {
            return Ok(());
        }

        let was_active = self.transport.is_some();
        self.close_transport().await;

        if enabled {
            if let Err(e) = self.start_capture() {
                self.context.audio_enabled = false;
                let _ = self
                    .events_tx
                    .send(SessionEvent::AudioUnavailable {
                        message: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
            self.context.audio_enabled = true;
        } else {
            self.stop_capture();
            self.context.audio_enabled = false;
        }

        if was_active {
            self.open_transport().await?;
        }
        Ok(())
    }

    /// Send a typed user message.
    ///
    /// The message is recorded in the transcript and any
    /// buffered-but-unplayed agent audio is discarded (barge-in) only
    /// after the send is queued, so a failed send leaves no phantom
    /// transcript entry.
    ///
    /// # Errors
    /// `SendOnClosedTransport` when no session is active — the caller
    /// needs to know the message did not go out.
    pub async fn send_user_text(&mut self, text: &str) -> Result<MessageId> {
        self.sweep_capture_failure().await;
        let transport = self
            .transport
            .as_ref()
            .ok_or(TutorlinkError::SendOnClosedTransport)?;
        transport.send_text(Role::User, text).await?;

        self.renderer.clear();
        Ok(self.lock_transcript().push_user_message(text))
    }

    /// Close the connection and release the microphone.
    pub async fn shutdown(&mut self) {
        self.close_transport().await;
        self.stop_capture();
    }

    fn lock_transcript(&self) -> std::sync::MutexGuard<'_, TurnStateMachine> {
        self.transcript.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A context change invalidates the connection but never reopens one;
    /// reopening requires an explicit mode selection.
    async fn invalidate(&mut self) {
        self.close_transport().await;
    }

    async fn close_transport(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.stop();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        // With the transport gone every event sender is dropped, so the
        // pump drains what arrived and exits.
        if let Some(pump) = self.pump_task.take() {
            let _ = pump.await;
        }
    }

    async fn open_transport(&mut self) -> Result<String> {
        let (event_tx, event_rx) = mpsc::channel(defaults::EVENT_QUEUE_DEPTH);
        let mut transport =
            SessionTransport::new(self.endpoint.clone(), self.connector.clone(), event_tx);
        let session_id = transport.connect(&self.context).await?;

        if let Some(capture) = &self.capture
            && let Some(feed) = transport.audio_feed()
        {
            self.forwarder = Some(AudioForwarder::spawn(capture.rx.clone(), feed));
        }

        self.pump_task = Some(tokio::spawn(pump_events(
            event_rx,
            self.transcript.clone(),
            self.renderer.clone(),
            self.events_tx.clone(),
        )));
        self.transport = Some(transport);
        Ok(session_id)
    }

    fn start_capture(&mut self) -> Result<()> {
        let source = (self.capture_factory)()?;
        let capture = AudioCapture::with_config(source, self.capture_config.clone());
        let (rx, handle) = capture.start()?;
        self.capture = Some(CaptureSession { rx, handle });
        Ok(())
    }

    fn stop_capture(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.stop();
        }
        if let Some(capture) = self.capture.take() {
            capture.handle.stop();
        }
    }

    /// Capture failures never raise on the capture path; the flag is
    /// inspected here, on the control path, where the toggle is forced off
    /// and the failure surfaced. No silent retry.
    async fn sweep_capture_failure(&mut self) {
        let failed = self.capture.as_ref().is_some_and(|c| c.handle.has_failed());
        if failed {
            warn!("capture device failed, forcing audio off");
            self.stop_capture();
            self.context.audio_enabled = false;
            let _ = self
                .events_tx
                .send(SessionEvent::AudioUnavailable {
                    message: "capture device failed".to_string(),
                })
                .await;
        }
    }
}

/// Per-connection event loop: decoded transport frames in, renderer audio
/// and transcript events out. Frames are processed in network-arrival
/// order; an undecodable audio payload drops that one frame without
/// touching the frames after it.
async fn pump_events(
    mut transport_rx: mpsc::Receiver<TransportEvent>,
    transcript: Arc<Mutex<TurnStateMachine>>,
    renderer: Arc<AudioRenderer>,
    events_tx: mpsc::Sender<SessionEvent>,
) {
    while let Some(event) = transport_rx.recv().await {
        let session_event = match event {
            TransportEvent::Opened { session_id } => {
                vec![SessionEvent::SessionStarted { session_id }]
            }
            TransportEvent::Frame(frame) => {
                if frame.mime_type == Some(MimeType::AudioPcm) {
                    match frame.audio_bytes().and_then(|bytes| renderer.push(&bytes)) {
                        Ok(()) => {}
                        Err(e) => {
                            warn!(error = %e, "dropping undecodable audio frame");
                            continue;
                        }
                    }
                }
                apply_frame(&transcript, &frame)
            }
            TransportEvent::Closed => vec![SessionEvent::SessionClosed],
            TransportEvent::Failed { message } => vec![SessionEvent::SessionFailed { message }],
        };
        for event in session_event {
            if events_tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

fn apply_frame(transcript: &Arc<Mutex<TurnStateMachine>>, frame: &WireFrame) -> Vec<SessionEvent> {
    let mut machine = transcript.lock().unwrap_or_else(|e| e.into_inner());
    let turn_events = machine.apply(frame);
    turn_events
        .into_iter()
        .map(|event| match event {
            TurnEvent::MessageStarted { id, role } => SessionEvent::MessageStarted { id, role },
            TurnEvent::MessageAppended { id } => SessionEvent::MessageUpdated {
                id,
                text: machine
                    .message(id)
                    .map(|m| m.text.clone())
                    .unwrap_or_default(),
            },
            TurnEvent::AudioAttached { id } => SessionEvent::AudioAttached { id },
            TurnEvent::TurnCompleted { id } => SessionEvent::TurnCompleted { id },
        })
        .collect()
}
