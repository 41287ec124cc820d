//! Session transport: the connection state machine and frame multiplexer.
//!
//! One transport owns one duplex connection. Outgoing text and audio are
//! framed as JSON and written in order by a writer task; inbound traffic
//! is decoded in arrival order by a reader task and surfaced as
//! `TransportEvent`s. The transport never reconnects on its own — whether
//! to reconnect is a controller decision, because only the controller
//! knows whether the session context changed in the interim.

use crate::defaults;
use crate::error::{Result, TutorlinkError};
use crate::session::connector::{Connector, RawInbound};
use crate::session::context::SessionContext;
use crate::session::frame::{Role, WireFrame};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    /// Irrecoverable transport error; cleared by the next `connect`.
    Failed,
}

/// Events surfaced to the controller's event loop.
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection is open under the given session id.
    Opened { session_id: String },
    /// A decoded inbound frame, in network-arrival order.
    Frame(WireFrame),
    /// The remote peer closed the connection.
    Closed,
    /// The connection failed irrecoverably.
    Failed { message: String },
}

/// Cheap, cloneable handle for pushing capture audio into the outbound
/// queue from the (synchronous) forwarding thread.
#[derive(Clone)]
pub struct AudioFeed {
    outbound: mpsc::Sender<WireFrame>,
    state: Arc<Mutex<TransportState>>,
    dropped: Arc<AtomicU64>,
}

impl AudioFeed {
    /// Frame and queue one block of PCM16 bytes.
    ///
    /// A full queue drops this newest block (counted, logged) so the
    /// capture path is never blocked. A closed transport is an error the
    /// caller can see.
    pub fn send(&self, pcm_bytes: &[u8]) -> Result<()> {
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != TransportState::Open {
                return Err(TutorlinkError::SendOnClosedTransport);
            }
        }
        match self.outbound.try_send(WireFrame::audio(pcm_bytes)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n.is_power_of_two() {
                    debug!(dropped = n, "outbound audio queue full, dropping block");
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(TutorlinkError::SendOnClosedTransport)
            }
        }
    }
}

/// Owns the duplex connection to the remote tutoring agent.
pub struct SessionTransport {
    endpoint: String,
    connector: Arc<dyn Connector>,
    state: Arc<Mutex<TransportState>>,
    session_id: Option<String>,
    outbound_tx: Option<mpsc::Sender<WireFrame>>,
    event_tx: mpsc::Sender<TransportEvent>,
    writer_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    audio_dropped: Arc<AtomicU64>,
}

impl SessionTransport {
    /// Create a transport over the given connector. Events are delivered
    /// on `event_tx` in network-arrival order.
    pub fn new(
        endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            connector,
            state: Arc::new(Mutex::new(TransportState::Disconnected)),
            session_id: None,
            outbound_tx: None,
            event_tx,
            writer_task: None,
            reader_task: None,
            audio_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Session id of the current (or last) connection.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Outbound audio blocks dropped because the queue was full.
    pub fn audio_dropped(&self) -> u64 {
        self.audio_dropped.load(Ordering::Relaxed)
    }

    fn set_state(&self, new: TransportState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = new;
    }

    /// Open a connection carrying `context`, under a freshly generated
    /// session id.
    ///
    /// # Errors
    /// `ConnectionBusy` when already open or connecting (callers must
    /// `close` first — connects are never queued), `TransportConnect` when
    /// the connection cannot be established.
    pub async fn connect(&mut self, context: &SessionContext) -> Result<String> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                TransportState::Open | TransportState::Connecting => {
                    return Err(TutorlinkError::ConnectionBusy);
                }
                _ => *state = TransportState::Connecting,
            }
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let url = match context.endpoint_url(&self.endpoint, &session_id) {
            Ok(url) => url,
            Err(e) => {
                self.set_state(TransportState::Failed);
                return Err(e);
            }
        };

        let link = match self.connector.open(&url).await {
            Ok(link) => link,
            Err(e) => {
                self.set_state(TransportState::Failed);
                return Err(e);
            }
        };

        let (out_tx, mut out_rx) = mpsc::channel::<WireFrame>(defaults::SEND_QUEUE_BLOCKS);

        // Writer task: frames → JSON → link, in submission order. Dropping
        // the link sender (when this task ends) closes the connection.
        let raw_outbound = link.outbound;
        let writer_state = self.state.clone();
        let writer_events = self.event_tx.clone();
        self.writer_task = Some(tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let json = match frame.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to encode outbound frame");
                        continue;
                    }
                };
                if raw_outbound.send(json).await.is_err() {
                    let locally_closing = {
                        let mut state = writer_state.lock().unwrap_or_else(|e| e.into_inner());
                        match *state {
                            TransportState::Closing | TransportState::Disconnected => true,
                            _ => {
                                *state = TransportState::Failed;
                                false
                            }
                        }
                    };
                    if !locally_closing {
                        let _ = writer_events
                            .send(TransportEvent::Failed {
                                message: "connection write failed".to_string(),
                            })
                            .await;
                    }
                    return;
                }
            }
        }));

        // Reader task: inbound traffic → decoded frames, in arrival order.
        // A single malformed frame is dropped without desynchronizing the
        // frames after it.
        let mut inbound = link.inbound;
        let reader_state = self.state.clone();
        let reader_events = self.event_tx.clone();
        self.reader_task = Some(tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                match message {
                    RawInbound::Text(text) => match WireFrame::from_json(&text) {
                        Ok(frame) => {
                            if reader_events.send(TransportEvent::Frame(frame)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping malformed inbound frame"),
                    },
                    RawInbound::Binary(bytes) => {
                        warn!(len = bytes.len(), "dropping unexpected binary frame");
                    }
                    RawInbound::Closed => {
                        let locally_initiated = {
                            let mut state =
                                reader_state.lock().unwrap_or_else(|e| e.into_inner());
                            match *state {
                                TransportState::Closing | TransportState::Disconnected => true,
                                _ => {
                                    *state = TransportState::Disconnected;
                                    false
                                }
                            }
                        };
                        if !locally_initiated {
                            let _ = reader_events.send(TransportEvent::Closed).await;
                        }
                        return;
                    }
                    RawInbound::Error(message) => {
                        {
                            let mut state =
                                reader_state.lock().unwrap_or_else(|e| e.into_inner());
                            *state = TransportState::Failed;
                        }
                        let error = TutorlinkError::TransportClosed { message };
                        let _ = reader_events
                            .send(TransportEvent::Failed {
                                message: error.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
        }));

        self.outbound_tx = Some(out_tx);
        self.session_id = Some(session_id.clone());
        self.set_state(TransportState::Open);
        let _ = self
            .event_tx
            .send(TransportEvent::Opened {
                session_id: session_id.clone(),
            })
            .await;

        Ok(session_id)
    }

    /// Queue a text frame.
    ///
    /// # Errors
    /// `SendOnClosedTransport` when the transport is not open — the caller
    /// needs to know the message did not go out.
    pub async fn send_text(&self, role: Role, text: &str) -> Result<()> {
        if self.state() != TransportState::Open {
            return Err(TutorlinkError::SendOnClosedTransport);
        }
        let tx = self
            .outbound_tx
            .as_ref()
            .ok_or(TutorlinkError::SendOnClosedTransport)?;
        tx.send(WireFrame::text(role, text))
            .await
            .map_err(|_| TutorlinkError::SendOnClosedTransport)
    }

    /// Queue one block of capture audio. See [`AudioFeed::send`].
    pub fn send_audio(&self, pcm_bytes: &[u8]) -> Result<()> {
        self.audio_feed()
            .ok_or(TutorlinkError::SendOnClosedTransport)?
            .send(pcm_bytes)
    }

    /// Handle for the capture forwarding thread. None before `connect`.
    pub fn audio_feed(&self) -> Option<AudioFeed> {
        self.outbound_tx.as_ref().map(|tx| AudioFeed {
            outbound: tx.clone(),
            state: self.state.clone(),
            dropped: self.audio_dropped.clone(),
        })
    }

    /// Close the connection. Idempotent and prompt: queued frames are
    /// flushed, in-flight inbound traffic is abandoned, and the socket is
    /// released.
    pub async fn close(&mut self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == TransportState::Disconnected && self.outbound_tx.is_none() {
                return;
            }
            *state = TransportState::Closing;
        }

        // Dropping the frame sender lets the writer drain what is queued,
        // then close the underlying link.
        self.outbound_tx = None;
        if let Some(task) = self.writer_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }

        self.set_state(TransportState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::connector::mock::{MockConnector, MockPeer};
    use crate::session::context::Mode;

    fn context() -> SessionContext {
        SessionContext {
            user_id: "student-1".to_string(),
            subject: "math".to_string(),
            chapter: "algebra".to_string(),
            topic: "factoring".to_string(),
            mode: Mode::Quiz,
            audio_enabled: false,
        }
    }

    fn transport_with_mock() -> (
        SessionTransport,
        MockConnector,
        mpsc::Receiver<TransportEvent>,
    ) {
        let connector = MockConnector::new();
        let (event_tx, event_rx) = mpsc::channel(defaults::EVENT_QUEUE_DEPTH);
        let transport = SessionTransport::new(
            "ws://localhost:8000/ws",
            Arc::new(connector.clone()),
            event_tx,
        );
        (transport, connector, event_rx)
    }

    async fn open_transport() -> (
        SessionTransport,
        MockConnector,
        mpsc::Receiver<TransportEvent>,
        MockPeer,
        String,
    ) {
        let (mut transport, connector, mut event_rx) = transport_with_mock();
        let session_id = transport.connect(&context()).await.unwrap();
        let peer = connector.take_peer().unwrap();
        match event_rx.recv().await.unwrap() {
            TransportEvent::Opened { session_id: id } => assert_eq!(id, session_id),
            other => panic!("expected Opened, got {:?}", other),
        }
        (transport, connector, event_rx, peer, session_id)
    }

    #[tokio::test]
    async fn test_connect_carries_context_and_session_id() {
        let (transport, _connector, _event_rx, peer, session_id) = open_transport().await;

        assert_eq!(transport.state(), TransportState::Open);
        assert_eq!(transport.session_id(), Some(session_id.as_str()));

        let query = peer.url.query().unwrap();
        assert!(query.contains(&format!("session_id={}", session_id)));
        assert!(query.contains("subject=math"));
        assert!(query.contains("mode=quiz"));
        assert!(query.contains("is_audio=false"));
    }

    #[tokio::test]
    async fn test_session_ids_are_unique_per_connect() {
        let (mut transport, connector, _event_rx) = transport_with_mock();
        let first = transport.connect(&context()).await.unwrap();
        transport.close().await;
        let second = transport.connect(&context()).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(connector.open_count(), 2);
    }

    #[tokio::test]
    async fn test_connect_while_open_is_busy() {
        let (mut transport, _connector, _event_rx, _peer, _id) = open_transport().await;
        let result = transport.connect(&context()).await;
        assert!(matches!(result, Err(TutorlinkError::ConnectionBusy)));
        // The original connection stays open.
        assert_eq!(transport.state(), TransportState::Open);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported_and_terminal() {
        let connector = MockConnector::failing();
        let (event_tx, _event_rx) = mpsc::channel(8);
        let mut transport =
            SessionTransport::new("ws://localhost:8000/ws", Arc::new(connector), event_tx);

        let result = transport.connect(&context()).await;
        assert!(matches!(
            result,
            Err(TutorlinkError::TransportConnect { .. })
        ));
        assert_eq!(transport.state(), TransportState::Failed);
    }

    #[tokio::test]
    async fn test_send_text_before_connect_errors() {
        let (transport, _connector, _event_rx) = transport_with_mock();
        let result = transport.send_text(Role::User, "hello").await;
        assert!(matches!(
            result,
            Err(TutorlinkError::SendOnClosedTransport)
        ));
    }

    #[tokio::test]
    async fn test_send_text_reaches_peer_as_json() {
        let (transport, _connector, _event_rx, mut peer, _id) = open_transport().await;

        transport.send_text(Role::User, "what is a wave?").await.unwrap();

        let raw = peer.from_client.recv().await.unwrap();
        let frame = WireFrame::from_json(&raw).unwrap();
        assert_eq!(frame, WireFrame::text(Role::User, "what is a wave?"));
    }

    #[tokio::test]
    async fn test_send_audio_frames_base64_with_user_role() {
        let (transport, _connector, _event_rx, mut peer, _id) = open_transport().await;

        let pcm = vec![1u8, 2, 3, 4];
        transport.send_audio(&pcm).unwrap();

        let raw = peer.from_client.recv().await.unwrap();
        let frame = WireFrame::from_json(&raw).unwrap();
        assert_eq!(frame.role, Some(Role::User));
        assert_eq!(frame.audio_bytes().unwrap(), pcm);
    }

    #[tokio::test]
    async fn test_send_audio_drops_newest_when_queue_full() {
        // Single-threaded test runtime: the writer task cannot run until
        // the next await, so the bounded queue genuinely fills up.
        let (transport, _connector, _event_rx, mut peer, _id) = open_transport().await;

        for _ in 0..defaults::SEND_QUEUE_BLOCKS + 5 {
            transport.send_audio(&[0u8, 1]).unwrap();
        }
        assert_eq!(transport.audio_dropped(), 5);

        // The queued blocks still flow once the writer runs.
        let raw = peer.from_client.recv().await.unwrap();
        assert!(raw.contains("audio/pcm"));
    }

    #[tokio::test]
    async fn test_send_after_close_errors() {
        let (mut transport, _connector, _event_rx, _peer, _id) = open_transport().await;
        transport.close().await;

        assert!(matches!(
            transport.send_text(Role::User, "hi").await,
            Err(TutorlinkError::SendOnClosedTransport)
        ));
        assert!(matches!(
            transport.send_audio(&[0, 1]),
            Err(TutorlinkError::SendOnClosedTransport)
        ));
    }

    #[tokio::test]
    async fn test_inbound_frames_dispatch_in_order() {
        let (_transport, _connector, mut event_rx, peer, _id) = open_transport().await;

        for text in ["Hel", "lo"] {
            peer.to_client
                .send(RawInbound::Text(
                    WireFrame::text(Role::Model, text).to_json().unwrap(),
                ))
                .await
                .unwrap();
        }
        peer.to_client
            .send(RawInbound::Text(WireFrame::completion().to_json().unwrap()))
            .await
            .unwrap();

        let mut chunks = Vec::new();
        for _ in 0..3 {
            match event_rx.recv().await.unwrap() {
                TransportEvent::Frame(frame) => chunks.push(frame),
                other => panic!("expected Frame, got {:?}", other),
            }
        }
        assert_eq!(chunks[0].data.as_deref(), Some("Hel"));
        assert_eq!(chunks[1].data.as_deref(), Some("lo"));
        assert!(chunks[2].turn_complete);
    }

    #[tokio::test]
    async fn test_malformed_frame_dropped_without_desync() {
        let (_transport, _connector, mut event_rx, peer, _id) = open_transport().await;

        peer.to_client
            .send(RawInbound::Text("{malformed".to_string()))
            .await
            .unwrap();
        peer.to_client
            .send(RawInbound::Text(
                WireFrame::text(Role::Model, "still here").to_json().unwrap(),
            ))
            .await
            .unwrap();

        // The malformed frame vanishes; the next frame arrives intact.
        match event_rx.recv().await.unwrap() {
            TransportEvent::Frame(frame) => {
                assert_eq!(frame.data.as_deref(), Some("still here"));
            }
            other => panic!("expected Frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_close_surfaces_event_and_state() {
        let (transport, _connector, mut event_rx, peer, _id) = open_transport().await;

        peer.to_client.send(RawInbound::Closed).await.unwrap();

        match event_rx.recv().await.unwrap() {
            TransportEvent::Closed => {}
            other => panic!("expected Closed, got {:?}", other),
        }
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_transport_error_moves_to_failed() {
        let (transport, _connector, mut event_rx, peer, _id) = open_transport().await;

        peer.to_client
            .send(RawInbound::Error("connection reset".to_string()))
            .await
            .unwrap();

        match event_rx.recv().await.unwrap() {
            TransportEvent::Failed { message } => {
                assert_eq!(message, "Transport closed unexpectedly: connection reset");
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert_eq!(transport.state(), TransportState::Failed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_link() {
        let (mut transport, _connector, _event_rx, mut peer, _id) = open_transport().await;

        transport.close().await;
        assert_eq!(transport.state(), TransportState::Disconnected);

        // The peer observes the link closing.
        assert!(peer.from_client.recv().await.is_none());

        transport.close().await;
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_flushes_queued_frames() {
        let (mut transport, _connector, _event_rx, mut peer, _id) = open_transport().await;

        transport.send_text(Role::User, "last words").await.unwrap();
        transport.close().await;

        let raw = peer.from_client.recv().await.unwrap();
        assert!(raw.contains("last words"));
        assert!(peer.from_client.recv().await.is_none());
    }
}
