//! Connection establishment seam.
//!
//! `SessionTransport` speaks to the remote agent through a pair of plain
//! channels; the `Connector` trait hides how those channels come to exist.
//! `WsConnector` bridges a tokio-tungstenite websocket; tests swap in
//! `MockConnector` and drive both ends in memory.

use crate::error::{Result, TutorlinkError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;
use url::Url;

use crate::defaults;

/// One inbound unit from an established connection.
#[derive(Debug)]
pub enum RawInbound {
    /// A text message (the wire protocol is JSON text).
    Text(String),
    /// A binary message; the protocol does not use these.
    Binary(Vec<u8>),
    /// The peer closed the connection.
    Closed,
    /// The connection failed.
    Error(String),
}

/// An established duplex link. Dropping `outbound` closes the connection.
pub struct RawLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<RawInbound>,
}

/// Opens duplex links to the tutoring agent.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `url`.
    ///
    /// # Errors
    /// `TransportConnect` when the connection cannot be established.
    async fn open(&self, url: &Url) -> Result<RawLink>;
}

/// Production connector speaking websocket.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &Url) -> Result<RawLink> {
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TutorlinkError::TransportConnect {
                message: e.to_string(),
            })?;

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(defaults::EVENT_QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel::<RawInbound>(defaults::EVENT_QUEUE_DEPTH);

        // Writer bridge: drains the outbound channel into the socket and
        // sends a close frame when the channel is dropped.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.flush().await;
        });

        // Reader bridge: forwards socket messages in arrival order.
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let inbound = match msg {
                    Ok(Message::Text(text)) => RawInbound::Text(text.to_string()),
                    Ok(Message::Binary(bytes)) => RawInbound::Binary(bytes.to_vec()),
                    Ok(Message::Close(_)) => {
                        let _ = in_tx.send(RawInbound::Closed).await;
                        return;
                    }
                    // Ping/pong are handled by tungstenite itself.
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(RawInbound::Error(e.to_string())).await;
                        return;
                    }
                };
                if in_tx.send(inbound).await.is_err() {
                    debug!("inbound receiver dropped, ending reader bridge");
                    return;
                }
            }
            let _ = in_tx.send(RawInbound::Closed).await;
        });

        Ok(RawLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
