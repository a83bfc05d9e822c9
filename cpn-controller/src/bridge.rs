//! Fabric bridge
//!
//! Newline-delimited JSON over TCP between the controller and the adapter
//! that speaks OpenFlow to the switches.
//!
//! ```text
//!            {"event":"packet_in",...}\n
//! adapter ──────────────────────────────► bridge ──► event channel ──► Controller
//!         ◄────────────────────────────── bridge ◄── ChannelSouthbound
//!            {"dpid":1,"message":{...}}\n
//! ```
//!
//! One adapter connection is served at a time. Messages produced while no
//! adapter is connected stay queued in the southbound channel.

use cpn_types::{FabricEvent, OutboundMessage};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ControllerResult;

/// Parse one inbound line
pub fn decode_event(line: &str) -> ControllerResult<FabricEvent> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Serialize one outbound message, newline included
pub fn encode_message(message: &OutboundMessage) -> ControllerResult<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

pub struct FabricBridge {
    listener: TcpListener,
}

impl FabricBridge {
    pub async fn bind(addr: &str) -> ControllerResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Fabric bridge listening");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> ControllerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept adapters one after another until the event channel closes
    pub async fn serve(
        self,
        events: mpsc::UnboundedSender<FabricEvent>,
        mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    ) -> ControllerResult<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            info!(peer = %peer, "Fabric adapter connected");
            match Self::session(stream, &events, &mut outbound).await {
                Ok(()) => info!(peer = %peer, "Fabric adapter disconnected"),
                Err(e) => warn!(peer = %peer, error = %e, "Fabric adapter session failed"),
            }
            if events.is_closed() {
                info!("Event channel closed, bridge stopping");
                return Ok(());
            }
        }
    }

    async fn session(
        stream: TcpStream,
        events: &mpsc::UnboundedSender<FabricEvent>,
        outbound: &mut mpsc::UnboundedReceiver<OutboundMessage>,
    ) -> ControllerResult<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        return Ok(());
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match decode_event(&line) {
                        Ok(event) => {
                            if events.send(event).is_err() {
                                return Ok(());
                            }
                        }
                        Err(e) => debug!(error = %e, "Dropping malformed event line"),
                    }
                }
                message = outbound.recv() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    writer.write_all(&encode_message(&message)?).await?;
                }
            }
        }
    }
}
