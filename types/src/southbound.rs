//! Southbound seam
//!
//! Components never talk to switches directly; they hand messages to a
//! `Southbound` implementation. Sends are fire-and-forget: replies come
//! back later as `FabricEvent`s.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use tracing::trace;

use crate::net::Dpid;
use crate::openflow::{FlowMod, PacketOut, SouthboundMessage};
use crate::{CpnError, CpnResult};

/// Message addressed to one switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub dpid: Dpid,
    pub message: SouthboundMessage,
}

/// Outbound path to the fabric
pub trait Southbound: Send + Sync {
    /// Queue a message for a switch
    fn send(&self, dpid: Dpid, message: SouthboundMessage) -> CpnResult<()>;

    /// Record a switch as connected
    fn attach(&self, dpid: Dpid);

    /// Forget a disconnected switch
    fn detach(&self, dpid: Dpid);

    /// Currently connected switches, ascending
    fn connected(&self) -> Vec<Dpid>;

    fn flow_mod(&self, dpid: Dpid, flow_mod: FlowMod) -> CpnResult<()> {
        self.send(dpid, SouthboundMessage::FlowMod(flow_mod))
    }

    fn packet_out(&self, dpid: Dpid, packet_out: PacketOut) -> CpnResult<()> {
        self.send(dpid, SouthboundMessage::PacketOut(packet_out))
    }
}

/// Keeps every message in memory
#[derive(Debug, Default)]
pub struct RecordingSouthbound {
    sent: Mutex<Vec<OutboundMessage>>,
    datapaths: RwLock<BTreeSet<Dpid>>,
}

impl RecordingSouthbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    /// Drain the recorded messages
    pub fn take(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn flow_mods(&self) -> Vec<(Dpid, FlowMod)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| m.message.as_flow_mod().map(|fm| (m.dpid, fm.clone())))
            .collect()
    }

    pub fn packet_outs(&self) -> Vec<(Dpid, PacketOut)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| m.message.as_packet_out().map(|po| (m.dpid, po.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

impl Southbound for RecordingSouthbound {
    fn send(&self, dpid: Dpid, message: SouthboundMessage) -> CpnResult<()> {
        self.sent.lock().push(OutboundMessage { dpid, message });
        Ok(())
    }

    fn attach(&self, dpid: Dpid) {
        self.datapaths.write().insert(dpid);
    }

    fn detach(&self, dpid: Dpid) {
        self.datapaths.write().remove(&dpid);
    }

    fn connected(&self) -> Vec<Dpid> {
        self.datapaths.read().iter().copied().collect()
    }
}

/// Forwards messages into a tokio channel drained by the fabric bridge
#[derive(Debug)]
pub struct ChannelSouthbound {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    datapaths: RwLock<BTreeSet<Dpid>>,
}

impl ChannelSouthbound {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                datapaths: RwLock::new(BTreeSet::new()),
            },
            rx,
        )
    }
}

impl Southbound for ChannelSouthbound {
    fn send(&self, dpid: Dpid, message: SouthboundMessage) -> CpnResult<()> {
        trace!(dpid = dpid, ?message, "Southbound send");
        self.tx
            .send(OutboundMessage { dpid, message })
            .map_err(|_| CpnError::ChannelClosed)
    }

    fn attach(&self, dpid: Dpid) {
        self.datapaths.write().insert(dpid);
    }

    fn detach(&self, dpid: Dpid) {
        self.datapaths.write().remove(&dpid);
    }

    fn connected(&self) -> Vec<Dpid> {
        self.datapaths.read().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openflow::{FlowAction, FlowMatch};

    #[test]
    fn test_recording_southbound() {
        let sb = RecordingSouthbound::new();
        sb.attach(2);
        sb.attach(1);
        assert_eq!(sb.connected(), vec![1, 2]);

        sb.flow_mod(1, FlowMod::new(0, FlowMatch::any(), vec![FlowAction::output(1)]))
            .unwrap();
        sb.send(2, SouthboundMessage::PortStatsRequest).unwrap();
        assert_eq!(sb.len(), 2);
        assert_eq!(sb.flow_mods().len(), 1);

        let drained = sb.take();
        assert_eq!(drained[1].dpid, 2);
        assert!(sb.is_empty());

        sb.detach(1);
        assert_eq!(sb.connected(), vec![2]);
    }

    #[tokio::test]
    async fn test_channel_southbound() {
        let (sb, mut rx) = ChannelSouthbound::new();
        sb.send(7, SouthboundMessage::FlowStatsRequest).unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.dpid, 7);
        assert_eq!(msg.message, SouthboundMessage::FlowStatsRequest);

        drop(rx);
        assert!(matches!(
            sb.send(7, SouthboundMessage::FlowStatsRequest),
            Err(CpnError::ChannelClosed)
        ));
    }
}
