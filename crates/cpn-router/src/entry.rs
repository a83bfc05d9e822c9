//! Per-switch, per-service forwarding entry
//!
//! ```text
//!            first packet / install
//!   ┌──────┐ ─────────────────────► ┌───────────┐
//!   │ Idle │                        │ Installed │ ◄─┐ policy tick:
//!   └──────┘ ◄───────────────────── └───────────┘ ──┘ reinstall if the
//!              forward rule removed                   target moved
//! ```

use cpn_router_core::DispatchSequence;
use cpn_types::{Dpid, FlowMatch, PortNo, ServiceId, ServiceInstance};
use rand::Rng;
use std::net::Ipv4Addr;
use std::time::Instant;
use tracing::debug;

use crate::rules::RewriteRules;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// No rules on the fabric; the next packet installs
    Idle,
    /// Rewrite rules active, target pinned
    Installed,
}

/// Rules last written for an entry
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledRules {
    pub rules: RewriteRules,
    pub in_port: PortNo,
    pub client: Ipv4Addr,
    pub target: ServiceInstance,
    pub installed_at: Instant,
}

#[derive(Debug, Clone)]
pub struct CpnForwardingEntry {
    dpid: Dpid,
    service: ServiceId,
    /// Ordered pool; indices follow the policy columns
    instances: Vec<ServiceInstance>,
    dispatch: DispatchSequence,
    installed: Option<InstalledRules>,
    dirty: bool,
}

impl CpnForwardingEntry {
    pub fn new<R: Rng + ?Sized>(
        dpid: Dpid,
        service: ServiceId,
        instances: Vec<ServiceInstance>,
        row: &[f64],
        rng: &mut R,
    ) -> Self {
        let dispatch = DispatchSequence::build(row, instances.len(), rng);
        Self {
            dpid,
            service,
            instances,
            dispatch,
            installed: None,
            dirty: true,
        }
    }

    pub fn dpid(&self) -> Dpid {
        self.dpid
    }

    pub fn service(&self) -> ServiceId {
        self.service
    }

    pub fn instances(&self) -> &[ServiceInstance] {
        &self.instances
    }

    pub fn dispatch(&self) -> &DispatchSequence {
        &self.dispatch
    }

    pub fn state(&self) -> EntryState {
        if self.dirty {
            EntryState::Idle
        } else {
            EntryState::Installed
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Rules of the last install, kept after the entry goes idle
    pub fn installed(&self) -> Option<&InstalledRules> {
        self.installed.as_ref()
    }

    /// Instance the reverse rule currently rewrites from
    pub fn active_target(&self) -> Option<ServiceInstance> {
        self.installed.as_ref().map(|i| i.target)
    }

    pub fn forward_match(&self) -> Option<&FlowMatch> {
        self.installed.as_ref().map(|i| &i.rules.forward.flow_match)
    }

    pub fn installed_at(&self) -> Option<Instant> {
        self.installed.as_ref().map(|i| i.installed_at)
    }

    /// Next instance to dispatch to.
    ///
    /// The sequence is rebuilt first if `row` differs from the one it was
    /// built from.
    pub fn advance<R: Rng + ?Sized>(&mut self, row: &[f64], rng: &mut R) -> Option<ServiceInstance> {
        if !self.dispatch.matches_row(row) {
            self.dispatch = DispatchSequence::build(row, self.instances.len(), rng);
            debug!(
                dpid = self.dpid,
                service = %self.service,
                cycle = ?self.dispatch.cycle(),
                "Dispatch sequence rebuilt"
            );
        }
        let index = self.dispatch.next()?;
        self.instances.get(index).copied()
    }

    pub fn record_install(&mut self, installed: InstalledRules) {
        self.installed = Some(installed);
        self.dirty = false;
    }

    /// Whether a removed rule is this entry's last forward rule
    pub fn is_own_forward_rule(&self, removed: &FlowMatch) -> bool {
        self.forward_match() == Some(removed)
    }

    pub fn mark_idle(&mut self) {
        self.dirty = true;
    }
}
