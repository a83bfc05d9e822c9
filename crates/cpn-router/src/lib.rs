//! CPN Router - anycast service routing
//!
//! Turns the first packet of a client flow toward an anycast address into
//! an address-rewrite rule pair on the ingress switch.
//!
//! # Architecture
//!
//! ```text
//!                    PolicyEngine (per service)
//!                           │ policy row
//!                           ▼
//! packet-in ──► CpnRouter ──► CpnForwardingEntry ──► DispatchSequence
//!                  │              (dpid, service)          │ instance
//!                  │                                       ▼
//!                  └──────────────────────────────► RewriteRules ──► southbound
//! ```
//!
//! ARP and ICMP echo requests for an anycast address are answered by the
//! controller itself; the address never resolves to a real instance.

mod error;

pub mod engine;
pub mod entry;
pub mod rules;
pub mod view;

pub use error::{AnycastError, AnycastResult};

pub use engine::{CpnRouter, EntryKey};
pub use entry::{CpnForwardingEntry, EntryState, InstalledRules};
pub use rules::{forward_match, reverse_match, RewriteRules, RewriteTarget};
pub use view::TopologyView;
