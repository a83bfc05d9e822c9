//! CPN Router Core - forwarding policy computation
//!
//! Computes the ingress × instance forwarding policy matrix and turns a
//! policy row into a deterministic dispatch sequence.
//!
//! # Architecture
//!
//! ```text
//! signal tables ─┐
//! CPU snapshot ──┼──► PolicyStrategy ──► PolicyEngine ──► Arc<PolicyMatrix>
//! network view ──┘                                            │
//!                                                             ▼
//!                                         DispatchSequence (per entry row)
//! ```
//!
//! # Strategies
//!
//! - **UniformStrategy**: every instance gets `1/n`
//! - **QpsWeightedStrategy**: proportional to calibrated instance capacity
//! - **OptimalTransportStrategy**: Sinkhorn over arrival/capacity marginals
//! - **DynamicFeedbackStrategy**: everything to the least-utilized instance
//! - **ShortestLinkStrategy**: everything to the lowest-delay instance

// Core modules
mod error;
mod types;

pub mod dispatch;
pub mod engine;
pub mod network;
pub mod signals;
pub mod sinkhorn;
pub mod strategy;

// Re-exports: Error types
pub use error::{PolicyError, PolicyResult};

// Re-exports: Core types
pub use types::PolicyMatrix;

pub use dispatch::DispatchSequence;
pub use engine::PolicyEngine;
pub use network::{NetworkView, StaticNetworkView};
pub use signals::{
    parse_container_stats, JsonFileSignals, SignalSource, SignalTable, StaticSignals,
    UtilizationFeed, UtilizationSnapshot,
};
pub use sinkhorn::{sinkhorn, SinkhornSolution};
pub use strategy::{
    build_strategy, DynamicFeedbackStrategy, OptimalTransportStrategy, PolicyContext,
    PolicyStrategy, QpsWeightedStrategy, ShortestLinkStrategy, UniformStrategy,
};
