//! CPN Controller - anycast SDN controller node
//!
//! The controller is responsible for:
//! - Tracking switches, links and hosts of the fabric
//! - Estimating free bandwidth and link delay
//! - Installing shortest paths for ordinary IPv4 traffic
//! - Dispatching anycast flows to service instances by policy
//!
//! ```text
//! adapter ◄──► FabricBridge ──► events ──► Controller::dispatch
//!                   ▲                         │
//!                   └──── ChannelSouthbound ◄─┘   periodic tasks:
//!                                                 topology refresh, bandwidth,
//!                                                 delay, entry init, policy tick,
//!                                                 CPU probe
//! ```

pub mod bridge;
pub mod controller;
pub mod error;
pub mod sampler;
pub mod tasks;

pub use bridge::{decode_event, encode_message, FabricBridge};
pub use controller::Controller;
pub use error::{ControllerError, ControllerResult};
pub use sampler::{CommandProbe, UtilizationProbe};
pub use tasks::{spawn_periodic, TaskSet};

use cpn_types::FabricEvent;
use futures::Stream;
use tokio::sync::mpsc;

/// Adapt an event channel to the stream `Controller::run` consumes
pub fn event_stream(mut events: mpsc::UnboundedReceiver<FabricEvent>) -> impl Stream<Item = FabricEvent> + Send + Unpin {
    futures::stream::poll_fn(move |cx| events.poll_recv(cx))
}
