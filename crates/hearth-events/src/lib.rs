//! Embedded publish/subscribe event bus.
//!
//! The gateway embeds the broker in-process: domain services subscribe
//! with hierarchical topic patterns and the routing plugin publishes
//! typed [`hearth_core::MessageEnvelope`]s. External backend modules
//! can additionally attach over a loopback TCP listener speaking a
//! 4-byte length-prefixed JSON frame protocol.
//!
//! Delivery is per-subscriber FIFO. There is no cross-topic ordering
//! and no redelivery; a subscriber that falls behind its channel
//! capacity loses messages (logged).

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod broker;
mod error;
mod listener;
mod topic;

pub use broker::{BusMessage, EventBus, EventStream, ModuleClient, PersistenceHandler};
pub use error::{EventsError, EventsResult};
pub use listener::spawn_frame_listener;
pub use topic::topic_matches;
