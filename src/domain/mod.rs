//! Domain layer: addresses, the connection capability, and the topic bus.
//!
//! This module contains everything the stores coordinate with: the cache key
//! type, the connection trait and its factory, a latency-simulating
//! connection used by the demo and tests, and the publish/subscribe
//! primitive the stores race requests through.

pub mod address;
pub mod connection;
pub mod simulated;
pub mod topic_bus;

pub use address::Address;
pub use connection::{Connection, ConnectionFactory, SharedConnection, same_connection};
pub use simulated::{Latency, SimulatedConnection, SimulatedFactory};
pub use topic_bus::{Sink, Subscription, TopicBus};
