//! # Starweave Bus
//!
//! The inter-node message bus: a small reliability layer over UDP plus the
//! wire message set shared by the arbiter and the compute nodes.
//!
//! Every datagram carries one independently framed message
//! (`[len: u32][tag: u16][payload]`, little-endian). Delivery is unreliable
//! by default; senders opt into acknowledged ([`Delivery::Reliable`]) or
//! acknowledged-and-ordered ([`Delivery::ReliableOrdered`]) delivery per
//! message. Request/response flows ride on [`BusNode::wait_for`], which
//! parks a waiter in the pending-waiter table until a matching message
//! arrives or the timeout fires.

pub mod messages;
pub mod node;
pub mod ship;
pub mod waiter;
pub mod wire;

mod error;

pub use error::BusError;
pub use messages::Message;
pub use node::{BusNode, Delivery, PeerId};
pub use ship::Spaceship;
pub use wire::{WireError, WireReader, WireWriter};
