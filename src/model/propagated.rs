//! Event propagation between peers
//!
//! Readers and the local capture worker turn what they see into
//! [`Propagated`] events; the relay dispatcher fans them out.

use crate::model::{MediaFrame, PeerId};

/// Events propagated from one peer to the rest of the call.
#[derive(Debug)]
pub enum Propagated {
    /// A complete frame to deliver to every peer except its origin.
    Frame(PeerId, MediaFrame),

    /// The peer's inbound stream ended; it must leave the registry.
    Left(PeerId),
}

impl Propagated {
    /// The peer the event originates from.
    pub fn origin(&self) -> PeerId {
        match self {
            Propagated::Frame(p, _) | Propagated::Left(p) => *p,
        }
    }
}
