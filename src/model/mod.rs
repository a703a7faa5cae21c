//! Data models for a call session
//!
//! This module contains the core data structures shared by the client and
//! relay roles: media frames, peer identities, propagated events and the
//! session state machine.

pub mod frame;
pub mod peer;
pub mod propagated;
pub mod state;

pub use frame::{MediaFrame, MediaKind};
pub use peer::PeerId;
pub use propagated::Propagated;
pub use state::{FlagsSnapshot, MediaFlags, Role, SessionState};
