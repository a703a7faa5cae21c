//! Realtime audio/video calls over plain TCP.
//!
//! A call carries audio and video on two independent connections. In
//! client role a [`Session`] dials one peer; in server role it accepts any
//! number of peers and relays every stream to everyone else.

pub mod codec;
pub mod config;
pub mod error;
pub mod media;
pub mod model;
pub mod peer;
pub mod server;
pub mod session;
pub mod util;

pub use config::SessionConfig;
pub use error::SessionError;
pub use model::{MediaKind, Role, SessionState};
pub use session::{Session, StartReport};
