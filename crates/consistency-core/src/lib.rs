//! # consistency-core
//!
//! The subscription and fan-out engine.
//!
//! - [`Registry`]: owns the id → [`Resource`] mapping, creates resources on
//!   first watch and drops them when their last subscriber leaves
//! - [`Resource`]: ordered subscriber set plus last-change timestamp
//! - [`ClientSession`]: one connected client and the resources it watches
//! - [`protocol`]: JSON wire messages and the codec traits adapters plug into
//!
//! Transports live in `consistency-server`; nothing here touches a socket.

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod protocol;
pub mod registry;
pub mod resource;
pub mod session;

pub use errors::{ProtocolError, PushError};
pub use ids::{ResourceId, SessionId};
pub use protocol::{
    ClientCommand, ClientProtocol, IngestCommand, IngestSource, JsonProtocol, ServerEvent,
};
pub use registry::{Registry, WatchOutcome};
pub use resource::{NotifyReport, Removal, Resource};
pub use session::{ClientSession, ClientTransport};
