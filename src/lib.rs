//! Multi-provider wallet discovery over a shared broadcast medium.
//!
//! Wallets embed an [`Announcer`]; consumer libraries embed a
//! [`ProviderRegistry`]. Neither side assumes the other exists yet:
//! announcers announce on startup and on every request, registries
//! subscribe first and then request, so both load orders converge.

#![deny(missing_docs)]

pub mod announcer;
pub mod error;
pub mod medium;
pub mod message;
pub mod record;
pub mod registry;

// Re-export key types
pub use announcer::{Announcer, AnnouncerConfig};
pub use error::{Error, Result};
pub use medium::{Handler, LocalMedium, Medium, Subscription};
pub use message::{DecodeError, Event, EventDetail, Message, Namespace};
pub use record::{Capability, ProviderInfo, ProviderRecord};
pub use registry::{ChangeKind, ListenerId, ProviderRegistry, RegistryChange, RegistryConfig};
