//! Core gridlink primitives shared across crates.
//!
//! Includes peer descriptors, channel identifiers/roles, and the base error.

pub mod error;
pub mod types;

pub use error::GridError;
pub use types::{ChannelId, ChannelRole, PeerDescriptor, SelectionKey};
