//! Core domain types for stackform.

pub mod network;
pub mod stack;
pub mod volume;

// Re-exports
pub use network::{PortMapping, Protocol, DEFAULT_NETWORK};
pub use stack::{Secret, Service, SnapshotPolicy, Stack, DEFAULT_PROFILE, DEFAULT_PROJECT};
pub use volume::{Bind, Volume, DEFAULT_POOL};
