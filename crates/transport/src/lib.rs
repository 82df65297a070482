//! blocksync-transport: remotes for the blocksync engine
//!
//! The engine talks to any [`Transport`](blocksync_core::Transport); this
//! crate provides one backed by a local (or mounted) directory.

pub mod local;

pub use local::{LocalTransport, RemoteStats};
