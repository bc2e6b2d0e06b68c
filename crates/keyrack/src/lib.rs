//! keyrack - local credential broker
//!
//! "Unlock once, use everywhere in the session, gone when it should be."
//!
//! The CLI side of keyrack: manifest loading, vault adapters, the unlock
//! orchestrator, and the client for talking to the session daemon.

pub mod client;
pub mod loader;
pub mod unlock;
pub mod vault;

pub use client::DaemonClient;
pub use vault::{Vault, VaultRegistry};
