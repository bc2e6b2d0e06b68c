//! Keyrack Core - Shared functionality for the keyrack credential broker
//!
//! Everything the daemon and the CLI agree on lives here: the grading
//! lattice, the grant model, manifest hydration, slug resolution, the
//! TTL-enforcing key store, and the session boundary.

pub mod duration;
pub mod grade;
pub mod grant;
pub mod hostfile;
pub mod manifest;
pub mod paths;
pub mod session;
pub mod slug;
pub mod store;

pub use grade::{infer_grade, DurationClass, KeyGrade, Protection};
pub use grant::{GrantAttempt, KeyGrant, KeySource};
pub use hostfile::{HostKey, HostManifest};
pub use manifest::{KeySpec, ManifestSource, RepoManifest};
pub use paths::Paths;
pub use session::SessionContext;
pub use store::KeyStore;
