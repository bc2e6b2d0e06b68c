//! keyrackd - the session-scoped keyrack daemon
//!
//! One daemon per (login session, owner) pair. It owns the in-memory key
//! store and answers UNLOCK / GET / STATUS / RELOCK over a unix socket,
//! rejecting any peer outside the owner's login session.

pub mod protocol;
pub mod server;

pub use server::Server;
