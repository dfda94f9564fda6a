//! Multi-step operations built from the service clients
//!
//! Each helper takes the [`Session`](crate::Session) it runs in, starts the
//! services it needs, and moves the session's lifecycle forward on success.

pub mod bundle;
pub mod files;
pub mod installation;
pub mod launch;
pub mod mount;
