//! Collaborative text editing over a star-topology network.
//!
//! Every participant holds a full replica of each shared buffer, annotated
//! with Logoot-Split identifiers so that concurrent edits converge without
//! coordination. One process serves as the hub: it admits peers, assigns
//! site numbers, snapshots buffers to newcomers and relays operations to
//! everyone else. Cursors and overlay annotations replicate along the same
//! path as text.

pub mod block;
pub mod config;
pub mod document;
pub mod error;
pub mod id;
pub mod message;
pub mod session;
pub mod sexp;

pub use error::Error;
pub use session::{connect, start_server, Host, Session, SessionOptions};
