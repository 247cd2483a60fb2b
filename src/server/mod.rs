//! Client-facing surface: the JSON-array protocol codec and per-session
//! state. The network transport that carries the frames is a replaceable
//! external integration.

pub mod protocol;
mod session;

pub use protocol::{md_delta, parse, password_digest, MdFields, ProtocolError, Request};
pub use session::Session;
