//! Wire protocol for the seqlab broker.
//!
//! The broker talks to its parent over a pair of pre-connected pipes
//! (inherited stdin and stdout). Every message is a frame: a 4-byte
//! big-endian length prefix followed by exactly that many payload
//! bytes. The first frame of a connection carries the request, a
//! NUL-separated field buffer parsed once into a [`request::Request`].
//!
//! All I/O in this crate is bounded by a [`deadline::Deadline`] so
//! that no call can block past its wall-clock budget.

pub mod deadline;
pub mod frame;
pub mod request;

pub use deadline::Deadline;
pub use frame::{FrameError, MAX_FRAME_LEN};
pub use request::{Opcode, Request, RequestError, MAX_HEADER_LEN, MAX_REQUEST_LEN};
