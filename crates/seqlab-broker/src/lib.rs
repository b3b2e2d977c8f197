//! Privileged one-shot operation broker.
//!
//! A lower-trust parent service spawns one `seqlab-broker` process per
//! request with elevated privileges and a framed protocol on the
//! child's stdin/stdout. The broker authenticates the end-user named
//! in the request, irreversibly drops to that user's identity and a
//! confined working directory, performs exactly one operation and
//! exits with a category-specific status code.

pub mod auth;
pub mod config;
pub mod describe;
pub mod dispatch;
pub mod error;
pub mod exec;
pub mod fsops;
pub mod privilege;
pub mod transfer;
