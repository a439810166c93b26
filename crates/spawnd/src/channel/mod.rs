//! Control-channel plumbing between the spawn manager and its requester.
//!
//! # Architecture
//!
//! - **protocol**: spawn request types and wire-level validation
//! - **codec**: message framing codec for AsyncRead/AsyncWrite
//! - **transport**: the duplex channel, including descriptor passing

pub mod codec;
pub mod protocol;
pub mod transport;
