//! Wire layer for the supervisor channel.
//!
//! # Architecture
//!
//! - **protocol**: `Message` envelope and the typed payloads carried inside it
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
