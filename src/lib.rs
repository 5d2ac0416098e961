mod macros;

pub mod codec;
pub mod connection;
pub mod datatypes;

pub mod carrier;
pub mod config;
pub mod conversation;
pub mod domain;
pub mod encoding;
pub mod envelope;
pub mod error;
pub mod log;
pub mod mm4;
pub mod quota;
pub mod repository;
pub mod router;
pub mod smpp;
pub mod transcode;
pub mod web;
pub mod webhook;

// Re-export codec types for direct access
pub use codec::{CodecError, Decodable, Encodable, Frame, PduHeader, PduRegistry};

/// Error returned by most functions.
///
/// When writing a real application, one might want to consider a specialized
/// error handling crate or defining an error type as an `enum` of causes.
/// However, for our example, using a boxed `std::error::Error` is sufficient.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type used throughout the gateway.
pub type Result<T> = std::result::Result<T, Error>;
