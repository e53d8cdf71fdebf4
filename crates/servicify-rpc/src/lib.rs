//! # servicify-rpc
//!
//! The wire envelope spoken between a service endpoint, its callers, and the
//! registry: JSON-RPC 2.0 Call and Reply frames.
//!
//! ## Architecture
//!
//! This crate only turns frames into bytes and back. It knows nothing about
//! sockets, length prefixes, or what a method does; those live in `servicify`.

mod error;
mod frame;


pub use error::Error;
pub use error::FailureReason;
pub use error::Result;
pub use error::APPLICATION_ERROR;
pub use error::INTERNAL_ERROR;
pub use error::INVALID_PARAMS;
pub use error::INVALID_REQUEST;
pub use error::METHOD_NOT_FOUND;
pub use error::PARSE_ERROR;

pub use frame::CallEncoder;
pub use frame::CallFrame;
pub use frame::ReplyErrEncoder;
pub use frame::ReplyFrame;
pub use frame::ReplyOkEncoder;
pub use frame::RpcFrame;
pub use frame::VERSION;
pub use frame::decode_seq;
