//! PostgreSQL wire protocol implementation.
//!
//! This module contains the low-level message encoding and decoding the
//! driver needs to talk to the server.
//!
//! # Structure
//!
//! - `backend`: Server → Client messages (parsing)
//! - `frontend`: Client → Server messages (encoding)
//! - `codec`: Low-level encoding/decoding primitives
//! - `types`: Common protocol types (FormatCode, Oid, TransactionStatus)

pub mod backend;
pub mod codec;
pub mod frontend;
pub mod types;

pub use backend::is_async_message;
pub use types::{FormatCode, Oid, TransactionStatus};
