//! A cooperative PostgreSQL connection driver.
//!
//! # Features
//!
//! - **Sans-I/O state machines**: every protocol exchange is a resumable
//!   state machine that reports what it waits for; the `tokio` driver
//!   performs the I/O
//! - **Shared connections**: [`tokio::Conn`] methods take `&self` and are
//!   serialized by an internal lock
//! - **Pipeline mode**, **nested transactions** (savepoints) and
//!   **two-phase commit**
//! - **Interrupts**: a running command can be canceled through a side
//!   channel while the connection stays usable
//! - **LISTEN/NOTIFY** as a `futures::Stream`
//!
//! # Example
//!
//! ```no_run
//! use zero_pgdriver::tokio::Conn;
//! use zero_pgdriver::{Opts, Param};
//!
//! # async fn demo() -> zero_pgdriver::Result<()> {
//! let opts = Opts {
//!     host: "localhost".into(),
//!     user: "postgres".into(),
//!     database: Some("mydb".into()),
//!     password: Some("secret".into()),
//!     ..Default::default()
//! };
//!
//! let conn = Conn::connect(opts).await?;
//!
//! conn.transaction(None, false, async |tx| {
//!     let conn = tx.connection();
//!     conn.execute("INSERT INTO t (name) VALUES ($1)", &[Param::text("alice")])
//!         .await?;
//!     let result = conn.execute("SELECT count(*) FROM t", &[]).await?;
//!     println!("rows: {:?}", result.get(0, 0));
//!     Ok(())
//! })
//! .await?;
//!
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer_set;
pub mod command;
pub mod encoding;
pub mod error;
pub mod handler;
pub mod json;
pub mod notify;
pub mod opts;
pub mod pipeline;
pub mod protocol;
pub mod result;
pub mod state;
pub mod types;
pub mod xid;

#[cfg(feature = "tokio")]
pub mod tokio;

pub use buffer_set::BufferSet;
pub use command::{IsolationLevel, TxSettings};
pub use error::{Error, ErrorFields, Result};
pub use handler::AsyncMessageHandler;
pub use json::{JsonKind, JsonRegistry, set_json_dumps, set_json_loads};
pub use notify::Notify;
pub use opts::Opts;
pub use pipeline::Ticket;
pub use protocol::types::{FormatCode, Oid, TransactionStatus};
pub use result::QueryResult;
pub use types::Param;
pub use xid::Xid;
