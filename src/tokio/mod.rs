//! Tokio-based asynchronous driver.

mod cancel;
mod conn;
mod notifies;
mod pipeline;
mod stream;
mod tpc;
mod transaction;
mod wait;

pub use cancel::CancelHandle;
pub use conn::Conn;
pub use pipeline::Pipeline;
pub use transaction::Transaction;
pub use wait::InterruptHandle;
