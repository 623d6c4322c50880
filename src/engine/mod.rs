//! Connection engine: one authenticated transport shared by every caller.
//!
//! Architecture:
//! ```text
//! callers --> [outbound queue] --> Writer Pump --> transport
//!    ^                                                 |
//!    +---- [correlation table] <-- Reader Pump <-------+
//! ```
//! The supervisor owns the transport and restarts both pumps after a
//! connection loss.

pub mod channel;
pub mod correlation;
pub mod protocol;
pub mod reader;
pub mod supervisor;
pub mod writer;

pub use channel::{ConnectionState, Failure, FailureKind, Link, Reply, Session, Termination};
pub use correlation::{CorrelationTable, ReplySlot};
pub use reader::ReaderPump;
pub use supervisor::{Established, Supervisor};
pub use writer::{WriterConfig, WriterPump};
