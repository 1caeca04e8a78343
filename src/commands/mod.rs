//! Command Safety & Formatting Layer
//!
//! Runs ad-hoc commands against the connected keyspace. A configurable set
//! of dangerous command names is either rejected outright or executed with
//! a warning, and every reply is reshaped into bounded, display-safe JSON.
//!
//! ## Architecture
//!
//! ```text
//! execute_one / execute_batch / execute_pipelined
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  CommandGate    │  safe | dangerous-blocked | dangerous-allowed
//! └────────┬────────┘
//!          │ (blocked commands stop here)
//!          ▼
//! ┌─────────────────┐
//! │    Keyspace     │  (connection module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  format_reply   │  truncation, binary placeholders
//! └─────────────────┘
//! ```

pub mod executor;
pub mod format;
pub mod safety;

pub use executor::{
    BatchEntry, BatchOutcome, CommandDescription, CommandExecutor, CommandOutcome,
    DangerousCommands,
};
pub use format::format_reply;
pub use safety::{Classification, CommandGate};
