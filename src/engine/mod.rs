//! Job admission and execution engine
//!
//! The engine is the agent's concurrent core: a ledger tracking every
//! job's lifecycle behind one lock, a bounded pool of execution slots,
//! and a FIFO dispatch loop that moves admitted jobs into free slots.

pub mod dispatcher;
pub mod ledger;
pub mod pool;

pub use dispatcher::Dispatcher;
pub use ledger::{CompletedJob, JobLedger, LedgerStats};
pub use pool::{SlotPool, SubmitOutcome};
