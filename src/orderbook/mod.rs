//! Order lifecycle: types, the global order book and the durable journal.

mod book;
mod journal;
mod order;

pub use book::{ConfirmationSink, OrderBook, OrderJournalEntry};
pub use journal::{Journal, JournalError, JournalRecord, JournalScan};
pub use order::{Confirmation, Contract, ExecTransType, OrdType, Order, OrderStatus, Side, Tif};
