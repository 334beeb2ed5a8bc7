//! Domain types shared by the store, the clients and the processing core.

pub mod client;
pub mod execution;
pub mod invoice;

pub use client::{ClientData, MappingMethod};
pub use execution::{Execution, ExecutionLog, ExecutionStatus, LogOutcome};
pub use invoice::{Category, Invoice, InvoiceStatus};
