pub mod calendar;
pub mod coordinator;
pub mod filter;
pub mod processor;
pub mod service;
pub mod state_store;

pub mod blob_store;

pub use coordinator::{run_once, RunError, RunSummary};
pub use processor::{MessageProcessor, Outcome};
pub use service::{run_server, ServiceConfig};
pub use state_store::StateStore;
