mod config;
mod server;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::{LlmProvider, ServiceConfig};
pub use server::run_server;
