pub mod auth;
pub mod backoff;
pub mod client;
pub mod error;
pub mod message;

pub use auth::GoogleAuth;
pub use backoff::{retryable_status, with_backoff};
pub use client::{GmailClient, MailSource};
pub use error::MailError;
pub use message::{clean_email_address, ThreadMessage};
