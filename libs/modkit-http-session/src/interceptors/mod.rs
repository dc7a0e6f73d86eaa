//! Built-in adapters and retriers.

mod retry;
mod user_agent;

pub use retry::{RetryPolicy, calculate_backoff};
pub use user_agent::UserAgentAdapter;
