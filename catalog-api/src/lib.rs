pub mod config;
pub mod error;
pub mod logging;
pub mod notify;
pub mod rate_limit;
pub mod router;
pub mod supervisor;
