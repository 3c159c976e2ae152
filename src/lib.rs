//! Agent daemon: keeps agent subprocesses alive and feeds them work.

pub mod bridge;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod session;
pub mod testing;
