//! Shared utilities used across the server and its binaries.

pub mod logger;
pub mod time;
