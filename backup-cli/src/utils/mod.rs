//! Utility modules for the recovery CLI.

pub mod logger;
