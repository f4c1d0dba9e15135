pub mod browse;
pub mod catalog;
pub mod clock;
pub mod cron;
pub mod error_log;
pub mod hooks;
pub mod maintenance;
pub mod orchestrator;
pub mod restore;
pub mod scheduler;
pub mod size_estimator;
pub mod versioning;
