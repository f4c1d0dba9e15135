pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod transfer;
pub mod ws;

#[cfg(test)]
mod test_support;
