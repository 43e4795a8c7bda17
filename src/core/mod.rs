pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod stats;
