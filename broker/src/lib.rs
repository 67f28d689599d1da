pub mod broker;
pub mod config;
pub mod filestore;
pub mod server;
