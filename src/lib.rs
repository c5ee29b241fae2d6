pub mod aws;
pub mod cli;
pub mod clock;
pub mod commands;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod idp;
pub mod transport;
