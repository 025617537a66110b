//! Genflight - single-flight coordinator for streaming AI generation sessions

pub mod app;
pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod ledger;
pub mod server;
pub mod session;
pub mod types;
