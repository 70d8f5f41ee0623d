pub mod commands;
pub mod config;
pub mod lock;
pub mod looper;
pub mod monitor;
pub mod parse;
pub mod provider;
pub mod runner;
pub mod session_log;
pub mod status;
