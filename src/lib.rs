pub mod capture;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod interfaces;
pub mod metrics;
pub mod pipeline;
pub mod sink;
pub mod supervisor;

pub use error::{NetlogError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
