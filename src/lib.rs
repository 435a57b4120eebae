pub mod types;
pub mod error;
pub mod process;
pub mod health;
pub mod handlers;
pub mod discovery;
pub mod pki;
pub mod services;
pub mod harness;
pub mod config;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{LaunchError, Result, SetupError, SupervisorError};
pub use types::*;
