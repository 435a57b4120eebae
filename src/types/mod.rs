pub mod env;
pub mod health;

pub use env::{ExecutionEnvironment, Ports};
pub use health::{HealthError, HealthMessage};

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Readiness {
    Unverified, // Process launched, no passing probe yet
    Healthy,    // At least one probe passed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Uninitialized,
    Starting,
    Running(Readiness),
    Stopped,
    Failed,
}

impl ServiceState {
    pub fn as_str(&self) -> &str {
        match self {
            ServiceState::Uninitialized => "Uninitialized",
            ServiceState::Starting => "Starting",
            ServiceState::Running(Readiness::Unverified) => "Running(Unverified)",
            ServiceState::Running(Readiness::Healthy) => "Running(Healthy)",
            ServiceState::Stopped => "Stopped",
            ServiceState::Failed => "Failed",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::Running(_))
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceState::Running(Readiness::Healthy))
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitKind {
    /// `stop()` asked for the termination.
    Requested,
    /// Crash, external signal, or the binary simply returned.
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReport {
    pub service: String,
    pub pid: Option<u32>,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub kind: ExitKind,
}

impl ExitReport {
    pub fn is_unexpected(&self) -> bool {
        self.kind == ExitKind::Unexpected
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit status {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => f.write_str("exit status unknown"),
        }?;
        if let Some(pid) = self.pid {
            write!(f, " (pid {})", pid)?;
        }
        Ok(())
    }
}
