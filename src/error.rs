use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ExitReport, HealthError};

/// Failures while preparing a bring-up: nothing has been launched yet.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("binary '{name}' not found (searched {searched:?})")]
    BinaryNotFound { name: String, searched: Vec<PathBuf> },
    #[error("credential setup in {workdir:?} failed: {reason}")]
    Credentials { workdir: PathBuf, reason: String },
    #[error("could not write {path:?}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not render {what}: {reason}")]
    Render { what: String, reason: String },
    #[error("port base {base} leaves no room for the service ports")]
    PortRange { base: u16 },
    #[error("no services requested")]
    NothingRequested,
    #[error("could not create workdir: {0}")]
    Workdir(#[source] std::io::Error),
    #[error("could not build http client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Failures of a single `start()` call. The caller may retry.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("{service} is already running (pid {pid:?})")]
    AlreadyRunning { service: String, pid: Option<u32> },
    #[error("could not execute {binary:?} for {service}: {source}")]
    Spawn {
        service: String,
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{service} cannot be started while {state}")]
    InvalidState { service: String, state: String },
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("{service} terminated unexpectedly: {exit}")]
    Crash { service: String, exit: ExitReport },
    #[error("{service} unhealthy after {attempts} attempts: {last}")]
    Unhealthy {
        service: String,
        attempts: u32,
        last: HealthError,
    },
    #[error("{service} prerequisite failed: {source}")]
    Prerequisite {
        service: String,
        #[source]
        source: Box<SupervisorError>,
    },
    #[error("invalid state transition for {service}: {reason}")]
    Transition { service: String, reason: String },
}

impl SupervisorError {
    pub fn prerequisite(service: impl Into<String>, source: SupervisorError) -> Self {
        SupervisorError::Prerequisite {
            service: service.into(),
            source: Box::new(source),
        }
    }

    /// Walks `Prerequisite` wrappers down to the error that started the failure.
    pub fn root_cause(&self) -> &SupervisorError {
        match self {
            SupervisorError::Prerequisite { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Service names from the outermost dependent down to the failing service.
    pub fn failure_path(&self) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = self;
        while let SupervisorError::Prerequisite { service, source } = current {
            path.push(service.clone());
            current = source;
        }
        match current {
            SupervisorError::Crash { service, .. }
            | SupervisorError::Unhealthy { service, .. }
            | SupervisorError::Transition { service, .. } => path.push(service.clone()),
            SupervisorError::Launch(LaunchError::AlreadyRunning { service, .. })
            | SupervisorError::Launch(LaunchError::Spawn { service, .. })
            | SupervisorError::Launch(LaunchError::InvalidState { service, .. }) => {
                path.push(service.clone())
            }
            _ => {}
        }
        path
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
