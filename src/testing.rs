//! Stand-ins for the Kubernetes binaries used by unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::discovery::SearchHints;
use crate::error::{Result, SetupError};
use crate::handlers::{CommandService, LaunchCommand, ServiceHandler};
use crate::health::HealthProbe;
use crate::pki::CredentialBundle;
use crate::process::NullSink;
use crate::services::chain::ServiceCatalog;
use crate::services::ServiceKind;
use crate::types::{ExecutionEnvironment, HealthError, HealthMessage, ServiceState};

pub fn shell_env(workdir: &Path) -> ExecutionEnvironment {
    let mut env = ExecutionEnvironment::new(
        PathBuf::from("/bin/sh"),
        workdir.to_path_buf(),
        Arc::new(NullSink),
    );
    env.health.tries = 3;
    env.health.interval = Duration::from_millis(10);
    env.stop_grace_period = Duration::from_secs(1);
    env
}

/// Always answers the same way.
pub struct FixedProbe {
    healthy: bool,
}

#[async_trait]
impl HealthProbe for FixedProbe {
    async fn check_once(&self) -> HealthMessage {
        if self.healthy {
            HealthMessage::healthy()
        } else {
            HealthMessage::unhealthy(HealthError::Body("not ok".to_string()))
        }
    }

    fn target(&self) -> &str {
        "fixed"
    }
}

/// Every service is `exec sleep 30` under `/bin/sh` unless scripted; probes
/// are fixed per kind.
pub struct ShellCatalog {
    unhealthy: HashSet<ServiceKind>,
    scripts: HashMap<ServiceKind, &'static str>,
    states: Mutex<HashMap<ServiceKind, watch::Receiver<ServiceState>>>,
}

impl ShellCatalog {
    pub fn healthy() -> Self {
        Self {
            unhealthy: HashSet::new(),
            scripts: HashMap::new(),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn unhealthy(mut self, kind: ServiceKind) -> Self {
        self.unhealthy.insert(kind);
        self
    }

    pub fn script(mut self, kind: ServiceKind, body: &'static str) -> Self {
        self.scripts.insert(kind, body);
        self
    }

    /// Last known state of the most recently constructed handler of `kind`.
    pub fn state(&self, kind: ServiceKind) -> Option<ServiceState> {
        let states = self.states.lock().unwrap();
        states.get(&kind).map(|rx| *rx.borrow())
    }
}

impl ServiceCatalog for ShellCatalog {
    fn resolve_binary(
        &self,
        _kind: ServiceKind,
        _hints: &SearchHints,
    ) -> std::result::Result<PathBuf, SetupError> {
        Ok(PathBuf::from("/bin/sh"))
    }

    fn construct(
        &self,
        kind: ServiceKind,
        env: &ExecutionEnvironment,
        _creds: &Arc<CredentialBundle>,
    ) -> Result<ServiceHandler> {
        let body = self.scripts.get(&kind).copied().unwrap_or("exec sleep 30");
        let definition = CommandService::new(
            kind.as_str(),
            LaunchCommand::new("/bin/sh", vec!["-c".to_string(), body.to_string()]),
        );
        let probe = Arc::new(FixedProbe {
            healthy: !self.unhealthy.contains(&kind),
        });
        let handler = ServiceHandler::new(Arc::new(definition), probe, env);
        self.states
            .lock()
            .unwrap()
            .insert(kind, handler.watch_state());
        Ok(handler)
    }
}
