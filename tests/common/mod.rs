use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use kubevisor::discovery::SearchHints;
use kubevisor::handlers::{CommandService, LaunchCommand, ServiceHandler};
use kubevisor::harness::BringUpOptions;
use kubevisor::health::{HttpProbe, TrimmedOk};
use kubevisor::pki::{CredentialBundle, CredentialIssuer};
use kubevisor::services::{ServiceCatalog, ServiceKind};
use kubevisor::{ExecutionEnvironment, SetupError, SupervisorError};

/// Writes dummy key material instead of running openssl.
pub struct DummyCredentials;

impl CredentialIssuer for DummyCredentials {
    fn create_or_load(
        &self,
        workdir: &Path,
        _listen_address: IpAddr,
        _service_address: IpAddr,
    ) -> Result<CredentialBundle, SetupError> {
        let bundle = CredentialBundle::layout(workdir);
        std::fs::create_dir_all(&bundle.pki_dir).map_err(SetupError::Workdir)?;
        for path in bundle.material() {
            std::fs::write(path, "dummy").map_err(|source| SetupError::WriteFile {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(bundle)
    }
}

/// Serves `/healthz` with `ok` for every service.
pub async fn health_server() -> String {
    let router = Router::new().route("/healthz", get(|| async { "ok\n" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}/healthz", addr)
}

/// Runs a shell script per service and probes the shared health server.
pub struct ShellServices {
    health_url: String,
    scripts: HashMap<ServiceKind, String>,
    unreachable: HashSet<ServiceKind>,
}

impl ShellServices {
    pub fn new(health_url: String) -> Self {
        Self {
            health_url,
            scripts: HashMap::new(),
            unreachable: HashSet::new(),
        }
    }

    /// Probes for `kind` go to a port nothing listens on.
    pub fn unreachable(mut self, kind: ServiceKind) -> Self {
        self.unreachable.insert(kind);
        self
    }

    pub fn script(mut self, kind: ServiceKind, script: &str) -> Self {
        self.scripts.insert(kind, script.to_string());
        self
    }
}

impl ServiceCatalog for ShellServices {
    fn resolve_binary(
        &self,
        _kind: ServiceKind,
        _hints: &SearchHints,
    ) -> Result<PathBuf, SetupError> {
        Ok(PathBuf::from("/bin/sh"))
    }

    fn construct(
        &self,
        kind: ServiceKind,
        env: &ExecutionEnvironment,
        _creds: &Arc<CredentialBundle>,
    ) -> Result<ServiceHandler, SupervisorError> {
        let script = self
            .scripts
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| "exec sleep 30".to_string());
        let definition = CommandService::new(
            kind.as_str(),
            LaunchCommand::new("/bin/sh", vec!["-c".to_string(), script]),
        );
        let url = if self.unreachable.contains(&kind) {
            "http://127.0.0.1:1/healthz".to_string()
        } else {
            self.health_url.clone()
        };
        let probe = HttpProbe::new(
            url,
            Arc::new(TrimmedOk),
            Duration::from_secs(2),
        )?;
        Ok(ServiceHandler::new(Arc::new(definition), Arc::new(probe), env))
    }
}

pub fn options(name: &str, workdir: &Path, catalog: ShellServices) -> BringUpOptions {
    let mut options = BringUpOptions::new(name)
        .with_tries(5)
        .with_interval(Duration::from_millis(20))
        .with_catalog(Arc::new(catalog));
    options.workdir = Some(workdir.to_path_buf());
    options.stop_grace_period = Duration::from_secs(1);
    options
}
