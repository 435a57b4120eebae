use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use super::{kubeconfig, render_yaml, write_file, ServiceKind};
use crate::error::Result;
use crate::handlers::{CommandService, LaunchCommand, ServiceHandler};
use crate::health::{HttpProbe, TrimmedOk};
use crate::pki::CredentialBundle;
use crate::types::ExecutionEnvironment;

pub const CONFIG_FILE: &str = "kube-scheduler.cfg";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub api_version: String,
    pub kind: String,
    pub client_connection: ClientConnection,
    pub healthz_bind_address: String,
    pub metrics_bind_address: String,
    pub leader_election: LeaderElection,
}

#[derive(Debug, Serialize)]
pub struct ClientConnection {
    pub kubeconfig: PathBuf,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElection {
    pub leader_elect: bool,
}

impl SchedulerConfig {
    pub fn new(env: &ExecutionEnvironment, kubeconfig: PathBuf) -> Self {
        let health =
            SocketAddr::new(env.listen_address, env.ports.kube_scheduler_health).to_string();
        Self {
            api_version: "kubescheduler.config.k8s.io/v1alpha1".to_string(),
            kind: "KubeSchedulerConfiguration".to_string(),
            client_connection: ClientConnection { kubeconfig },
            healthz_bind_address: health.clone(),
            metrics_bind_address: health,
            leader_election: LeaderElection {
                leader_elect: false,
            },
        }
    }
}

pub fn health_url(env: &ExecutionEnvironment) -> String {
    format!(
        "http://{}/healthz",
        SocketAddr::new(env.listen_address, env.ports.kube_scheduler_health)
    )
}

pub fn new_handler(
    env: &ExecutionEnvironment,
    creds: &Arc<CredentialBundle>,
) -> Result<ServiceHandler> {
    let kubeconfig_path = env.workdir_file("kubeconfig");
    kubeconfig::write(&kubeconfig_path, env, creds)?;

    let config_path = env.workdir_file(CONFIG_FILE);
    let config = SchedulerConfig::new(env, kubeconfig_path);
    write_file(&config_path, &render_yaml("scheduler config", &config)?)?;

    let probe = HttpProbe::new(health_url(env), Arc::new(TrimmedOk), env.health.probe_timeout)?;
    let definition = CommandService::new(
        ServiceKind::Scheduler.as_str(),
        LaunchCommand::new(
            env.binary.clone(),
            vec![
                "--config".to_string(),
                config_path.to_string_lossy().to_string(),
            ],
        ),
    );

    Ok(ServiceHandler::new(
        Arc::new(definition),
        Arc::new(probe),
        env,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::NullSink;

    #[tokio::test]
    async fn test_handler_writes_config_and_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = ExecutionEnvironment::new(
            PathBuf::from("/usr/local/bin/kube-scheduler"),
            dir.path().to_path_buf(),
            Arc::new(NullSink),
        );
        env.init_ports(9500).unwrap();
        let creds = Arc::new(CredentialBundle::layout(dir.path()));

        let handler = new_handler(&env, &creds).unwrap();
        assert_eq!(handler.name(), "kube-scheduler");
        assert_eq!(handler.probe_target(), "http://127.0.0.1:9503/healthz");

        let config = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
        assert!(config.contains("kind: KubeSchedulerConfiguration"));
        assert!(config.contains("healthzBindAddress:"));
        assert!(config.contains("127.0.0.1:9503"));
        assert!(config.contains("leaderElect: false"));
        assert!(dir.path().join("kubeconfig").is_file());
    }
}
