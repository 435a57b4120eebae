use async_trait::async_trait;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use super::{render_yaml, write_file, ServiceKind};
use crate::error::{Result, SetupError};
use crate::handlers::{LaunchCommand, ServiceDefinition, ServiceHandler};
use crate::health::{HttpProbe, JsonField};
use crate::types::ExecutionEnvironment;

pub const CONFIG_FILE: &str = "etcd.yaml";
const DATA_DIR: &str = "data";

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EtcdConfig {
    pub name: String,
    pub data_dir: PathBuf,
    pub listen_client_urls: String,
    pub advertise_client_urls: String,
    pub listen_peer_urls: String,
    pub initial_advertise_peer_urls: String,
    pub initial_cluster: String,
    pub initial_cluster_state: String,
    pub initial_cluster_token: String,
}

impl EtcdConfig {
    pub fn for_env(env: &ExecutionEnvironment) -> Self {
        let client = http_url(env.listen_address, env.ports.etcd_client);
        let peer = http_url(env.listen_address, env.ports.etcd_peer);
        Self {
            name: "kubevisor".to_string(),
            data_dir: env.workdir_file(DATA_DIR),
            listen_client_urls: client.clone(),
            advertise_client_urls: client,
            listen_peer_urls: peer.clone(),
            initial_advertise_peer_urls: peer.clone(),
            initial_cluster: format!("kubevisor={}", peer),
            initial_cluster_state: "new".to_string(),
            initial_cluster_token: "kubevisor-etcd".to_string(),
        }
    }
}

/// Client URL other services use to reach etcd.
pub fn client_url(env: &ExecutionEnvironment) -> String {
    http_url(env.listen_address, env.ports.etcd_client)
}

fn http_url(address: IpAddr, port: u16) -> String {
    format!("http://{}", SocketAddr::new(address, port))
}

struct EtcdService {
    binary: PathBuf,
    config: PathBuf,
    data_dir: PathBuf,
}

#[async_trait]
impl ServiceDefinition for EtcdService {
    fn name(&self) -> &str {
        ServiceKind::Etcd.as_str()
    }

    fn command(&self) -> LaunchCommand {
        LaunchCommand::new(
            self.binary.clone(),
            vec![
                "--config-file".to_string(),
                self.config.to_string_lossy().to_string(),
            ],
        )
    }

    async fn before_start(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|source| SetupError::WriteFile {
                path: self.data_dir.clone(),
                source,
            })?;
        Ok(())
    }
}

pub fn new_handler(env: &ExecutionEnvironment) -> Result<ServiceHandler> {
    let config = EtcdConfig::for_env(env);
    let path = env.workdir_file(CONFIG_FILE);
    write_file(&path, &render_yaml("etcd config", &config)?)?;

    let probe = HttpProbe::new(
        format!("{}/health", client_url(env)),
        Arc::new(JsonField::new("health", "true")),
        env.health.probe_timeout,
    )?;
    let definition = EtcdService {
        binary: env.binary.clone(),
        config: path,
        data_dir: config.data_dir,
    };

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

    fn env(dir: &std::path::Path) -> ExecutionEnvironment {
        let mut env = ExecutionEnvironment::new(
            PathBuf::from("/usr/local/bin/etcd"),
            dir.to_path_buf(),
            Arc::new(NullSink),
        );
        env.init_ports(9300).unwrap();
        env
    }

    #[test]
    fn test_config_uses_consecutive_ports() {
        let dir = tempfile::tempdir().unwrap();
        let config = EtcdConfig::for_env(&env(dir.path()));
        assert_eq!(config.listen_client_urls, "http://127.0.0.1:9300");
        assert_eq!(config.listen_peer_urls, "http://127.0.0.1:9301");
        assert_eq!(config.initial_cluster, "kubevisor=http://127.0.0.1:9301");
        assert_eq!(config.data_dir, dir.path().join("data"));
    }

    #[tokio::test]
    async fn test_handler_writes_config_and_points_probe_at_health() {
        let dir = tempfile::tempdir().unwrap();
        let handler = new_handler(&env(dir.path())).unwrap();

        let written = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
        assert!(written.contains("listen-client-urls: http://127.0.0.1:9300"));
        assert!(written.contains("initial-cluster-state: new"));
        assert_eq!(handler.name(), "etcd");
        assert_eq!(handler.probe_target(), "http://127.0.0.1:9300/health");
    }
}
