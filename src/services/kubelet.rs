use async_trait::async_trait;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{kubeconfig, render_yaml, write_file, ServiceKind};
use crate::error::{Result, SetupError};
use crate::handlers::{LaunchCommand, ServiceDefinition, ServiceHandler};
use crate::health::{HttpProbe, TrimmedOk};
use crate::pki::CredentialBundle;
use crate::types::ExecutionEnvironment;

pub const CONFIG_FILE: &str = "kubelet.yaml";
const MANIFEST_DIR: &str = "manifests";
const ROOT_DIR: &str = "root";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeletConfig {
    pub api_version: String,
    pub kind: String,
    pub address: IpAddr,
    pub port: u16,
    pub read_only_port: u16,
    pub healthz_bind_address: IpAddr,
    pub healthz_port: u16,
    #[serde(rename = "clusterDNS")]
    pub cluster_dns: Vec<IpAddr>,
    pub cluster_domain: String,
    pub static_pod_path: PathBuf,
    pub fail_swap_on: bool,
    pub tls_cert_file: PathBuf,
    pub tls_private_key_file: PathBuf,
    pub authentication: Authentication,
    pub authorization: Authorization,
}

#[derive(Debug, Serialize)]
pub struct Authentication {
    pub anonymous: Toggle,
    pub webhook: Toggle,
    pub x509: X509,
}

#[derive(Debug, Serialize)]
pub struct Toggle {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct X509 {
    #[serde(rename = "clientCAFile")]
    pub client_ca_file: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct Authorization {
    pub mode: String,
}

impl KubeletConfig {
    pub fn new(env: &ExecutionEnvironment, creds: &CredentialBundle) -> Self {
        Self {
            api_version: "kubelet.config.k8s.io/v1beta1".to_string(),
            kind: "KubeletConfiguration".to_string(),
            address: env.listen_address,
            port: env.ports.kubelet_api,
            read_only_port: 0,
            healthz_bind_address: env.listen_address,
            healthz_port: env.ports.kubelet_health,
            cluster_dns: vec![env.dns_address],
            cluster_domain: "cluster.local".to_string(),
            static_pod_path: env.workdir_file(MANIFEST_DIR),
            fail_swap_on: false,
            tls_cert_file: creds.apiserver.cert.clone(),
            tls_private_key_file: creds.apiserver.key.clone(),
            authentication: Authentication {
                anonymous: Toggle { enabled: false },
                webhook: Toggle { enabled: true },
                x509: X509 {
                    client_ca_file: creds.ca.cert.clone(),
                },
            },
            authorization: Authorization {
                mode: "Webhook".to_string(),
            },
        }
    }
}

pub fn health_url(env: &ExecutionEnvironment) -> String {
    format!(
        "http://{}/healthz",
        SocketAddr::new(env.listen_address, env.ports.kubelet_health)
    )
}

struct KubeletService {
    command: LaunchCommand,
    dirs: Vec<PathBuf>,
}

#[async_trait]
impl ServiceDefinition for KubeletService {
    fn name(&self) -> &str {
        ServiceKind::Kubelet.as_str()
    }

    fn command(&self) -> LaunchCommand {
        self.command.clone()
    }

    async fn before_start(&self) -> Result<()> {
        for dir in &self.dirs {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| SetupError::WriteFile {
                    path: dir.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

/// The kubelet needs root; its command goes through `env.sudo_method`.
pub fn command(env: &ExecutionEnvironment, config: &Path, kubeconfig: &Path) -> LaunchCommand {
    let path = |p: &Path| p.to_string_lossy().to_string();
    LaunchCommand::new(
        env.binary.clone(),
        vec![
            format!("--config={}", path(config)),
            format!("--kubeconfig={}", path(kubeconfig)),
            format!("--root-dir={}", path(&env.workdir_file(ROOT_DIR))),
        ],
    )
    .elevated(env.sudo_method.as_deref())
}

pub fn new_handler(
    env: &ExecutionEnvironment,
    creds: &Arc<CredentialBundle>,
) -> Result<ServiceHandler> {
    let kubeconfig_path = env.workdir_file("kubeconfig");
    kubeconfig::write(&kubeconfig_path, env, creds)?;

    let config_path = env.workdir_file(CONFIG_FILE);
    let config = KubeletConfig::new(env, creds);
    write_file(&config_path, &render_yaml("kubelet config", &config)?)?;

    let probe = HttpProbe::new(health_url(env), Arc::new(TrimmedOk), env.health.probe_timeout)?;
    let definition = KubeletService {
        command: command(env, &config_path, &kubeconfig_path),
        dirs: vec![config.static_pod_path, env.workdir_file(ROOT_DIR)],
    };

    Ok(ServiceHandler::new(
        Arc::new(definition),
        Arc::new(probe),
        env,
    ))
}
