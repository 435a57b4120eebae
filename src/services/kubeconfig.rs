use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use super::{render_yaml, write_file};
use crate::error::SetupError;
use crate::pki::CredentialBundle;
use crate::types::ExecutionEnvironment;

const CLUSTER: &str = "kubevisor";
const USER: &str = "kubevisor-admin";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub users: Vec<NamedUser>,
    pub contexts: Vec<NamedContext>,
    pub current_context: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    pub server: String,
    pub certificate_authority: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct User {
    pub client_certificate: PathBuf,
    pub client_key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub cluster: String,
    pub user: String,
}

impl Kubeconfig {
    /// Admin access to the API server of `env` with the bundle's client cert.
    pub fn admin(env: &ExecutionEnvironment, creds: &CredentialBundle) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: CLUSTER.to_string(),
                cluster: Cluster {
                    server: api_server_url(env),
                    certificate_authority: creds.ca.cert.clone(),
                },
            }],
            users: vec![NamedUser {
                name: USER.to_string(),
                user: User {
                    client_certificate: creds.client.cert.clone(),
                    client_key: creds.client.key.clone(),
                },
            }],
            contexts: vec![NamedContext {
                name: CLUSTER.to_string(),
                context: Context {
                    cluster: CLUSTER.to_string(),
                    user: USER.to_string(),
                },
            }],
            current_context: CLUSTER.to_string(),
        }
    }
}

pub fn api_server_url(env: &ExecutionEnvironment) -> String {
    format!(
        "https://{}",
        SocketAddr::new(env.listen_address, env.ports.kube_api)
    )
}

pub fn write(
    path: &Path,
    env: &ExecutionEnvironment,
    creds: &CredentialBundle,
) -> Result<(), SetupError> {
    let rendered = render_yaml("kubeconfig", &Kubeconfig::admin(env, creds))?;
    write_file(path, &rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::NullSink;
    use std::sync::Arc;

    #[test]
    fn test_admin_kubeconfig_points_at_api_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = ExecutionEnvironment::new(
            PathBuf::from("/bin/true"),
            dir.path().to_path_buf(),
            Arc::new(NullSink),
        );
        env.init_ports(9000).unwrap();
        let creds = CredentialBundle::layout(dir.path());

        let path = dir.path().join("kubeconfig");
        write(&path, &env, &creds).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("apiVersion: v1"));
        assert!(text.contains("current-context: kubevisor"));
        assert!(text.contains("client-certificate:"));

        let parsed: Kubeconfig = serde_yaml::from_str(&text).unwrap();
        assert_eq!(parsed.clusters[0].cluster.server, "https://127.0.0.1:9002");
        assert_eq!(parsed.clusters[0].cluster.certificate_authority, creds.ca.cert);
    }
}
