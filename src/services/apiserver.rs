use std::net::IpAddr;
use std::sync::Arc;

use super::{etcd, kubeconfig, ServiceKind};
use crate::error::Result;
use crate::handlers::{CommandService, LaunchCommand, ServiceHandler};
use crate::health::{HttpProbe, TrimmedOk};
use crate::pki::CredentialBundle;
use crate::types::ExecutionEnvironment;

const SERVICE_ACCOUNT_ISSUER: &str = "https://kubernetes.default.svc";

/// `/24` around the service address, which must lie inside the service range.
pub fn service_cluster_ip_range(service_address: IpAddr) -> String {
    match service_address {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            format!("{}.{}.{}.0/24", a, b, c)
        }
        IpAddr::V6(v6) => format!("{}/120", v6),
    }
}

pub fn args(env: &ExecutionEnvironment, creds: &CredentialBundle) -> Vec<String> {
    let path = |p: &std::path::Path| p.to_string_lossy().to_string();
    vec![
        format!("--bind-address={}", env.listen_address),
        format!("--advertise-address={}", env.listen_address),
        format!("--secure-port={}", env.ports.kube_api),
        format!("--etcd-servers={}", etcd::client_url(env)),
        format!("--tls-cert-file={}", path(&creds.apiserver.cert)),
        format!("--tls-private-key-file={}", path(&creds.apiserver.key)),
        format!("--client-ca-file={}", path(&creds.ca.cert)),
        format!("--kubelet-client-certificate={}", path(&creds.client.cert)),
        format!("--kubelet-client-key={}", path(&creds.client.key)),
        format!(
            "--service-account-key-file={}",
            path(&creds.service_account.cert)
        ),
        format!(
            "--service-account-signing-key-file={}",
            path(&creds.service_account.key)
        ),
        format!("--service-account-issuer={}", SERVICE_ACCOUNT_ISSUER),
        format!(
            "--service-cluster-ip-range={}",
            service_cluster_ip_range(env.service_address)
        ),
        "--authorization-mode=Node,RBAC".to_string(),
        "--allow-privileged=true".to_string(),
    ]
}

pub fn new_handler(
    env: &ExecutionEnvironment,
    creds: &Arc<CredentialBundle>,
) -> Result<ServiceHandler> {
    let probe = HttpProbe::with_ca(
        format!("{}/healthz", kubeconfig::api_server_url(env)),
        Arc::new(TrimmedOk),
        env.health.probe_timeout,
        &creds.ca.cert,
    )?;
    let definition = CommandService::new(
        ServiceKind::ApiServer.as_str(),
        LaunchCommand::new(env.binary.clone(), args(env, creds)),
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
    use std::path::{Path, PathBuf};

    #[test]
    fn test_service_range_contains_service_address() {
        assert_eq!(
            service_cluster_ip_range("127.1.1.1".parse().unwrap()),
            "127.1.1.0/24"
        );
    }

    #[test]
    fn test_args_wire_etcd_and_credentials() {
        let mut env = ExecutionEnvironment::new(
            PathBuf::from("/usr/local/bin/kube-apiserver"),
            PathBuf::from("/tmp/apiserver"),
            Arc::new(NullSink),
        );
        env.init_ports(9400).unwrap();
        let creds = CredentialBundle::layout(Path::new("/tmp/bringup"));

        let args = args(&env, &creds);
        assert!(args.contains(&"--secure-port=9402".to_string()));
        assert!(args.contains(&"--etcd-servers=http://127.0.0.1:9400".to_string()));
        assert!(args.contains(&"--client-ca-file=/tmp/bringup/pki/ca.pem".to_string()));
        assert!(args
            .iter()
            .any(|a| a == "--service-account-key-file=/tmp/bringup/pki/service-account.pub"));
    }

    #[test]
    fn test_unreadable_ca_is_setup_error() {
        let env = ExecutionEnvironment::new(
            PathBuf::from("/usr/local/bin/kube-apiserver"),
            PathBuf::from("/tmp/apiserver"),
            Arc::new(NullSink),
        );
        let creds = Arc::new(CredentialBundle::layout(Path::new("/nonexistent/bringup")));
        assert!(matches!(
            new_handler(&env, &creds),
            Err(crate::error::SupervisorError::Setup(_))
        ));
    }
}
