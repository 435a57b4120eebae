use std::net::SocketAddr;
use std::sync::Arc;

use super::{apiserver, kubeconfig, ServiceKind};
use crate::error::Result;
use crate::handlers::{CommandService, LaunchCommand, ServiceHandler};
use crate::health::{HttpProbe, TrimmedOk};
use crate::pki::CredentialBundle;
use crate::types::ExecutionEnvironment;

pub fn args(
    env: &ExecutionEnvironment,
    creds: &CredentialBundle,
    kubeconfig: &std::path::Path,
) -> Vec<String> {
    let path = |p: &std::path::Path| p.to_string_lossy().to_string();
    vec![
        format!("--kubeconfig={}", path(kubeconfig)),
        format!("--bind-address={}", env.listen_address),
        format!("--secure-port={}", env.ports.kube_controller_manager_health),
        format!("--tls-cert-file={}", path(&creds.apiserver.cert)),
        format!("--tls-private-key-file={}", path(&creds.apiserver.key)),
        format!("--root-ca-file={}", path(&creds.ca.cert)),
        format!("--cluster-signing-cert-file={}", path(&creds.ca.cert)),
        format!("--cluster-signing-key-file={}", path(&creds.ca.key)),
        format!(
            "--service-account-private-key-file={}",
            path(&creds.service_account.key)
        ),
        format!(
            "--service-cluster-ip-range={}",
            apiserver::service_cluster_ip_range(env.service_address)
        ),
        "--use-service-account-credentials=true".to_string(),
        "--leader-elect=false".to_string(),
    ]
}

pub fn health_url(env: &ExecutionEnvironment) -> String {
    format!(
        "https://{}/healthz",
        SocketAddr::new(env.listen_address, env.ports.kube_controller_manager_health)
    )
}

pub fn new_handler(
    env: &ExecutionEnvironment,
    creds: &Arc<CredentialBundle>,
) -> Result<ServiceHandler> {
    let kubeconfig_path = env.workdir_file("kubeconfig");
    kubeconfig::write(&kubeconfig_path, env, creds)?;

    // Serves with the api server's certificate so the probe can trust our CA.
    let probe = HttpProbe::with_ca(
        health_url(env),
        Arc::new(TrimmedOk),
        env.health.probe_timeout,
        &creds.ca.cert,
    )?;
    let definition = CommandService::new(
        ServiceKind::ControllerManager.as_str(),
        LaunchCommand::new(env.binary.clone(), args(env, creds, &kubeconfig_path)),
    );

    Ok(ServiceHandler::new(
        Arc::new(definition),
        Arc::new(probe),
        env,
    ))
}
