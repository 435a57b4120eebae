pub mod apiserver;
pub mod chain;
pub mod controller_manager;
pub mod etcd;
pub mod kubeconfig;
pub mod kubelet;
pub mod scheduler;

pub use chain::{build, build_plan, build_with, ControlPlaneCatalog, HandlerChain, ServiceCatalog};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Result, SetupError};
use crate::handlers::ServiceHandler;
use crate::pki::CredentialBundle;
use crate::types::ExecutionEnvironment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    Etcd,
    ApiServer,
    Scheduler,
    ControllerManager,
    Kubelet,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 5] = [
        ServiceKind::Etcd,
        ServiceKind::ApiServer,
        ServiceKind::Scheduler,
        ServiceKind::ControllerManager,
        ServiceKind::Kubelet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Etcd => "etcd",
            ServiceKind::ApiServer => "kube-apiserver",
            ServiceKind::Scheduler => "kube-scheduler",
            ServiceKind::ControllerManager => "kube-controller-manager",
            ServiceKind::Kubelet => "kubelet",
        }
    }

    /// Name of the executable to resolve on disk.
    pub fn binary_name(&self) -> &'static str {
        self.as_str()
    }

    /// Services that must be running and healthy first, in start order.
    pub fn prerequisites(&self) -> &'static [ServiceKind] {
        match self {
            ServiceKind::Etcd => &[],
            ServiceKind::ApiServer => &[ServiceKind::Etcd],
            ServiceKind::Scheduler | ServiceKind::ControllerManager | ServiceKind::Kubelet => {
                &[ServiceKind::ApiServer]
            }
        }
    }

    /// Derives this service's files from `env` and constructs its handler.
    /// The handler is not started.
    pub fn construct(
        &self,
        env: &ExecutionEnvironment,
        creds: &Arc<CredentialBundle>,
    ) -> Result<ServiceHandler> {
        match self {
            ServiceKind::Etcd => etcd::new_handler(env),
            ServiceKind::ApiServer => apiserver::new_handler(env, creds),
            ServiceKind::Scheduler => scheduler::new_handler(env, creds),
            ServiceKind::ControllerManager => controller_manager::new_handler(env, creds),
            ServiceKind::Kubelet => kubelet::new_handler(env, creds),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "etcd" => Ok(ServiceKind::Etcd),
            "kube-apiserver" | "apiserver" => Ok(ServiceKind::ApiServer),
            "kube-scheduler" | "scheduler" => Ok(ServiceKind::Scheduler),
            "kube-controller-manager" | "controller-manager" => {
                Ok(ServiceKind::ControllerManager)
            }
            "kubelet" => Ok(ServiceKind::Kubelet),
            other => Err(format!("unknown service: {}", other)),
        }
    }
}

pub(crate) fn write_file(path: &Path, contents: &str) -> std::result::Result<(), SetupError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SetupError::WriteFile {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, contents).map_err(|source| SetupError::WriteFile {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn render_yaml<T: Serialize>(
    what: &str,
    value: &T,
) -> std::result::Result<String, SetupError> {
    serde_yaml::to_string(value).map_err(|e| SetupError::Render {
        what: what.to_string(),
        reason: e.to_string(),
    })
}
