use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::ExitReport;
use crate::error::SetupError;
use crate::process::OutputSink;

const PORT_COUNT: u16 = 7;

/// Per-service port assignments for one bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ports {
    pub etcd_client: u16,
    pub etcd_peer: u16,
    pub kube_api: u16,
    pub kube_scheduler_health: u16,
    pub kube_controller_manager_health: u16,
    pub kubelet_api: u16,
    pub kubelet_health: u16,
}

impl Ports {
    pub fn from_base(base: u16) -> Option<Self> {
        base.checked_add(PORT_COUNT - 1)?;
        Some(Self {
            etcd_client: base,
            etcd_peer: base + 1,
            kube_api: base + 2,
            kube_scheduler_health: base + 3,
            kube_controller_manager_health: base + 4,
            kubelet_api: base + 5,
            kubelet_health: base + 6,
        })
    }

    pub fn all(&self) -> Vec<(&'static str, u16)> {
        vec![
            ("etcd-client", self.etcd_client),
            ("etcd-peer", self.etcd_peer),
            ("kube-apiserver", self.kube_api),
            ("kube-scheduler-health", self.kube_scheduler_health),
            (
                "kube-controller-manager-health",
                self.kube_controller_manager_health,
            ),
            ("kubelet-api", self.kubelet_api),
            ("kubelet-health", self.kubelet_health),
        ]
    }
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            etcd_client: 7000,
            etcd_peer: 7001,
            kube_api: 7002,
            kube_scheduler_health: 7003,
            kube_controller_manager_health: 7004,
            kubelet_api: 7005,
            kubelet_health: 7006,
        }
    }
}

/// Bounds for health polling, shared by the harness and prerequisite start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSettings {
    pub tries: u32,
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            tries: 30,
            interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Everything a service needs to be configured and launched. Read-only once
/// handlers have been constructed from it.
#[derive(Clone)]
pub struct ExecutionEnvironment {
    pub binary: PathBuf,
    pub binary_root: Option<PathBuf>,
    pub listen_address: IpAddr,
    pub service_address: IpAddr,
    pub dns_address: IpAddr,
    pub ports: Ports,
    pub workdir: PathBuf,
    pub sudo_method: Option<String>,
    pub output: Arc<dyn OutputSink>,
    pub exit_sink: Option<mpsc::UnboundedSender<ExitReport>>,
    pub health: HealthSettings,
    pub stop_grace_period: Duration,
}

impl ExecutionEnvironment {
    pub fn new(binary: PathBuf, workdir: PathBuf, output: Arc<dyn OutputSink>) -> Self {
        Self {
            binary,
            binary_root: None,
            listen_address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            service_address: IpAddr::V4(Ipv4Addr::new(127, 1, 1, 1)),
            dns_address: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            ports: Ports::default(),
            workdir,
            sudo_method: None,
            output,
            exit_sink: None,
            health: HealthSettings::default(),
            stop_grace_period: Duration::from_secs(5),
        }
    }

    pub fn init_ports(&mut self, base: u16) -> Result<(), SetupError> {
        self.ports = Ports::from_base(base).ok_or(SetupError::PortRange { base })?;
        Ok(())
    }

    /// Takes over every shared field of `base`; `binary` and `workdir` stay ours.
    pub fn copy_information_from_base(&mut self, base: &ExecutionEnvironment) {
        self.binary_root = base.binary_root.clone();
        self.listen_address = base.listen_address;
        self.service_address = base.service_address;
        self.dns_address = base.dns_address;
        self.ports = base.ports;
        self.sudo_method = base.sudo_method.clone();
        self.output = base.output.clone();
        self.exit_sink = base.exit_sink.clone();
        self.health = base.health;
        self.stop_grace_period = base.stop_grace_period;
    }

    /// Sub-environment for another service of the same bring-up.
    pub fn derive(&self, binary: PathBuf, workdir: PathBuf) -> Self {
        let mut env = Self::new(binary, workdir, self.output.clone());
        env.copy_information_from_base(self);
        env
    }

    pub fn workdir_file(&self, name: &str) -> PathBuf {
        self.workdir.join(name)
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }
}
