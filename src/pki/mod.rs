pub mod openssl;

pub use openssl::OpensslIssuer;

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::error::SetupError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertPair {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl CertPair {
    fn in_dir(dir: &Path, stem: &str) -> Self {
        Self {
            cert: dir.join(format!("{}.pem", stem)),
            key: dir.join(format!("{}.key", stem)),
        }
    }
}

/// PKI material and kubeconfig location for one bring-up. Immutable once
/// issued; handlers share it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub pki_dir: PathBuf,
    pub ca: CertPair,
    pub apiserver: CertPair,
    pub client: CertPair,
    /// `cert` holds the public half, `key` the private half.
    pub service_account: CertPair,
    pub kubeconfig: PathBuf,
}

impl CredentialBundle {
    /// File layout under `workdir`; nothing is read or written.
    pub fn layout(workdir: &Path) -> Self {
        let pki_dir = workdir.join("pki");
        Self {
            ca: CertPair::in_dir(&pki_dir, "ca"),
            apiserver: CertPair::in_dir(&pki_dir, "kube-apiserver"),
            client: CertPair::in_dir(&pki_dir, "admin"),
            service_account: CertPair {
                cert: pki_dir.join("service-account.pub"),
                key: pki_dir.join("service-account.key"),
            },
            kubeconfig: workdir.join("kubeconfig"),
            pki_dir,
        }
    }

    pub fn material(&self) -> Vec<&Path> {
        vec![
            &self.ca.cert,
            &self.ca.key,
            &self.apiserver.cert,
            &self.apiserver.key,
            &self.client.cert,
            &self.client.key,
            &self.service_account.cert,
            &self.service_account.key,
        ]
    }

    pub fn missing_files(&self) -> Vec<PathBuf> {
        self.material()
            .into_iter()
            .filter(|p| !p.is_file())
            .map(Path::to_path_buf)
            .collect()
    }

    /// Loads a previously issued bundle; every file must already exist.
    pub fn load(workdir: &Path) -> Result<Self, SetupError> {
        let bundle = Self::layout(workdir);
        let missing = bundle.missing_files();
        if !missing.is_empty() {
            return Err(SetupError::Credentials {
                workdir: workdir.to_path_buf(),
                reason: format!("missing {:?}", missing),
            });
        }
        Ok(bundle)
    }
}

/// Produces or loads the credentials of a bring-up.
pub trait CredentialIssuer: Send + Sync {
    fn create_or_load(
        &self,
        workdir: &Path,
        listen_address: IpAddr,
        service_address: IpAddr,
    ) -> Result<CredentialBundle, SetupError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Writes placeholder files so a bundle loads without running openssl.
    pub struct PlaceholderIssuer;

    impl CredentialIssuer for PlaceholderIssuer {
        fn create_or_load(
            &self,
            workdir: &Path,
            _listen_address: IpAddr,
            _service_address: IpAddr,
        ) -> Result<CredentialBundle, SetupError> {
            let bundle = CredentialBundle::layout(workdir);
            std::fs::create_dir_all(&bundle.pki_dir).map_err(SetupError::Workdir)?;
            for path in bundle.material() {
                std::fs::write(path, "placeholder").map_err(|source| SetupError::WriteFile {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
            Ok(bundle)
        }
    }
}
