use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::{CertPair, CredentialBundle, CredentialIssuer};
use crate::error::SetupError;

const KEY_BITS: &str = "2048";

/// Issues a throw-away CA and leaf certificates with the `openssl` binary,
/// or reuses whatever a previous run left in the workdir.
#[derive(Debug, Clone)]
pub struct OpensslIssuer {
    openssl: PathBuf,
    validity_days: u32,
}

impl OpensslIssuer {
    pub fn new(openssl: PathBuf) -> Self {
        Self {
            openssl,
            validity_days: 365,
        }
    }

    pub fn with_validity_days(mut self, validity_days: u32) -> Self {
        self.validity_days = validity_days;
        self
    }

    fn run(&self, workdir: &Path, args: &[&str]) -> Result<(), SetupError> {
        let output = Command::new(&self.openssl)
            .args(args)
            .output()
            .map_err(|e| SetupError::Credentials {
                workdir: workdir.to_path_buf(),
                reason: format!("running {:?}: {}", self.openssl, e),
            })?;

        if !output.status.success() {
            return Err(SetupError::Credentials {
                workdir: workdir.to_path_buf(),
                reason: format!(
                    "openssl {} failed: {}",
                    args.first().unwrap_or(&""),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }

    fn issue_ca(&self, workdir: &Path, ca: &CertPair) -> Result<(), SetupError> {
        let days = self.validity_days.to_string();
        self.run(
            workdir,
            &[
                "req",
                "-x509",
                "-newkey",
                &format!("rsa:{}", KEY_BITS),
                "-nodes",
                "-keyout",
                &path_arg(&ca.key),
                "-out",
                &path_arg(&ca.cert),
                "-days",
                &days,
                "-subj",
                "/CN=kubevisor-ca",
            ],
        )
    }

    fn issue_leaf(
        &self,
        workdir: &Path,
        ca: &CertPair,
        leaf: &CertPair,
        subject: &str,
        extensions: &str,
    ) -> Result<(), SetupError> {
        let csr = leaf.cert.with_extension("csr");
        let ext = leaf.cert.with_extension("ext");
        std::fs::write(&ext, extensions).map_err(|source| SetupError::WriteFile {
            path: ext.clone(),
            source,
        })?;

        self.run(
            workdir,
            &[
                "req",
                "-newkey",
                &format!("rsa:{}", KEY_BITS),
                "-nodes",
                "-keyout",
                &path_arg(&leaf.key),
                "-out",
                &path_arg(&csr),
                "-subj",
                subject,
            ],
        )?;

        let days = self.validity_days.to_string();
        self.run(
            workdir,
            &[
                "x509",
                "-req",
                "-in",
                &path_arg(&csr),
                "-CA",
                &path_arg(&ca.cert),
                "-CAkey",
                &path_arg(&ca.key),
                "-CAcreateserial",
                "-out",
                &path_arg(&leaf.cert),
                "-days",
                &days,
                "-extfile",
                &path_arg(&ext),
            ],
        )
    }

    fn issue_service_account(&self, workdir: &Path, pair: &CertPair) -> Result<(), SetupError> {
        self.run(
            workdir,
            &["genrsa", "-out", &path_arg(&pair.key), KEY_BITS],
        )?;
        self.run(
            workdir,
            &[
                "rsa",
                "-in",
                &path_arg(&pair.key),
                "-pubout",
                "-out",
                &path_arg(&pair.cert),
            ],
        )
    }
}

impl CredentialIssuer for OpensslIssuer {
    fn create_or_load(
        &self,
        workdir: &Path,
        listen_address: IpAddr,
        service_address: IpAddr,
    ) -> Result<CredentialBundle, SetupError> {
        if let Ok(bundle) = CredentialBundle::load(workdir) {
            log::info!("reusing credentials in {:?}", bundle.pki_dir);
            return Ok(bundle);
        }

        let bundle = CredentialBundle::layout(workdir);
        std::fs::create_dir_all(&bundle.pki_dir).map_err(SetupError::Workdir)?;
        log::info!("issuing credentials in {:?}", bundle.pki_dir);

        self.issue_ca(workdir, &bundle.ca)?;
        self.issue_leaf(
            workdir,
            &bundle.ca,
            &bundle.apiserver,
            "/CN=kube-apiserver",
            &server_extensions(listen_address, service_address),
        )?;
        self.issue_leaf(
            workdir,
            &bundle.ca,
            &bundle.client,
            "/O=system:masters/CN=kubevisor-admin",
            "extendedKeyUsage=clientAuth\n",
        )?;
        self.issue_service_account(workdir, &bundle.service_account)?;

        Ok(bundle)
    }
}

fn server_extensions(listen_address: IpAddr, service_address: IpAddr) -> String {
    let mut names = vec![format!("IP:{}", listen_address)];
    if service_address != listen_address {
        names.push(format!("IP:{}", service_address));
    }
    names.extend(
        [
            "localhost",
            "kubernetes",
            "kubernetes.default",
            "kubernetes.default.svc",
        ]
        .iter()
        .map(|n| format!("DNS:{}", n)),
    );
    format!(
        "subjectAltName={}\nextendedKeyUsage=serverAuth,clientAuth\n",
        names.join(",")
    )
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
