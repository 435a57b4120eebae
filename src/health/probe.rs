use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::check::ResponseCheck;
use crate::error::SetupError;
use crate::types::{HealthError, HealthMessage};

/// One health round trip. Implementations must never panic on transport
/// failures; those become unhealthy messages.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check_once(&self) -> HealthMessage;

    fn target(&self) -> &str;
}

pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    check: Arc<dyn ResponseCheck>,
}

impl HttpProbe {
    pub fn new(
        url: impl Into<String>,
        check: Arc<dyn ResponseCheck>,
        timeout: Duration,
    ) -> Result<Self, SetupError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("kubevisor/1.0")
            .build()
            .map_err(SetupError::HttpClient)?;

        Ok(Self::with_client(client, url, check))
    }

    /// HTTPS probe trusting the PEM-encoded CA at `ca_path`.
    pub fn with_ca(
        url: impl Into<String>,
        check: Arc<dyn ResponseCheck>,
        timeout: Duration,
        ca_path: &Path,
    ) -> Result<Self, SetupError> {
        let pem = std::fs::read(ca_path).map_err(|e| SetupError::Credentials {
            workdir: ca_path.to_path_buf(),
            reason: format!("reading CA certificate: {}", e),
        })?;
        let ca = reqwest::Certificate::from_pem(&pem).map_err(|e| SetupError::Credentials {
            workdir: ca_path.to_path_buf(),
            reason: format!("parsing CA certificate: {}", e),
        })?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("kubevisor/1.0")
            .add_root_certificate(ca)
            .build()
            .map_err(SetupError::HttpClient)?;

        Ok(Self::with_client(client, url, check))
    }

    pub fn with_client(
        client: reqwest::Client,
        url: impl Into<String>,
        check: Arc<dyn ResponseCheck>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            check,
        }
    }

    async fn round_trip(&self) -> Result<(), HealthError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| HealthError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| HealthError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(HealthError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        self.check.evaluate(&body)
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check_once(&self) -> HealthMessage {
        let message = HealthMessage::from_result(self.round_trip().await);
        if let Some(err) = &message.error {
            log::debug!("probe {} unhealthy: {}", self.url, err);
        }
        message
    }

    fn target(&self) -> &str {
        &self.url
    }
}
