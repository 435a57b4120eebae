use serde::{Deserialize, Serialize};

use crate::types::{ExitReport, HealthMessage, ServiceState};

/// Published on a handler's subscription channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandlerEvent {
    StateChanged {
        service: String,
        from: ServiceState,
        to: ServiceState,
    },
    Health {
        service: String,
        message: HealthMessage,
    },
    /// Every process exit, requested or not.
    Exited(ExitReport),
    /// Unexpected exit that moved the handler to `Failed`.
    Crashed(ExitReport),
}

impl HandlerEvent {
    pub fn service(&self) -> &str {
        match self {
            HandlerEvent::StateChanged { service, .. } | HandlerEvent::Health { service, .. } => {
                service
            }
            HandlerEvent::Exited(report) | HandlerEvent::Crashed(report) => &report.service,
        }
    }
}
