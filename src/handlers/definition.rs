use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::Result;

/// Binary plus literal argument vector; never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub binary: PathBuf,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new(binary: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
        }
    }

    /// Re-targets the command through `sudo_method` (e.g. `sudo`), keeping the
    /// wrapped binary as its first argument.
    pub fn elevated(self, sudo_method: Option<&str>) -> Self {
        let Some(sudo) = sudo_method.filter(|s| !s.is_empty()) else {
            return self;
        };
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(self.binary.to_string_lossy().to_string());
        args.extend(self.args);
        Self {
            binary: PathBuf::from(sudo),
            args,
        }
    }
}

/// What a handler launches and the hooks around each launch.
#[async_trait]
pub trait ServiceDefinition: Send + Sync {
    fn name(&self) -> &str;

    fn command(&self) -> LaunchCommand;

    async fn before_start(&self) -> Result<()> {
        Ok(())
    }

    async fn after_stop(&self) {}
}

/// A fixed command line with no hooks.
#[derive(Debug, Clone)]
pub struct CommandService {
    name: String,
    command: LaunchCommand,
}

impl CommandService {
    pub fn new(name: impl Into<String>, command: LaunchCommand) -> Self {
        Self {
            name: name.into(),
            command,
        }
    }
}

#[async_trait]
impl ServiceDefinition for CommandService {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> LaunchCommand {
        self.command.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elevated_prepends_binary() {
        let cmd = LaunchCommand::new(
            "/opt/k8s/kubelet",
            vec!["--config".to_string(), "/tmp/kubelet.yaml".to_string()],
        )
        .elevated(Some("sudo"));

        assert_eq!(cmd.binary, PathBuf::from("sudo"));
        assert_eq!(
            cmd.args,
            vec!["/opt/k8s/kubelet", "--config", "/tmp/kubelet.yaml"]
        );
    }

    #[test]
    fn test_elevated_without_method_is_unchanged() {
        let cmd = LaunchCommand::new("/opt/k8s/kubelet", vec![]);
        assert_eq!(cmd.clone().elevated(None), cmd);
        assert_eq!(cmd.clone().elevated(Some("")), cmd);
    }
}
