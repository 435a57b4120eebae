use std::path::{Path, PathBuf};

use crate::error::SetupError;

/// Where to look for a binary before falling back to `PATH`.
#[derive(Debug, Clone, Default)]
pub struct SearchHints {
    pub root: Option<PathBuf>,
    pub extra_dirs: Vec<PathBuf>,
}

impl SearchHints {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root,
            extra_dirs: Vec::new(),
        }
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extra_dirs.push(dir.into());
        self
    }

    fn candidates(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(root) = &self.root {
            dirs.push(root.clone());
            dirs.push(root.join("bin"));
            dirs.push(root.join("third_party").join("bin"));
        }
        dirs.extend(self.extra_dirs.iter().cloned());
        dirs
    }
}

/// Resolves `name` to an executable file: hinted directories first, in order,
/// then `PATH`.
pub fn find_binary(name: &str, hints: &SearchHints) -> Result<PathBuf, SetupError> {
    let dirs = hints.candidates();
    for dir in &dirs {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            log::debug!("found {} at {:?}", name, candidate);
            return Ok(candidate);
        }
    }

    which::which(name).map_err(|_| SetupError::BinaryNotFound {
        name: name.to_string(),
        searched: dirs,
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
