use futures::future::{BoxFuture, FutureExt};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use super::ServiceKind;
use crate::discovery::{find_binary, SearchHints};
use crate::error::{Result, SetupError, SupervisorError};
use crate::handlers::ServiceHandler;
use crate::harness::launch_watching;
use crate::pki::CredentialBundle;
use crate::types::ExecutionEnvironment;

/// How each service kind is located on disk and turned into a handler.
pub trait ServiceCatalog: Send + Sync {
    fn resolve_binary(
        &self,
        kind: ServiceKind,
        hints: &SearchHints,
    ) -> std::result::Result<PathBuf, SetupError> {
        find_binary(kind.binary_name(), hints)
    }

    fn construct(
        &self,
        kind: ServiceKind,
        env: &ExecutionEnvironment,
        creds: &Arc<CredentialBundle>,
    ) -> Result<ServiceHandler> {
        kind.construct(env, creds)
    }
}

/// The real Kubernetes binaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlPlaneCatalog;

impl ServiceCatalog for ControlPlaneCatalog {}

/// Prerequisite handlers in start order, the requested service last.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<ServiceHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handler: Arc<ServiceHandler>) {
        self.handlers.push(handler);
    }

    pub fn extend(&mut self, other: HandlerChain) {
        self.handlers.extend(other.handlers);
    }

    /// The service the chain was built for.
    pub fn leaf(&self) -> Option<&Arc<ServiceHandler>> {
        self.handlers.last()
    }

    pub fn handlers(&self) -> &[Arc<ServiceHandler>] {
        &self.handlers
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Stops every handler, dependents before their prerequisites.
    pub async fn shutdown(&self) {
        for handler in self.handlers.iter().rev() {
            handler.stop().await;
        }
    }
}

/// Builds the chain for `kind` with the real binaries.
pub async fn build(
    kind: ServiceKind,
    env: &ExecutionEnvironment,
    creds: &Arc<CredentialBundle>,
) -> Result<HandlerChain> {
    build_with(&ControlPlaneCatalog, kind, env, creds).await
}

/// Starts every prerequisite of `kind` (recursively, each healthy before the
/// next one begins) and appends an unstarted handler for `kind` itself.
/// Anything already started is stopped again when a later step fails.
pub fn build_with<'a>(
    catalog: &'a dyn ServiceCatalog,
    kind: ServiceKind,
    env: &'a ExecutionEnvironment,
    creds: &'a Arc<CredentialBundle>,
) -> BoxFuture<'a, Result<HandlerChain>> {
    async move {
        let mut chain = HandlerChain::new();

        for prerequisite in kind.prerequisites() {
            match start_prerequisite(catalog, *prerequisite, env, creds).await {
                Ok(started) => chain.extend(started),
                Err(e) => {
                    chain.shutdown().await;
                    return Err(SupervisorError::prerequisite(kind.as_str(), e));
                }
            }
        }

        match catalog.construct(kind, env, creds) {
            Ok(handler) => chain.push(Arc::new(handler)),
            Err(e) => {
                chain.shutdown().await;
                return Err(e);
            }
        }

        log::debug!("{}: chain {:?}", kind, chain.names());
        Ok(chain)
    }
    .boxed()
}

async fn start_prerequisite(
    catalog: &dyn ServiceCatalog,
    kind: ServiceKind,
    parent: &ExecutionEnvironment,
    creds: &Arc<CredentialBundle>,
) -> Result<HandlerChain> {
    let binary = catalog.resolve_binary(kind, &SearchHints::new(parent.binary_root.clone()))?;
    let workdir = parent.workdir_file(kind.as_str());
    std::fs::create_dir_all(&workdir).map_err(SetupError::Workdir)?;
    let env = parent.derive(binary, workdir);

    let chain = build_with(catalog, kind, &env, creds).await?;
    let Some(leaf) = chain.leaf().cloned() else {
        return Ok(chain);
    };

    log::info!("starting prerequisite {}", kind);
    let started = &chain.handlers()[..chain.len() - 1];
    if let Err(e) = launch_watching(&leaf, started, &[], &env.health).await {
        chain.shutdown().await;
        return Err(e);
    }
    Ok(chain)
}

/// Dependency-ordered start plan covering `kinds` and everything they need,
/// each service once.
pub fn build_plan(kinds: &[ServiceKind]) -> Vec<ServiceKind> {
    fn visit(kind: ServiceKind, seen: &mut HashSet<ServiceKind>, plan: &mut Vec<ServiceKind>) {
        if !seen.insert(kind) {
            return;
        }
        for prerequisite in kind.prerequisites() {
            visit(*prerequisite, seen, plan);
        }
        plan.push(kind);
    }

    let mut seen = HashSet::new();
    let mut plan = Vec::new();
    for kind in kinds {
        visit(*kind, &mut seen, &mut plan);
    }
    plan
}
