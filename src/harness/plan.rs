use std::path::PathBuf;
use std::sync::Arc;

use super::{launch_watching, BringUp, BringUpOptions, Prepared};
use crate::error::{Result, SetupError, SupervisorError};
use crate::pki::CredentialIssuer;
use crate::services::{build_plan, HandlerChain, ServiceKind};

/// Several services brought up together, each shared prerequisite once.
pub struct ControlPlane {
    plan: Vec<ServiceKind>,
    bring_up: BringUp,
}

impl ControlPlane {
    /// Starts every service of the plan for `kinds` in dependency order, each
    /// healthy before the next. On failure everything started so far is
    /// stopped again.
    pub async fn up(
        options: &BringUpOptions,
        kinds: &[ServiceKind],
        issuer: Arc<dyn CredentialIssuer>,
    ) -> Result<Self> {
        let plan = build_plan(kinds);
        let binaries = plan
            .iter()
            .map(|kind| options.catalog.resolve_binary(*kind, &options.search))
            .collect::<std::result::Result<Vec<_>, SetupError>>()?;
        let Some(first) = binaries.first().cloned() else {
            return Err(SetupError::NothingRequested.into());
        };
        log::info!("{}: plan {:?}", options.name, plan);

        let prepared = options.prepare(first, issuer).await?;
        let mut chain = HandlerChain::new();
        let mut attempts = 0;

        for (kind, binary) in plan.iter().zip(binaries) {
            let started = start_one(options, *kind, binary, &prepared, &mut chain)
                .await
                .and_then(|rounds| crashed(&chain).map_or(Ok(rounds), Err));
            match started {
                Ok(rounds) => attempts = rounds,
                Err(e) => {
                    chain.shutdown().await;
                    return Err(e);
                }
            }
        }

        Ok(Self {
            plan,
            bring_up: BringUp::new(prepared, &options.name, chain, attempts),
        })
    }

    pub fn plan(&self) -> &[ServiceKind] {
        &self.plan
    }

    pub fn bring_up(&self) -> &BringUp {
        &self.bring_up
    }

    pub async fn shutdown(&self) {
        self.bring_up.shutdown().await;
    }
}

async fn start_one(
    options: &BringUpOptions,
    kind: ServiceKind,
    binary: PathBuf,
    prepared: &Prepared,
    chain: &mut HandlerChain,
) -> Result<u32> {
    let workdir = prepared.env.workdir_file(kind.as_str());
    std::fs::create_dir_all(&workdir).map_err(SetupError::Workdir)?;
    let env = prepared.env.derive(binary, workdir);

    let handler = Arc::new(options.catalog.construct(kind, &env, &prepared.credentials)?);
    let needed = build_plan(&[kind]);
    let (prerequisites, others): (Vec<_>, Vec<_>) = chain
        .handlers()
        .iter()
        .cloned()
        .partition(|h| needed.iter().any(|k| k.as_str() == h.name()));
    chain.push(handler.clone());
    launch_watching(&handler, &prerequisites, &others, &env.health).await
}

/// Crash of any service in `chain` that has not been reported yet.
fn crashed(chain: &HandlerChain) -> Option<SupervisorError> {
    chain.handlers().iter().find_map(|handler| {
        let exit = handler.last_crash()?;
        Some(SupervisorError::Crash {
            service: handler.name().to_string(),
            exit,
        })
    })
}
