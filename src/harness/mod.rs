pub mod plan;

pub use plan::ControlPlane;

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::discovery::SearchHints;
use crate::error::{Result, SetupError, SupervisorError};
use crate::handlers::ServiceHandler;
use crate::pki::{CredentialBundle, CredentialIssuer};
use crate::process::{LogSink, OutputSink, PrintSink};
use crate::services::chain::{build_with, ControlPlaneCatalog, HandlerChain, ServiceCatalog};
use crate::services::{kubeconfig, ServiceKind};
use crate::types::env::HealthSettings;
use crate::types::{ExecutionEnvironment, ExitReport, HealthError, HealthMessage};

/// Inputs of one bring-up.
#[derive(Clone)]
pub struct BringUpOptions {
    pub name: String,
    /// Ignored when `parent` is set; its ports are inherited instead.
    pub port_base: u16,
    pub parent: Option<ExecutionEnvironment>,
    /// Fresh temporary directory when unset.
    pub workdir: Option<PathBuf>,
    pub search: SearchHints,
    pub listen_address: IpAddr,
    pub service_address: IpAddr,
    pub dns_address: IpAddr,
    pub sudo_method: Option<String>,
    pub health: HealthSettings,
    pub stop_grace_period: Duration,
    pub print_output: bool,
    /// Reused as-is instead of asking the issuer.
    pub credentials: Option<Arc<CredentialBundle>>,
    pub catalog: Arc<dyn ServiceCatalog>,
}

impl BringUpOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(name, &Config::default())
    }

    pub fn from_config(name: impl Into<String>, config: &Config) -> Self {
        Self {
            name: name.into(),
            port_base: config.port_base,
            parent: None,
            workdir: config.workdir.clone(),
            search: SearchHints::new(config.binary_root.clone()),
            listen_address: config.listen_address,
            service_address: config.service_address,
            dns_address: config.dns_address,
            sudo_method: config.sudo_method.clone(),
            health: config.health_settings(),
            stop_grace_period: Duration::from_millis(config.stop_grace_period_ms),
            print_output: config.print_output,
            credentials: None,
            catalog: Arc::new(ControlPlaneCatalog),
        }
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.health.tries = tries;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.health.interval = interval;
        self
    }

    pub fn with_parent(mut self, parent: &ExecutionEnvironment) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<CredentialBundle>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn ServiceCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    fn prepare_workdir(&self) -> std::result::Result<PathBuf, SetupError> {
        let dir = match (&self.workdir, &self.parent) {
            (Some(dir), _) => dir.clone(),
            (None, Some(parent)) => parent.workdir_file(&self.name),
            (None, None) => {
                return tempfile::Builder::new()
                    .prefix(&format!("kubevisor-{}-", self.name))
                    .tempdir()
                    .map(|dir| dir.keep())
                    .map_err(SetupError::Workdir);
            }
        };
        std::fs::create_dir_all(&dir).map_err(SetupError::Workdir)?;
        Ok(dir)
    }

    fn addresses(&self) -> (IpAddr, IpAddr) {
        match &self.parent {
            Some(parent) => (parent.listen_address, parent.service_address),
            None => (self.listen_address, self.service_address),
        }
    }

    async fn credentials(
        &self,
        workdir: &Path,
        issuer: Arc<dyn CredentialIssuer>,
    ) -> std::result::Result<Arc<CredentialBundle>, SetupError> {
        if let Some(credentials) = &self.credentials {
            return Ok(credentials.clone());
        }

        let (listen, service) = self.addresses();
        let dir = workdir.to_path_buf();
        let bundle = tokio::task::spawn_blocking(move || {
            issuer.create_or_load(&dir, listen, service)
        })
        .await
        .map_err(|e| SetupError::Credentials {
            workdir: workdir.to_path_buf(),
            reason: e.to_string(),
        })??;
        Ok(Arc::new(bundle))
    }

    fn environment(
        &self,
        binary: PathBuf,
        workdir: PathBuf,
    ) -> std::result::Result<ExecutionEnvironment, SetupError> {
        if let Some(parent) = &self.parent {
            return Ok(parent.derive(binary, workdir));
        }

        let output: Arc<dyn OutputSink> = if self.print_output {
            Arc::new(PrintSink)
        } else {
            Arc::new(LogSink)
        };
        let mut env = ExecutionEnvironment::new(binary, workdir, output);
        env.init_ports(self.port_base)?;
        env.binary_root = self.search.root.clone();
        env.listen_address = self.listen_address;
        env.service_address = self.service_address;
        env.dns_address = self.dns_address;
        env.sudo_method = self.sudo_method.clone();
        env.health = self.health;
        env.stop_grace_period = self.stop_grace_period;
        Ok(env)
    }

    /// Workdir, credentials and base environment shared by every handler of
    /// the bring-up.
    async fn prepare(
        &self,
        binary: PathBuf,
        issuer: Arc<dyn CredentialIssuer>,
    ) -> Result<Prepared> {
        let workdir = self.prepare_workdir()?;
        log::info!("{}: working in {:?}", self.name, workdir);
        let credentials = self.credentials(&workdir, issuer).await?;

        let mut env = self.environment(binary, workdir)?;
        let exits = if env.exit_sink.is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            env.exit_sink = Some(tx);
            Some(rx)
        } else {
            None
        };

        kubeconfig::write(&credentials.kubeconfig, &env, &credentials)?;
        Ok(Prepared {
            env,
            credentials,
            exits,
        })
    }
}

struct Prepared {
    env: ExecutionEnvironment,
    credentials: Arc<CredentialBundle>,
    exits: Option<mpsc::UnboundedReceiver<ExitReport>>,
}

/// A running chain plus everything it was started from.
pub struct BringUp {
    id: Uuid,
    name: String,
    env: ExecutionEnvironment,
    credentials: Arc<CredentialBundle>,
    chain: HandlerChain,
    attempts: u32,
    exits: Mutex<Option<mpsc::UnboundedReceiver<ExitReport>>>,
}

impl BringUp {
    fn new(prepared: Prepared, name: &str, chain: HandlerChain, attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            env: prepared.env,
            credentials: prepared.credentials,
            chain,
            attempts,
            exits: Mutex::new(prepared.exits),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> &ExecutionEnvironment {
        &self.env
    }

    pub fn credentials(&self) -> &Arc<CredentialBundle> {
        &self.credentials
    }

    pub fn chain(&self) -> &HandlerChain {
        &self.chain
    }

    pub fn leaf(&self) -> Option<&Arc<ServiceHandler>> {
        self.chain.leaf()
    }

    /// Health rounds the last started service needed.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Next unexpected termination of any handler in the chain. `None` when
    /// exits go to a parent's sink instead.
    pub async fn next_crash(&self) -> Option<ExitReport> {
        let mut exits = self.exits.lock().await;
        exits.as_mut()?.recv().await
    }

    /// Keeps polling every handler and logs readiness changes until the
    /// handler stops.
    pub fn monitor(&self) -> Vec<JoinHandle<()>> {
        self.chain
            .handlers()
            .iter()
            .map(|handler| {
                let (tx, mut rx) = mpsc::channel::<HealthMessage>(4);
                let checks = handler.enable_health_checks(tx, true);
                let name = handler.name().to_string();
                tokio::spawn(async move {
                    let mut healthy = true;
                    while let Some(message) = rx.recv().await {
                        match (&message.error, healthy) {
                            (Some(e), true) => log::warn!("{}: health check failed: {}", name, e),
                            (None, false) => log::info!("{}: healthy again", name),
                            _ => {}
                        }
                        healthy = message.is_healthy;
                    }
                    let _ = checks.await;
                })
            })
            .collect()
    }

    /// Stops every handler, dependents first.
    pub async fn shutdown(&self) {
        log::info!("{}: shutting down {:?}", self.name, self.chain.names());
        self.chain.shutdown().await;
    }
}

/// Resolves, configures and starts `kind` with all of its prerequisites, then
/// waits for it to report healthy.
pub async fn start_handler(
    options: &BringUpOptions,
    kind: ServiceKind,
    issuer: Arc<dyn CredentialIssuer>,
) -> Result<BringUp> {
    let binary = options.catalog.resolve_binary(kind, &options.search)?;
    let prepared = options.prepare(binary, issuer).await?;

    let chain = build_with(
        options.catalog.as_ref(),
        kind,
        &prepared.env,
        &prepared.credentials,
    )
    .await?;
    let Some(leaf) = chain.leaf().cloned() else {
        return Err(SupervisorError::Transition {
            service: kind.to_string(),
            reason: "no handler was constructed".to_string(),
        });
    };

    let started = &chain.handlers()[..chain.len() - 1];
    let launched = launch_watching(&leaf, started, &[], &prepared.env.health).await;
    match launched {
        Ok(attempts) => Ok(BringUp::new(prepared, &options.name, chain, attempts)),
        Err(e) => {
            chain.shutdown().await;
            Err(e)
        }
    }
}

/// Starts `handler` and polls it once per `interval`, at most `tries` times.
/// Returns the number of rounds it took to see a healthy result.
pub async fn launch_until_healthy(
    handler: &ServiceHandler,
    settings: &HealthSettings,
) -> Result<u32> {
    launch_watching(handler, &[], &[], settings).await
}

/// Like `launch_until_healthy`, but also gives up as soon as an already
/// running handler crashes. A crash of one of `prerequisites` is reported as a
/// `Prerequisite` failure of `handler`; a crash of one of `others` as is.
pub async fn launch_watching(
    handler: &ServiceHandler,
    prerequisites: &[Arc<ServiceHandler>],
    others: &[Arc<ServiceHandler>],
    settings: &HealthSettings,
) -> Result<u32> {
    let mut crashes = CrashWatch::new(handler, prerequisites, others);
    handler.start().await?;
    await_healthy(handler, &mut crashes, settings.tries, settings.interval).await
}

async fn await_healthy(
    handler: &ServiceHandler,
    crashes: &mut CrashWatch,
    tries: u32,
    interval: Duration,
) -> Result<u32> {
    let mut last = HealthError::NotChecked;
    for attempt in 1..=tries {
        if attempt > 1 {
            tokio::select! {
                biased;
                err = crashes.next() => return Err(err),
                _ = tokio::time::sleep(interval) => {}
            }
        }

        let (tx, mut rx) = mpsc::channel(1);
        handler.enable_health_checks(tx, false);
        let message = tokio::select! {
            biased;
            err = crashes.next() => return Err(err),
            message = rx.recv() => message
                .unwrap_or_else(|| HealthMessage::unhealthy(HealthError::NotChecked)),
        };

        if message.is_healthy {
            if let Some(err) = crashes.current() {
                return Err(err);
            }
            log::info!("{}: healthy after {} attempt(s)", handler.name(), attempt);
            return Ok(attempt);
        }
        log::debug!(
            "{}: attempt {}/{} unhealthy: {}",
            handler.name(),
            attempt,
            tries,
            message.error.as_ref().unwrap_or(&HealthError::NotChecked)
        );
        last = message.error.unwrap_or(HealthError::NotChecked);
    }

    Err(SupervisorError::Unhealthy {
        service: handler.name().to_string(),
        attempts: tries,
        last,
    })
}

/// Crash reports of the handler being started and of everything running
/// next to it.
struct CrashWatch {
    service: String,
    /// `true` marks a prerequisite of `service`.
    watched: Vec<(bool, watch::Receiver<Option<ExitReport>>)>,
}

impl CrashWatch {
    fn new(
        handler: &ServiceHandler,
        prerequisites: &[Arc<ServiceHandler>],
        others: &[Arc<ServiceHandler>],
    ) -> Self {
        let mut watched = vec![(false, handler.watch_crash())];
        watched.extend(prerequisites.iter().map(|h| (true, h.watch_crash())));
        watched.extend(others.iter().map(|h| (false, h.watch_crash())));
        Self {
            service: handler.name().to_string(),
            watched,
        }
    }

    fn error(&self, prerequisite: bool, exit: ExitReport) -> SupervisorError {
        let crash = SupervisorError::Crash {
            service: exit.service.clone(),
            exit,
        };
        if prerequisite {
            SupervisorError::prerequisite(self.service.clone(), crash)
        } else {
            crash
        }
    }

    /// A crash that has already been recorded.
    fn current(&self) -> Option<SupervisorError> {
        self.watched.iter().find_map(|(prerequisite, rx)| {
            let exit = rx.borrow().clone()?;
            Some(self.error(*prerequisite, exit))
        })
    }

    /// Resolves with the first crash of any watched handler.
    async fn next(&mut self) -> SupervisorError {
        let waits = self
            .watched
            .iter_mut()
            .map(|(prerequisite, rx)| {
                let prerequisite = *prerequisite;
                Box::pin(async move { (prerequisite, wait_crash(rx).await) })
            })
            .collect::<Vec<_>>();
        let (prerequisite, exit) = futures::future::select_all(waits).await.0;
        self.error(prerequisite, exit)
    }
}

async fn wait_crash(rx: &mut watch::Receiver<Option<ExitReport>>) -> ExitReport {
    let crash = rx
        .wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|exit| exit.clone());
    match crash {
        Some(exit) => exit,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{CommandService, LaunchCommand};
    use crate::health::{HttpProbe, TrimmedOk};
    use crate::pki::testing::PlaceholderIssuer;
    use crate::testing::ShellCatalog;
    use crate::types::{Readiness, ServiceState};
    use axum::{extract::State, routing::get, Router};
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    /// Arrival times of the requests a test server answered.
    #[derive(Clone, Default)]
    struct Hits(Arc<StdMutex<Vec<Instant>>>);

    impl Hits {
        fn record(&self) -> usize {
            let mut times = self.0.lock().unwrap();
            times.push(Instant::now());
            times.len()
        }

        fn count(&self) -> usize {
            self.0.lock().unwrap().len()
        }

        fn times(&self) -> Vec<Instant> {
            self.0.lock().unwrap().clone()
        }
    }

    /// `/healthz` answers `ok` from the `healthy_from`-th request on.
    async fn counting_server(healthy_from: usize) -> (String, Hits) {
        let hits = Hits::default();
        let router = Router::new()
            .route(
                "/healthz",
                get(|State((hits, from)): State<(Hits, usize)>| async move {
                    if hits.record() >= from {
                        "ok"
                    } else {
                        "not ok"
                    }
                }),
            )
            .with_state((hits.clone(), healthy_from));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{}/healthz", addr), hits)
    }

    /// Consecutive requests are at least `interval` apart.
    fn assert_spaced(times: &[Instant], interval: Duration) {
        for pair in times.windows(2) {
            assert!(
                pair[1] - pair[0] >= interval,
                "attempts {:?} apart, expected at least {:?}",
                pair[1] - pair[0],
                interval
            );
        }
    }

    /// A single shell service probed over HTTP.
    struct HttpCatalog {
        url: String,
        script: &'static str,
    }

    impl ServiceCatalog for HttpCatalog {
        fn resolve_binary(
            &self,
            _kind: ServiceKind,
            _hints: &SearchHints,
        ) -> std::result::Result<PathBuf, SetupError> {
            Ok(PathBuf::from("/bin/sh"))
        }

        fn construct(
            &self,
            kind: ServiceKind,
            env: &ExecutionEnvironment,
            _creds: &Arc<CredentialBundle>,
        ) -> Result<ServiceHandler> {
            let definition = CommandService::new(
                kind.as_str(),
                LaunchCommand::new("/bin/sh", vec!["-c".to_string(), self.script.to_string()]),
            );
            let probe =
                HttpProbe::new(self.url.clone(), Arc::new(TrimmedOk), Duration::from_secs(2))?;
            Ok(ServiceHandler::new(Arc::new(definition), Arc::new(probe), env))
        }
    }

    fn options(dir: &Path, catalog: Arc<dyn ServiceCatalog>, tries: u32) -> BringUpOptions {
        let mut options = BringUpOptions::new("test")
            .with_tries(tries)
            .with_interval(Duration::from_millis(10))
            .with_catalog(catalog);
        options.workdir = Some(dir.to_path_buf());
        options.port_base = 9800;
        options.stop_grace_period = Duration::from_secs(1);
        options
    }

    #[tokio::test]
    async fn test_exhausted_retries_probe_exactly_n_times() {
        let (url, hits) = counting_server(usize::MAX).await;
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(HttpCatalog {
            url,
            script: "exec sleep 30",
        });

        let interval = Duration::from_millis(150);
        let options = options(dir.path(), catalog, 4).with_interval(interval);

        let err = start_handler(&options, ServiceKind::Etcd, Arc::new(PlaceholderIssuer))
            .await
            .err()
            .unwrap();
        let returned = Instant::now();

        match err {
            SupervisorError::Unhealthy {
                service,
                attempts,
                last,
            } => {
                assert_eq!(service, "etcd");
                assert_eq!(attempts, 4);
                assert_eq!(last, HealthError::Body("not ok".to_string()));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(hits.count(), 4);

        let times = hits.times();
        assert_spaced(&times, interval);
        assert!(times[3] - times[0] >= interval * 3);
        // No wait after the final attempt.
        assert!(returned - times[3] < interval);
    }

    #[tokio::test]
    async fn test_success_on_third_attempt_stops_probing() {
        let (url, hits) = counting_server(3).await;
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(HttpCatalog {
            url,
            script: "exec sleep 30",
        });

        let interval = Duration::from_millis(150);
        let options = options(dir.path(), catalog, 5).with_interval(interval);

        let bring_up = start_handler(&options, ServiceKind::Etcd, Arc::new(PlaceholderIssuer))
            .await
            .unwrap();
        let returned = Instant::now();

        assert_eq!(bring_up.attempts(), 3);
        assert_eq!(hits.count(), 3);
        let times = hits.times();
        assert_spaced(&times, interval);
        assert!(returned - times[2] < interval);

        let leaf = bring_up.leaf().unwrap().clone();
        assert_eq!(leaf.state(), ServiceState::Running(Readiness::Healthy));
        assert!(bring_up.credentials().kubeconfig.is_file());

        bring_up.shutdown().await;
        assert_eq!(leaf.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_crash_during_retries_aborts() {
        let (url, _hits) = counting_server(usize::MAX).await;
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(HttpCatalog {
            url,
            script: "sleep 0.1; exit 3",
        });
        let options = options(dir.path(), catalog, 200).with_interval(Duration::from_millis(50));

        let err = start_handler(&options, ServiceKind::Etcd, Arc::new(PlaceholderIssuer))
            .await
            .err()
            .unwrap();

        match err {
            SupervisorError::Crash { service, exit } => {
                assert_eq!(service, "etcd");
                assert_eq!(exit.code, Some(3));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_prerequisite_crash_while_leaf_retries() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(
            ShellCatalog::healthy()
                .script(ServiceKind::Etcd, "sleep 0.3; exit 5")
                .unhealthy(ServiceKind::Scheduler),
        );
        let options = options(dir.path(), catalog.clone(), 200)
            .with_interval(Duration::from_millis(20));

        let err = start_handler(&options, ServiceKind::Scheduler, Arc::new(PlaceholderIssuer))
            .await
            .err()
            .unwrap();

        assert_eq!(err.failure_path(), vec!["kube-scheduler", "etcd"]);
        match err.root_cause() {
            SupervisorError::Crash { service, exit } => {
                assert_eq!(service, "etcd");
                assert_eq!(exit.code, Some(5));
            }
            other => panic!("unexpected root cause: {}", other),
        }
        for kind in [ServiceKind::Etcd, ServiceKind::ApiServer, ServiceKind::Scheduler] {
            assert_eq!(catalog.state(kind), Some(ServiceState::Stopped));
        }
    }

    #[tokio::test]
    async fn test_stopping_prerequisite_keeps_dependent_polling() {
        let dir = tempfile::tempdir().unwrap();
        let bring_up = start_handler(
            &options(dir.path(), Arc::new(ShellCatalog::healthy()), 3),
            ServiceKind::Scheduler,
            Arc::new(PlaceholderIssuer),
        )
        .await
        .unwrap();

        let handlers = bring_up.chain().handlers().to_vec();
        assert_eq!(
            bring_up.chain().names(),
            vec!["etcd", "kube-apiserver", "kube-scheduler"]
        );
        let scheduler = handlers[2].clone();

        let (tx, mut rx) = mpsc::channel(1);
        let loop_task = scheduler.enable_health_checks(tx, true);
        assert!(rx.recv().await.unwrap().is_healthy);

        handlers[0].stop().await;
        assert_eq!(handlers[0].state(), ServiceState::Stopped);

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert_eq!(scheduler.state(), ServiceState::Running(Readiness::Healthy));
        assert!(!loop_task.is_finished());

        bring_up.shutdown().await;
        tokio::time::timeout(Duration::from_secs(2), loop_task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_child_bring_up_inherits_parent_environment() {
        let dir = tempfile::tempdir().unwrap();
        let catalog: Arc<dyn ServiceCatalog> = Arc::new(ShellCatalog::healthy());
        let parent = start_handler(
            &options(dir.path(), catalog.clone(), 3),
            ServiceKind::Etcd,
            Arc::new(PlaceholderIssuer),
        )
        .await
        .unwrap();

        let mut child_options = BringUpOptions::new("child")
            .with_parent(parent.env())
            .with_credentials(parent.credentials().clone())
            .with_catalog(catalog);
        child_options.port_base = 1;
        let child = start_handler(&child_options, ServiceKind::Etcd, Arc::new(PlaceholderIssuer))
            .await
            .unwrap();

        assert_eq!(child.env().ports, parent.env().ports);
        assert_eq!(child.env().workdir, dir.path().join("child"));
        assert_eq!(child.credentials(), parent.credentials());
        assert!(child.next_crash().await.is_none());

        child.shutdown().await;
        parent.shutdown().await;
    }
}
