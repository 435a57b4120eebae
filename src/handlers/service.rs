use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::definition::ServiceDefinition;
use super::events::HandlerEvent;
use super::state_machine::{HandlerStateMachine, InvalidTransition, LifecycleEvent};
use crate::error::{LaunchError, Result, SupervisorError};
use crate::health::HealthProbe;
use crate::process::ProcessRunner;
use crate::types::{ExecutionEnvironment, ExitReport, HealthMessage, ServiceState};

const EVENT_CAPACITY: usize = 64;

/// State shared with the exit watcher and health loops.
struct Shared {
    name: String,
    state: watch::Sender<ServiceState>,
    events: broadcast::Sender<HandlerEvent>,
    exit_sink: Option<mpsc::UnboundedSender<ExitReport>>,
    crash: watch::Sender<Option<ExitReport>>,
    generation: AtomicU64,
}

impl Shared {
    fn apply(&self, event: LifecycleEvent) -> std::result::Result<ServiceState, InvalidTransition> {
        let mut outcome = None;
        self.state.send_if_modified(|state| {
            match HandlerStateMachine::transition(*state, event) {
                Ok(next) => {
                    let from = *state;
                    *state = next;
                    outcome = Some(Ok((from, next)));
                    from != next
                }
                Err(e) => {
                    outcome = Some(Err(e));
                    false
                }
            }
        });

        let (from, to) = match outcome {
            Some(result) => result?,
            None => return Ok(*self.state.borrow()),
        };
        if from != to {
            log::info!("{}: {} -> {}", self.name, from, to);
            let _ = self.events.send(HandlerEvent::StateChanged {
                service: self.name.clone(),
                from,
                to,
            });
        }
        Ok(to)
    }

    fn record_health(&self, message: &HealthMessage) {
        if message.is_healthy && self.state.borrow().is_running() {
            if let Err(e) = self.apply(LifecycleEvent::HealthPassed) {
                log::debug!("{}: ignoring health result: {}", self.name, e);
            }
        }
        let _ = self.events.send(HandlerEvent::Health {
            service: self.name.clone(),
            message: message.clone(),
        });
    }

    fn handle_exit(&self, report: ExitReport, generation: u64) {
        let _ = self.events.send(HandlerEvent::Exited(report.clone()));
        if !report.is_unexpected() {
            log::debug!("{}: stopped ({})", self.name, report);
            return;
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            log::debug!("{}: exit report from an earlier run: {}", self.name, report);
            return;
        }

        match self.apply(LifecycleEvent::Crashed) {
            Ok(_) => {
                log::error!("{}: terminated unexpectedly: {}", self.name, report);
                self.crash.send_replace(Some(report.clone()));
                let _ = self.events.send(HandlerEvent::Crashed(report.clone()));
                if let Some(sink) = &self.exit_sink {
                    let _ = sink.send(report);
                }
            }
            Err(e) => log::debug!("{}: late exit report ignored: {}", self.name, e),
        }
    }
}

/// Supervises one external binary: launch, crash detection, health polling
/// and shutdown.
pub struct ServiceHandler {
    shared: Arc<Shared>,
    definition: Arc<dyn ServiceDefinition>,
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    runner: Mutex<ProcessRunner>,
}

impl ServiceHandler {
    pub fn new(
        definition: Arc<dyn ServiceDefinition>,
        probe: Arc<dyn HealthProbe>,
        env: &ExecutionEnvironment,
    ) -> Self {
        let name = definition.name().to_string();
        let (state, _) = watch::channel(ServiceState::Uninitialized);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (crash, _) = watch::channel(None);
        let runner = ProcessRunner::new(name.clone(), env.output.clone())
            .with_grace_period(env.stop_grace_period);

        Self {
            shared: Arc::new(Shared {
                name,
                state,
                events,
                exit_sink: env.exit_sink.clone(),
                crash,
                generation: AtomicU64::new(0),
            }),
            definition,
            probe,
            interval: env.health.interval,
            runner: Mutex::new(runner),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ServiceState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ServiceState> {
        self.shared.state.subscribe()
    }

    /// Exit report of the last unexpected termination; cleared by `start`.
    pub fn watch_crash(&self) -> watch::Receiver<Option<ExitReport>> {
        self.shared.crash.subscribe()
    }

    pub fn last_crash(&self) -> Option<ExitReport> {
        self.shared.crash.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HandlerEvent> {
        self.shared.events.subscribe()
    }

    pub fn probe_target(&self) -> &str {
        self.probe.target()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.runner.lock().await.pid()
    }

    /// Launches the service. Fails without side effects if a process is
    /// already running.
    pub async fn start(&self) -> Result<()> {
        let mut runner = self.runner.lock().await;
        if runner.is_running() {
            return Err(LaunchError::AlreadyRunning {
                service: self.name().to_string(),
                pid: runner.pid(),
            }
            .into());
        }

        self.shared
            .apply(LifecycleEvent::StartRequested)
            .map_err(|e| LaunchError::InvalidState {
                service: self.name().to_string(),
                state: e.from.to_string(),
            })?;
        self.shared.crash.send_replace(None);

        if let Err(e) = self.definition.before_start().await {
            self.fail_launch();
            return Err(e);
        }

        let command = self.definition.command();
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        if let Err(e) = runner.start(&command.binary, &command.args, exit_tx) {
            self.fail_launch();
            return Err(e.into());
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared
            .apply(LifecycleEvent::Launched)
            .map_err(|e| SupervisorError::Transition {
                service: self.name().to_string(),
                reason: e.to_string(),
            })?;

        // Spawned after `Launched` so a fast crash cannot overtake it.
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Some(report) = exit_rx.recv().await {
                shared.handle_exit(report, generation);
            }
        });

        Ok(())
    }

    /// Stops the process and waits for it to exit. No-op when nothing was
    /// ever started or the handler is already stopped.
    pub async fn stop(&self) {
        if matches!(
            self.state(),
            ServiceState::Uninitialized | ServiceState::Stopped
        ) {
            return;
        }

        self.runner.lock().await.stop().await;
        self.definition.after_stop().await;

        if let Err(e) = self.shared.apply(LifecycleEvent::StopCompleted) {
            log::warn!("{}: {}", self.name(), e);
        }
    }

    /// Stops the process and marks the handler `Failed`.
    pub async fn abort(&self, reason: &str) {
        log::warn!("{}: aborting: {}", self.name(), reason);
        self.runner.lock().await.stop().await;
        if let Err(e) = self.shared.apply(LifecycleEvent::Aborted) {
            log::debug!("{}: {}", self.name(), e);
        }
    }

    /// One probe round; updates readiness and publishes the result.
    pub async fn check_health(&self) -> HealthMessage {
        let message = self.probe.check_once().await;
        self.shared.record_health(&message);
        message
    }

    /// Runs probes on a separate task and returns immediately. With
    /// `repeat` the task keeps polling every interval until the handler is
    /// stopped or `results` is closed; otherwise it performs a single check.
    pub fn enable_health_checks(
        &self,
        results: mpsc::Sender<HealthMessage>,
        repeat: bool,
    ) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let probe = self.probe.clone();
        let interval = self.interval;
        let mut state_rx = self.shared.state.subscribe();

        tokio::spawn(async move {
            loop {
                let message = probe.check_once().await;
                shared.record_health(&message);

                tokio::select! {
                    biased;
                    sent = results.send(message) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                    _ = wait_stopped(&mut state_rx) => break,
                }

                if !repeat {
                    break;
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = wait_stopped(&mut state_rx) => break,
                }
            }
        })
    }

    fn fail_launch(&self) {
        if let Err(e) = self.shared.apply(LifecycleEvent::LaunchFailed) {
            log::debug!("{}: {}", self.name(), e);
        }
    }
}

async fn wait_stopped(state_rx: &mut watch::Receiver<ServiceState>) {
    let _ = state_rx
        .wait_for(|state| *state == ServiceState::Stopped)
        .await;
}
