//! Actor-based lifecycle API
//!
//! The orchestrator is owned by a single tokio task. Callers talk to it through an
//! [`AcquisitionHandle`], which sends [`ScopeCommand`]s over an mpsc channel and awaits
//! the oneshot reply. Between commands the task ticks the state machine on a
//! `tokio::time::interval`, so a slow caller can never stall a run and no lock is ever
//! held around the hardware.

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::core::Trajectory;
use crate::error::{AppResult, ScopeError};
use crate::events::AcquisitionEvent;
use crate::orchestrator::{MicroscopyOrchestrator, RunStatus};

/// Command queue depth.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Commands that can be sent to the [`AcquisitionActor`]
#[derive(Debug)]
pub enum ScopeCommand {
    /// Start a run over `trajectory`
    StartRun {
        /// Points to visit, in order
        trajectory: Trajectory,
        /// Settings for this run
        config: Box<RunConfig>,
        /// Run id, or why the run was refused
        response: oneshot::Sender<AppResult<Uuid>>,
    },

    /// Stop the current run (idempotent)
    StopRun {
        /// Signalled once the run is stopped
        response: oneshot::Sender<()>,
    },

    /// Get the current status snapshot
    RunStatus {
        /// Status at the time the command was handled
        response: oneshot::Sender<RunStatus>,
    },

    /// Subscribe to acquisition events
    Subscribe {
        /// New event receiver
        response: oneshot::Sender<broadcast::Receiver<AcquisitionEvent>>,
    },

    /// Stop any run, wait for the focus rig and exit the actor loop
    Shutdown {
        /// Signalled just before the actor exits
        response: oneshot::Sender<()>,
    },
}

impl ScopeCommand {
    /// Helper to create a StartRun command
    pub fn start_run(
        trajectory: Trajectory,
        config: RunConfig,
    ) -> (Self, oneshot::Receiver<AppResult<Uuid>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::StartRun {
                trajectory,
                config: Box::new(config),
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a StopRun command
    pub fn stop_run() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::StopRun { response: tx }, rx)
    }

    /// Helper to create a RunStatus command
    pub fn run_status() -> (Self, oneshot::Receiver<RunStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::RunStatus { response: tx }, rx)
    }

    /// Helper to create a Subscribe command
    pub fn subscribe() -> (Self, oneshot::Receiver<broadcast::Receiver<AcquisitionEvent>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Subscribe { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// Actor that owns the orchestrator and drives its ticks
pub struct AcquisitionActor {
    orchestrator: MicroscopyOrchestrator,
    tick_interval: Duration,
}

impl AcquisitionActor {
    /// Creates a new actor. `tick_interval` applies until a run supplies its own.
    pub fn new(orchestrator: MicroscopyOrchestrator, tick_interval: Duration) -> Self {
        Self {
            orchestrator,
            tick_interval,
        }
    }

    /// Spawns the actor on the current runtime and returns a handle to it
    pub fn spawn(self) -> (AcquisitionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let task = tokio::spawn(self.run(rx));
        (AcquisitionHandle { tx }, task)
    }

    /// Runs the actor event loop, processing commands and ticks until shutdown
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<ScopeCommand>) {
        info!("AcquisitionActor started");
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        info!("All acquisition handles dropped");
                        self.orchestrator.shutdown().await;
                        break;
                    };
                    match command {
                        ScopeCommand::StartRun { trajectory, config, response } => {
                            let period = Duration::from_millis(config.tick_interval_ms);
                            let result = self.orchestrator.start(trajectory, *config).await;
                            if result.is_ok() && period != self.tick_interval {
                                debug!(?period, "Tick interval changed");
                                self.tick_interval = period;
                                ticker = interval(period);
                                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            }
                            let _ = response.send(result);
                        }

                        ScopeCommand::StopRun { response } => {
                            self.orchestrator.stop().await;
                            let _ = response.send(());
                        }

                        ScopeCommand::RunStatus { response } => {
                            let _ = response.send(self.orchestrator.status());
                        }

                        ScopeCommand::Subscribe { response } => {
                            let _ = response.send(self.orchestrator.subscribe());
                        }

                        ScopeCommand::Shutdown { response } => {
                            info!("Shutdown command received");
                            self.orchestrator.shutdown().await;
                            let _ = response.send(());
                            break; // Exit event loop
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.orchestrator.tick().await;
                }
            }
        }

        info!("AcquisitionActor shutting down");
    }
}

/// Cloneable client for a running [`AcquisitionActor`].
#[derive(Debug, Clone)]
pub struct AcquisitionHandle {
    tx: mpsc::Sender<ScopeCommand>,
}

impl AcquisitionHandle {
    async fn request<T>(&self, command: ScopeCommand, rx: oneshot::Receiver<T>) -> AppResult<T> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ScopeError::ActorGone)?;
        rx.await.map_err(|_| ScopeError::ActorGone)
    }

    /// Start a run; configuration and collaborator errors come back synchronously.
    pub async fn start_run(&self, trajectory: Trajectory, config: RunConfig) -> AppResult<Uuid> {
        let (cmd, rx) = ScopeCommand::start_run(trajectory, config);
        self.request(cmd, rx).await?
    }

    /// Stop the current run. Calling it again is a no-op.
    pub async fn stop_run(&self) -> AppResult<()> {
        let (cmd, rx) = ScopeCommand::stop_run();
        self.request(cmd, rx).await
    }

    /// Current state, index, total and counters.
    pub async fn run_status(&self) -> AppResult<RunStatus> {
        let (cmd, rx) = ScopeCommand::run_status();
        self.request(cmd, rx).await
    }

    /// Receive acquisition events from now on.
    pub async fn subscribe(&self) -> AppResult<broadcast::Receiver<AcquisitionEvent>> {
        let (cmd, rx) = ScopeCommand::subscribe();
        self.request(cmd, rx).await
    }

    /// Stop the actor.
    pub async fn shutdown(&self) -> AppResult<()> {
        let (cmd, rx) = ScopeCommand::shutdown();
        self.request(cmd, rx).await
    }

    /// Poll `run_status` every `poll` until the run has finished.
    pub async fn wait_until_finished(&self, poll: Duration) -> AppResult<RunStatus> {
        loop {
            let status = self.run_status().await?;
            if status.finished {
                return Ok(status);
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::ScopeHardware;

    #[tokio::test]
    async fn handle_reports_actor_gone_after_shutdown() {
        let actor = AcquisitionActor::new(
            MicroscopyOrchestrator::new(ScopeHardware::new()),
            Duration::from_millis(10),
        );
        let (handle, task) = actor.spawn();

        let status = handle.run_status().await.unwrap();
        assert!(!status.finished);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(
            handle.run_status().await,
            Err(ScopeError::ActorGone)
        ));
    }

    #[tokio::test]
    async fn start_errors_are_returned_to_the_caller() {
        let actor = AcquisitionActor::new(
            MicroscopyOrchestrator::new(ScopeHardware::new()),
            Duration::from_millis(10),
        );
        let (handle, _task) = actor.spawn();
        let trajectory = Trajectory::from_xy(&[(0.0, 0.0)]).unwrap();
        assert!(matches!(
            handle.start_run(trajectory, RunConfig::default()).await,
            Err(ScopeError::MissingCollaborator(_))
        ));
    }
}
