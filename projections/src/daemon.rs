//! Running every registered shard side by side.
//!
//! Each shard keeps its own agent, detector, caches and update batches; the
//! daemon only owns their tasks. Shard names double as progression row
//! names, so two shards registered under one name would overwrite each
//! other's progress. [`ProjectionDaemon::add`] rejects that at setup.
//!
//! # Example
//!
//! ```ignore
//! let mut daemon = ProjectionDaemon::new();
//! daemon.add(ShardAgent::new("Order:All", runtime, collaborators.clone(), settings.clone()))?;
//! daemon.add(ShardAgent::subscription("Audit:All", audit, collaborators, settings))?;
//!
//! let running = daemon.start();
//! tokio::signal::ctrl_c().await.ok();
//! running.stop().await;
//! ```

use crate::agent::ShardAgent;
use foldline_core::BoxFuture;
use foldline_core::error::{ProjectionError, Result};
use foldline_core::event::Event;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct RegisteredShard {
    name: String,
    run: BoxFuture<'static, ()>,
    shutdown: watch::Sender<bool>,
}

/// Set of shards started and stopped together.
#[derive(Default)]
pub struct ProjectionDaemon {
    shards: Vec<RegisteredShard>,
}

impl ProjectionDaemon {
    /// Create a daemon with no shards.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent together with its shutdown sender, as returned by
    /// [`ShardAgent::new`] or [`ShardAgent::subscription`].
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Configuration`] if a shard with the same
    /// name is already registered.
    pub fn add<E: Event>(
        &mut self,
        (agent, shutdown): (ShardAgent<E>, watch::Sender<bool>),
    ) -> Result<()> {
        let name = agent.name().to_string();
        if self.shards.iter().any(|shard| shard.name == name) {
            return Err(ProjectionError::Configuration(format!(
                "shard name '{name}' is already registered"
            )));
        }

        self.shards.push(RegisteredShard {
            name,
            run: Box::pin(async move { agent.run().await }),
            shutdown,
        });
        Ok(())
    }

    /// Names of the registered shards, in registration order.
    #[must_use]
    pub fn shard_names(&self) -> Vec<&str> {
        self.shards.iter().map(|shard| shard.name.as_str()).collect()
    }

    /// Spawn one task per shard.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(self) -> RunningDaemon {
        let tasks = self
            .shards
            .into_iter()
            .map(|shard| {
                tracing::debug!(shard = %shard.name, "Spawning shard");
                RunningShard {
                    handle: tokio::spawn(shard.run),
                    name: shard.name,
                    shutdown: shard.shutdown,
                }
            })
            .collect::<Vec<_>>();

        tracing::info!(shards = tasks.len(), "Projection daemon started");
        RunningDaemon { tasks }
    }
}

struct RunningShard {
    name: String,
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Shards spawned by [`ProjectionDaemon::start`].
pub struct RunningDaemon {
    tasks: Vec<RunningShard>,
}

impl RunningDaemon {
    /// Names of the running shards.
    #[must_use]
    pub fn shard_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|task| task.name.as_str()).collect()
    }

    /// Signal every shard to stop and wait for their tasks.
    ///
    /// Passes in flight are cancelled; their batches never commit.
    pub async fn stop(self) {
        for task in &self.tasks {
            task.shutdown.send(true).ok();
        }

        for task in self.tasks {
            if let Err(e) = task.handle.await {
                tracing::error!(shard = %task.name, error = %e, "Shard task failed");
            }
        }

        tracing::info!("Projection daemon stopped");
    }
}
