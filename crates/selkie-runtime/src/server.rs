//! Top-level server lifecycle.
//!
//! TigerStyle: Single entry point, explicit configuration, clean shutdown.
//!
//! Spawns the worker pool, bootstraps the statically configured services
//! in two phases (construct everything, then start everything, so unique
//! names are resolvable from `start`), and runs until stopped by signal or
//! by a service calling abort.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use selkie_core::error::{Error, Result};
use selkie_core::{NodeConfig, ServiceConfig};

use crate::router::Router;
use crate::service::{BehaviorFactory, ServiceBehavior};
use crate::worker::{spawn_worker, WorkerHandle};

/// Builder wiring behaviors to a node configuration
pub struct ServerBuilder {
    node: NodeConfig,
    behaviors: HashMap<String, BehaviorFactory>,
}

impl ServerBuilder {
    pub fn new(node: NodeConfig) -> Self {
        Self {
            node,
            behaviors: HashMap::new(),
        }
    }

    /// Register a behavior factory under the name service configs use in
    /// their `file` key
    pub fn behavior<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ServiceConfig) -> Result<Box<dyn ServiceBehavior>> + Send + Sync + 'static,
    {
        self.behaviors.insert(name.into(), Arc::new(factory));
        self
    }

    /// Spawn the worker pool. Services are not created yet; call
    /// `Server::bootstrap` next.
    pub fn build(self) -> Result<Server> {
        self.node.validate()?;
        let worker_count = self.node.worker_count();

        let mut handles = Vec::with_capacity(worker_count);
        let mut channels = Vec::with_capacity(worker_count);
        for id in 1..=worker_count as u8 {
            let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
            let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
            handles.push(WorkerHandle {
                id,
                mailbox_tx: mailbox_tx.clone(),
                ctrl_tx: ctrl_tx.clone(),
            });
            channels.push((id, mailbox_tx, mailbox_rx, ctrl_tx, ctrl_rx));
        }

        let router = Arc::new(Router::new(handles, self.behaviors));
        let joins = channels
            .into_iter()
            .map(|(id, mailbox_tx, mailbox_rx, ctrl_tx, ctrl_rx)| {
                spawn_worker(id, router.clone(), mailbox_tx, mailbox_rx, ctrl_tx, ctrl_rx)
            })
            .collect();

        info!(node = %self.node.name, workers = worker_count, "server built");
        Ok(Server {
            router,
            node: self.node,
            joins,
        })
    }
}

/// A running selkie node
pub struct Server {
    router: Arc<Router>,
    node: NodeConfig,
    joins: Vec<std::thread::JoinHandle<()>>,
}

impl Server {
    pub fn builder(node: NodeConfig) -> ServerBuilder {
        ServerBuilder::new(node)
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn node(&self) -> &NodeConfig {
        &self.node
    }

    /// Create the configured services (phase 1), then start them all
    /// (phase 2). A creation failure — including a unique-name collision
    /// on a required service — stops the server and errors out.
    pub async fn bootstrap(&self) -> Result<()> {
        for cfg in &self.node.services {
            let rx = self.router.create_service(cfg.clone(), 0, false)?;
            match rx.await {
                Ok(Ok(id)) => debug!(service = %cfg.name, id = format_args!("{id:08X}"), "bootstrapped"),
                Ok(Err(e)) => {
                    self.router.stop();
                    return Err(e);
                }
                Err(_) => {
                    self.router.stop();
                    return Err(Error::internal("bootstrap reply dropped"));
                }
            }
        }

        for rx in self.router.start_all() {
            let _ = rx.await;
        }
        self.router.set_running();
        Ok(())
    }

    /// Request a graceful stop
    pub fn stop(&self) {
        self.router.stop();
    }

    /// Wait until every worker thread has drained and exited
    pub async fn join(mut self) -> Result<()> {
        let joins = std::mem::take(&mut self.joins);
        let router = self.router.clone();
        tokio::task::spawn_blocking(move || {
            for join in joins {
                let _ = join.join();
            }
        })
        .await
        .map_err(|e| Error::internal(format!("worker join failed: {e}")))?;
        router.set_stopped();
        info!("server stopped");
        Ok(())
    }

    /// Run until interrupted or stopped from within, then join
    pub async fn run(mut self) -> Result<()> {
        let joins = std::mem::take(&mut self.joins);
        let router = self.router.clone();
        let mut waiter = tokio::task::spawn_blocking(move || {
            for join in joins {
                let _ = join.join();
            }
        });

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; stopping");
                router.stop();
                let _ = (&mut waiter).await;
            }
            result = &mut waiter => {
                let _ = result;
            }
        }
        router.set_stopped();
        info!("server stopped");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // A dropped server must not leave worker threads spinning
        if !self.joins.is_empty() {
            self.router.stop();
        }
    }
}
