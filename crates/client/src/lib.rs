//! The agentmill client: a durable, database-backed orchestrator for agent
//! runs.
//!
//! A [`Client`] ties together the store, the worker pools, instance
//! registration, leader election, and the rescue sweep. Any number of
//! clients may share one database; together they form a work-stealing
//! scheduler for runs and tool calls with at-most-once execution per
//! claimed attempt.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use mill_client::{Client, Config};
//! # use mill_domain::agent::AgentDefinition;
//! # use mill_store::PgStore;
//! # async fn demo(model: Arc<dyn mill_domain::model::ModelClient>) -> mill_domain::Result<()> {
//! let store = Arc::new(PgStore::connect("postgres://localhost/agents").await?);
//! store.run_migrations().await?;
//!
//! let client = Client::builder(store, model).build();
//! client.start().await?;
//!
//! client.create_agent(AgentDefinition::new("echo", "some-model")).await?;
//! let reply = client.run_fast_sync("echo", "hello").await?;
//! println!("{}", reply.text());
//!
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod assemble;
pub mod compact;
pub mod config;
pub mod hub;
pub mod registry;
pub mod testing;

mod instance;
mod leader;
mod rescue;
mod worker;

pub use compact::{CompactionOutcome, CompactionStrategy};
pub use config::Config;
pub use registry::ToolRegistry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use mill_domain::agent::{Agent, AgentDefinition};
use mill_domain::instance::Instance;
use mill_domain::message::{Message, Role};
use mill_domain::model::ModelClient;
use mill_domain::run::{Iteration, NewRun, Run, RunStatus};
use mill_domain::session::{NewSession, Session};
use mill_domain::tool::ToolHandler;
use mill_domain::{Error, Result};
use mill_store::{NotifyKind, RunFilter, Store};

use crate::hub::Subscription;
use crate::worker::WorkerCtx;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ClientBuilder<S: Store> {
    store: Arc<S>,
    model: Arc<dyn ModelClient>,
    config: Config,
    registry: ToolRegistry,
}

impl<S: Store> ClientBuilder<S> {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Register a tool. Must happen before `build`; the registry is
    /// immutable once the client exists.
    pub fn register_tool(mut self, handler: Arc<dyn ToolHandler>) -> Result<Self> {
        self.registry.register(handler)?;
        Ok(self)
    }

    pub fn build(self) -> Client<S> {
        let config = self.config.normalized();
        let instance_id = config.id.unwrap_or_else(Uuid::new_v4);
        let instance_name = config
            .name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "agentmill".into());
        let (shutdown_tx, _) = watch::channel(false);

        Client {
            inner: Arc::new(ClientInner {
                store: self.store,
                model: self.model,
                registry: Arc::new(self.registry),
                instance: Instance {
                    id: instance_id,
                    name: instance_name,
                    metadata: config.metadata.clone(),
                    started_at: Utc::now(),
                    last_heartbeat_at: Utc::now(),
                },
                config,
                is_leader: Arc::new(AtomicBool::new(false)),
                started: AtomicBool::new(false),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ClientInner<S: Store> {
    store: Arc<S>,
    model: Arc<dyn ModelClient>,
    registry: Arc<ToolRegistry>,
    config: Config,
    instance: Instance,
    is_leader: Arc<AtomicBool>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The client facade. Cheap to clone; all clones share one instance.
pub struct Client<S: Store> {
    inner: Arc<ClientInner<S>>,
}

impl<S: Store> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Store> Client<S> {
    pub fn builder(store: Arc<S>, model: Arc<dyn ModelClient>) -> ClientBuilder<S> {
        ClientBuilder {
            store,
            model,
            config: Config::default(),
            registry: ToolRegistry::new(),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.instance.id
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader.load(Ordering::Acquire)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Register the instance, advertise the tool specs, and spawn the
    /// background loops and worker pools.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::Conflict("client already started".into()));
        }
        let inner = &self.inner;

        for spec in inner.registry.specs() {
            inner.store.upsert_tool(&spec).await?;
        }
        inner.store.register_instance(&inner.instance).await?;
        tracing::info!(
            instance_id = %inner.instance.id,
            name = %inner.instance.name,
            run_workers = inner.config.max_concurrent_runs,
            tool_workers = inner.config.max_concurrent_tools,
            "client started"
        );

        let ctx = Arc::new(WorkerCtx {
            store: inner.store.clone(),
            model: inner.model.clone(),
            registry: inner.registry.clone(),
            config: inner.config.clone(),
            instance_id: inner.instance.id,
        });

        let mut tasks = inner.tasks.lock();
        let shutdown = self.inner.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(instance::heartbeat_loop(
            inner.store.clone(),
            inner.instance.clone(),
            inner.config.clone(),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(leader::election_loop(
            inner.store.clone(),
            inner.instance.id,
            inner.config.clone(),
            inner.is_leader.clone(),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(rescue::sweep_loop(
            inner.store.clone(),
            inner.config.clone(),
            inner.is_leader.clone(),
            shutdown.clone(),
        )));
        for _ in 0..inner.config.max_concurrent_runs {
            tasks.push(tokio::spawn(worker::run_worker::run_worker_loop(
                ctx.clone(),
                shutdown.clone(),
            )));
        }
        for _ in 0..inner.config.max_concurrent_tools {
            tasks.push(tokio::spawn(worker::tool_worker::tool_worker_loop(
                ctx.clone(),
                shutdown.clone(),
            )));
        }
        Ok(())
    }

    /// Signal every loop to finish, then deregister the instance. In-flight
    /// runs are requeued by their workers on the way out.
    pub async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let abort = task.abort_handle();
            match tokio::time::timeout(Duration::from_secs(10), task).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("background task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        if let Err(e) = self.inner.store.remove_instance(self.inner.instance.id).await {
            tracing::warn!(error = %e, "instance deregistration failed");
        }
        tracing::info!(instance_id = %self.inner.instance.id, "client stopped");
    }

    // ── Registry ───────────────────────────────────────────────────

    pub async fn create_agent(&self, def: AgentDefinition) -> Result<Agent> {
        self.inner.store.upsert_agent(def).await
    }

    pub async fn get_or_create_agent(&self, def: AgentDefinition) -> Result<Agent> {
        self.inner.store.get_or_create_agent(def).await
    }

    pub async fn get_agent(&self, name: &str) -> Result<Agent> {
        self.inner.store.get_agent_by_name(name).await
    }

    // ── Sessions & runs ────────────────────────────────────────────

    pub async fn create_session(&self, new: NewSession) -> Result<Session> {
        self.inner.store.create_session(new).await
    }

    /// Enqueue a run on an existing session and return immediately.
    pub async fn create_run(
        &self,
        session_id: Uuid,
        agent_name: &str,
        prompt: impl Into<String>,
    ) -> Result<Run> {
        let agent = self.inner.store.get_agent_by_name(agent_name).await?;
        self.inner
            .store
            .create_run(NewRun::new(session_id, agent.id, prompt))
            .await
    }

    /// Enqueue a run and block until it terminates. Dropping this future
    /// detaches the waiter only; the run keeps executing.
    pub async fn run_sync(
        &self,
        session_id: Uuid,
        agent_name: &str,
        prompt: impl Into<String>,
    ) -> Result<Message> {
        let run = self.create_run(session_id, agent_name, prompt).await?;
        self.wait_for_result(run.id).await
    }

    /// Enqueue a run on a fresh throwaway session and return immediately.
    pub async fn run_fast(&self, agent_name: &str, prompt: impl Into<String>) -> Result<Run> {
        let session = self
            .create_session(NewSession {
                tenant_id: "default".into(),
                identifier: format!("fast:{}", Uuid::new_v4()),
                parent_session_id: None,
                metadata: serde_json::Value::Null,
            })
            .await?;
        self.create_run(session.id, agent_name, prompt).await
    }

    /// Enqueue a run on a fresh throwaway session and block until done.
    pub async fn run_fast_sync(
        &self,
        agent_name: &str,
        prompt: impl Into<String>,
    ) -> Result<Message> {
        let run = self.run_fast(agent_name, prompt).await?;
        self.wait_for_result(run.id).await
    }

    /// Mark a run cancelled, cascading to its non-terminal descendants.
    /// The owning worker aborts on its next status read or heartbeat.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        let mut pending = vec![run_id];
        while let Some(id) = pending.pop() {
            self.inner.store.cancel_run(id).await?;
            for child in self.inner.store.list_child_runs(id).await? {
                if !child.status.is_terminal() {
                    pending.push(child.id);
                }
            }
        }
        Ok(())
    }

    /// Block until the run is terminal, waking on notifications with a
    /// poll floor.
    pub async fn wait_for_run(&self, run_id: Uuid) -> Result<Run> {
        let mut sub = Subscription::new(
            self.inner.store.subscribe(),
            NotifyKind::RunCompleted,
            Some(run_id),
            self.inner.config.poll_fallback_interval,
        );
        loop {
            let run = self.inner.store.get_run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            sub.wait().await;
        }
    }

    async fn wait_for_result(&self, run_id: Uuid) -> Result<Message> {
        let run = self.wait_for_run(run_id).await?;
        match run.status {
            RunStatus::Completed => {
                let messages = self
                    .inner
                    .store
                    .list_messages(run.session_id, false)
                    .await?;
                messages
                    .into_iter()
                    .rev()
                    .find(|m| m.role == Role::Assistant)
                    .ok_or_else(|| {
                        Error::InvariantViolation(format!(
                            "completed run {run_id} has no assistant message"
                        ))
                    })
            }
            RunStatus::Cancelled => Err(Error::Cancelled),
            RunStatus::Failed => {
                let error = run.error.unwrap_or_else(|| {
                    mill_domain::run::RunError::new(
                        mill_domain::ErrorKind::Permanent,
                        "run failed without a recorded error",
                    )
                });
                Err(Error::RunFailed {
                    kind: error.kind,
                    message: error.message,
                })
            }
            _ => unreachable!("wait_for_run returned a non-terminal run"),
        }
    }

    // ── Query accessors ────────────────────────────────────────────

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        self.inner.store.get_run(run_id).await
    }

    pub async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>> {
        self.inner.store.list_runs(filter).await
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<Session> {
        self.inner.store.get_session(session_id).await
    }

    pub async fn list_messages(
        &self,
        session_id: Uuid,
        include_archived: bool,
    ) -> Result<Vec<Message>> {
        self.inner.store.list_messages(session_id, include_archived).await
    }

    pub async fn list_iterations(&self, run_id: Uuid) -> Result<Vec<Iteration>> {
        self.inner.store.list_iterations(run_id).await
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        self.inner.store.list_instances().await
    }
}
