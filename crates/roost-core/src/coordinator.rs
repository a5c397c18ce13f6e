// ABOUTME: The session coordinator - the one entry point front-ends talk to
// ABOUTME: Owns engine bindings per session and arbitrates ownership across processes

use crate::config::{Config, CoordinatorConfig};
use crate::engine::EngineProcess;
use crate::error::{Result, RoostError};
use crate::registry::{ExtensionInfo, ExtensionRegistry};
use crate::relay::{StreamRelay, Subscription};
use crate::store::SessionStore;
use crate::types::{EngineState, Message, SendReceipt, Session, SessionSummary, SessionView};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A running engine plus the task keeping its lock alive.
struct Binding {
    engine: EngineProcess,
    heartbeat: JoinHandle<()>,
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<Binding>>>;

/// Top-level arbiter between front-ends, the store, engines and the relay.
///
/// Every call names its session explicitly. A session has at most one engine
/// binding in this process, and the lock record in the store extends that to
/// every process sharing the database file.
pub struct SessionCoordinator {
    store: SessionStore,
    registry: ExtensionRegistry,
    relay: Arc<StreamRelay>,
    config: CoordinatorConfig,
    owner_id: String,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SessionCoordinator {
    /// Open the configured store and build a coordinator around it
    pub async fn open(config: &Config) -> Result<Self> {
        let store = SessionStore::open(config.db_path()).await?;
        let registry = ExtensionRegistry::with_custom(store.clone(), &config.extensions.custom);
        let relay = Arc::new(StreamRelay::new(config.relay.buffer));
        Ok(Self::new(store, registry, relay, config.coordinator()))
    }

    pub fn new(
        store: SessionStore,
        registry: ExtensionRegistry,
        relay: Arc<StreamRelay>,
        config: CoordinatorConfig,
    ) -> Self {
        let owner_id = config.owner_id.clone().unwrap_or_else(default_owner_id);
        tracing::info!(owner = %owner_id, "Session coordinator ready");
        Self {
            store,
            registry,
            relay,
            config,
            owner_id,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Identity this coordinator writes into lock records
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn relay(&self) -> &Arc<StreamRelay> {
        &self.relay
    }

    /// Create a session with the configured defaults. No engine is started yet.
    pub async fn open_session(&self, title: Option<&str>) -> Result<Session> {
        let id = self
            .store
            .create(title.unwrap_or_default(), &self.config.defaults)
            .await?;
        self.store.require(&id).await
    }

    /// Send a user turn, binding an engine first if the session has none.
    ///
    /// Returns once the turn is accepted; the response streams through
    /// [`subscribe`](Self::subscribe).
    pub async fn send_message(&self, session_id: &str, text: &str) -> Result<SendReceipt> {
        let engine = self.ensure_binding(session_id).await?;
        match engine.send(text).await {
            // Exited between the liveness check and the send
            Err(RoostError::EngineStopped(_)) => {
                tracing::debug!(session_id = %session_id, "Engine gone, rebinding");
                self.ensure_binding(session_id).await?.send(text).await
            }
            result => result,
        }
    }

    /// Bind an engine to the session and return its history.
    pub async fn resume_session(&self, session_id: &str) -> Result<SessionView> {
        self.ensure_binding(session_id).await?;
        self.view(session_id).await
    }

    /// Stop the session's engine, release its lock, and end its subscriptions.
    ///
    /// Closing a session that is not bound (or does not exist) does nothing.
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        self.unbind(session_id).await?;
        self.relay.close_session(session_id);
        Ok(())
    }

    /// Cancel the response currently streaming, if any.
    ///
    /// The engine is stopped and the partial response is kept as interrupted.
    /// Observers stay subscribed; the next send starts a fresh engine.
    pub async fn stop_response(&self, session_id: &str) -> Result<()> {
        self.unbind(session_id).await
    }

    /// Move a caller's focus from one session to another.
    ///
    /// The previous session stays bound until it idles out or is closed.
    pub async fn switch_active_session(&self, from: Option<&str>, to: &str) -> Result<SessionView> {
        let view = self.view(to).await?;
        tracing::debug!(from = ?from, to = %to, "Switched active session");
        Ok(view)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        self.store.list().await
    }

    /// Replace the enabled extension set. A running engine picks it up on its next start.
    pub async fn configure_extensions<I, S>(&self, session_id: &str, names: I) -> Result<BTreeSet<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = self.registry.set_enabled(session_id, names).await?;
        if self.engine_state(session_id).await.is_some() {
            tracing::info!(session_id = %session_id, "Extension change applies when the engine restarts");
        }
        Ok(names)
    }

    pub fn available_extensions(&self) -> Vec<ExtensionInfo> {
        self.registry.available()
    }

    /// Observe a session's events. Works whether or not the session is bound.
    ///
    /// The first event reports a response still in flight in the store as
    /// `InFlight`, even when another process is the one streaming it.
    pub async fn subscribe(&self, session_id: &str) -> Result<Subscription> {
        // Registered before the store read, so a response that settles in
        // between still reaches this subscriber as events
        let mut subscription = self.relay.subscribe(session_id);
        if let Some(pending) = self.store.in_flight_message(session_id).await? {
            subscription.merge_stored_in_flight(pending.seq, pending.body);
        }
        Ok(subscription)
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<Message>> {
        self.store.require(session_id).await?;
        self.store.load(session_id).await?.to_vec().await
    }

    /// Close and permanently remove a session
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.close_session(session_id).await?;
        self.store.delete(session_id).await
    }

    /// Sessions with a live engine in this process
    pub async fn active_bindings(&self) -> Vec<String> {
        let slots: Vec<(String, Slot)> = self
            .slots()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut active = Vec::new();
        for (session_id, slot) in slots {
            let guard = slot.lock().await;
            if guard.as_ref().is_some_and(|b| b.engine.is_running()) {
                active.push(session_id);
            }
        }
        active.sort();
        active
    }

    /// State of the session's engine in this process, if one is running
    pub async fn engine_state(&self, session_id: &str) -> Option<EngineState> {
        let slot = self.slots().get(session_id).cloned()?;
        let guard = slot.lock().await;
        guard
            .as_ref()
            .filter(|b| b.engine.is_running())
            .map(|b| b.engine.state())
    }

    /// Stop every engine this process owns and release their locks
    pub async fn shutdown(&self) {
        let session_ids: Vec<String> = self.slots().keys().cloned().collect();
        for session_id in session_ids {
            if let Err(e) = self.unbind(&session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to release session on shutdown");
            }
        }
        tracing::info!(owner = %self.owner_id, "Session coordinator shut down");
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, session_id: &str) -> Slot {
        self.slots()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    async fn view(&self, session_id: &str) -> Result<SessionView> {
        let session = self.store.require(session_id).await?;
        self.store.touch(session_id).await?;
        let messages = self.store.load(session_id).await?.to_vec().await?;
        Ok(SessionView { session, messages })
    }

    /// The session's running engine, starting one if needed.
    ///
    /// The slot's async mutex serializes binding attempts in this process;
    /// the store lock serializes them across processes.
    async fn ensure_binding(&self, session_id: &str) -> Result<EngineProcess> {
        let slot = self.slot(session_id);
        let mut guard = slot.lock().await;

        if let Some(binding) = guard.as_ref() {
            if binding.engine.is_running() {
                return Ok(binding.engine.clone());
            }
        }
        if let Some(stale) = guard.take() {
            tracing::debug!(session_id = %session_id, "Replacing binding whose engine exited");
            self.release(session_id, stale).await?;
        }

        self.store
            .try_acquire_lock(session_id, &self.owner_id, self.config.lock_timeout)
            .await?;

        let engine = match self.start_engine(session_id).await {
            Ok(engine) => engine,
            Err(e) => {
                if let Err(release_err) = self.store.release_lock(session_id, &self.owner_id).await {
                    tracing::warn!(session_id = %session_id, error = %release_err, "Failed to release lock after failed start");
                }
                return Err(e);
            }
        };

        let heartbeat = tokio::spawn(heartbeat(
            self.store.clone(),
            engine.clone(),
            self.owner_id.clone(),
            self.config.heartbeat_interval,
            self.config.idle_timeout,
        ));
        *guard = Some(Binding {
            engine: engine.clone(),
            heartbeat,
        });

        tracing::info!(session_id = %session_id, owner = %self.owner_id, "Session bound");
        Ok(engine)
    }

    async fn start_engine(&self, session_id: &str) -> Result<EngineProcess> {
        // We own the session now, so anything still in flight belongs to a dead engine
        if let Some(seq) = self.store.interrupt_in_flight(session_id).await? {
            tracing::warn!(session_id = %session_id, seq, "Interrupted response left by a previous engine");
        }
        EngineProcess::start(
            session_id,
            self.store.clone(),
            &self.registry,
            self.relay.clone(),
            &self.config.engine,
        )
        .await
    }

    async fn unbind(&self, session_id: &str) -> Result<()> {
        let Some(slot) = self.slots().get(session_id).cloned() else {
            return Ok(());
        };
        let binding = slot.lock().await.take();
        match binding {
            Some(binding) => {
                self.release(session_id, binding).await?;
                tracing::info!(session_id = %session_id, "Session unbound");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn release(&self, session_id: &str, mut binding: Binding) -> Result<()> {
        // The heartbeat must be gone before the lock is, or it could touch a newer record
        binding.heartbeat.abort();
        let _ = (&mut binding.heartbeat).await;
        binding.engine.stop().await;
        self.store.release_lock(session_id, &self.owner_id).await?;
        Ok(())
    }
}

/// `hostname:pid:nonce`, unique per coordinator instance.
fn default_owner_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}:{}:{}", std::process::id(), &nonce[..8])
}

/// Keep the session's lock fresh while its engine lives.
///
/// Stops the engine if another process took the lock, and reaps it once it
/// has sat idle past `idle_timeout`.
async fn heartbeat(
    store: SessionStore,
    engine: EngineProcess,
    owner: String,
    interval: Duration,
    idle_timeout: Option<Duration>,
) {
    let session_id = engine.session_id().to_string();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        if !engine.is_running() {
            tracing::debug!(session_id = %session_id, "Engine exited, dropping lock");
            if let Err(e) = store.release_lock(&session_id, &owner).await {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to release engine lock");
            }
            return;
        }

        if let (Some(limit), Some(idle)) = (idle_timeout, engine.idle_for()) {
            if idle >= limit {
                tracing::info!(session_id = %session_id, idle_secs = idle.as_secs(), "Engine idle, releasing session");
                engine.stop().await;
                if let Err(e) = store.release_lock(&session_id, &owner).await {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to release engine lock");
                }
                return;
            }
        }

        match store.renew_lock(&session_id, &owner).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(session_id = %session_id, owner = %owner, "Lost engine lock, stopping engine");
                engine.stop().await;
                return;
            }
            Err(e) => tracing::warn!(session_id = %session_id, error = %e, "Failed to renew engine lock"),
        }
    }
}
