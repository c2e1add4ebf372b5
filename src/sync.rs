//! Synchronizer: high-level API over gateway, channel, and state
//!
//! Actions go out through the [`ActionGateway`]; their visible effects
//! mostly come back as events on the channel. Deliveries are queued and
//! applied by [`Synchronizer::drain`] or the long-running
//! [`Synchronizer::run`] loop.

use crate::channel::{ChannelManager, EventTransport, SubscribeReport};
use crate::config::SyncConfig;
use crate::context::{ConnectionState, Disposition, ObserverId, SyncContext, SyncSnapshot};
use crate::error::{ActionError, Result};
use crate::event::{Delivery, SyncEvent};
use crate::gateway::ActionGateway;
use crate::types::{ChatRequest, Message, ServerInfo, Session};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;

struct Inner {
    gateway: Arc<dyn ActionGateway>,
    channel: Mutex<ChannelManager>,
    deliveries: Mutex<mpsc::UnboundedReceiver<Delivery>>,
    ctx: RwLock<SyncContext>,
    config: SyncConfig,
    shutdown: watch::Sender<bool>,
}

/// Real-time conversation state synchronizer
///
/// Cloning is cheap; every clone drives the same state.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<Inner>,
}

impl Synchronizer {
    /// Create a synchronizer with the default configuration
    pub fn new(gateway: Arc<dyn ActionGateway>, transport: Arc<dyn EventTransport>) -> Self {
        Self::build(gateway, transport, SyncConfig::default())
    }

    /// Create a synchronizer with a validated configuration
    pub fn with_config(
        gateway: Arc<dyn ActionGateway>,
        transport: Arc<dyn EventTransport>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(gateway, transport, config))
    }

    fn build(
        gateway: Arc<dyn ActionGateway>,
        transport: Arc<dyn EventTransport>,
        config: SyncConfig,
    ) -> Self {
        let (sink, deliveries) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                gateway,
                channel: Mutex::new(ChannelManager::new(transport, sink)),
                deliveries: Mutex::new(deliveries),
                ctx: RwLock::new(SyncContext::new(&config)),
                config,
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    async fn ensure_active(&self) -> Result<()> {
        if self.inner.ctx.read().await.is_active() {
            Ok(())
        } else {
            Err(ActionError::Inactive)
        }
    }

    // ---- Server lifecycle ----

    /// Probe for an already-running backend and connect to it
    pub async fn init(&self) -> Result<ConnectionState> {
        self.ensure_active().await?;
        let status = self.inner.gateway.server_status().await?;

        if let Some(info) = status.filter(|i| i.is_running()) {
            tracing::info!(base_url = %info.base_url, "Found running backend");
            {
                let mut ctx = self.inner.ctx.write().await;
                if !ctx.is_active() {
                    return Err(ActionError::Inactive);
                }
                ctx.state.server_info = Some(info);
                ctx.state.server_error = None;
                ctx.state.connection = ConnectionState::Connecting;
                ctx.touch();
            }
            self.connect().await;
        }

        Ok(self.connection_state().await)
    }

    /// Start the backend and open the event channel
    ///
    /// On failure the error message is also kept as the server error.
    pub async fn start_server(&self) -> Result<ServerInfo> {
        {
            let mut ctx = self.inner.ctx.write().await;
            if !ctx.is_active() {
                return Err(ActionError::Inactive);
            }
            ctx.state.connection = ConnectionState::Connecting;
            ctx.state.server_error = None;
            ctx.touch();
        }

        match self.inner.gateway.start_server().await {
            Ok(info) => {
                {
                    let mut ctx = self.inner.ctx.write().await;
                    if !ctx.is_active() {
                        return Ok(info);
                    }
                    ctx.state.server_info = Some(info.clone());
                    ctx.touch();
                }
                tracing::info!(base_url = %info.base_url, "Backend started");
                self.connect().await;
                Ok(info)
            }
            Err(e) => {
                let reason = match e {
                    ActionError::StartFailed(reason) => reason,
                    other => other.to_string(),
                };
                tracing::error!(error = %reason, "Backend failed to start");

                let mut ctx = self.inner.ctx.write().await;
                if ctx.is_active() {
                    ctx.state.server_info = None;
                    ctx.state.server_error = Some(reason.clone());
                    ctx.state.connection = ConnectionState::Disconnected;
                    ctx.touch();
                }
                Err(ActionError::StartFailed(reason))
            }
        }
    }

    /// Open the event channel and subscribe the global topics
    ///
    /// Subscription failures are logged and reported, never raised.
    pub async fn connect(&self) -> SubscribeReport {
        let mut channel = self.inner.channel.lock().await;
        let mut report = channel.connect().await;

        // A reconnect resumes the current session's scoped topics
        let current = self.inner.ctx.read().await.state.current_session.clone();
        let refocus = current
            .filter(|id| channel.is_connected() && channel.focused() != Some(id.as_str()));
        if let Some(id) = refocus {
            let focus = channel.focus_session(&id).await;
            report.subscribed.extend(focus.subscribed);
            report.failed.extend(focus.failed);
        }

        let mut ctx = self.inner.ctx.write().await;
        Self::record_focus(&mut ctx, &channel);
        report
    }

    /// Tear down every subscription and stop the backend
    ///
    /// Idempotent: stopping a stopped synchronizer does nothing.
    pub async fn stop_server(&self) -> Result<()> {
        self.ensure_active().await?;
        self.release_channel().await;

        let had_server = self.inner.ctx.read().await.state.server_info.is_some();
        if !had_server {
            return Ok(());
        }

        self.inner.gateway.stop_server().await?;

        let mut ctx = self.inner.ctx.write().await;
        if ctx.is_active() {
            ctx.state.server_info = None;
            ctx.clear_loading();
            ctx.touch();
        }
        tracing::info!("Backend stopped");
        Ok(())
    }

    async fn release_channel(&self) {
        let mut channel = self.inner.channel.lock().await;
        channel.disconnect().await;

        let mut ctx = self.inner.ctx.write().await;
        if ctx.is_active() && ctx.state.connection != ConnectionState::Disconnected {
            ctx.state.connection = ConnectionState::Disconnected;
            Self::record_focus(&mut ctx, &channel);
            ctx.touch();
        }
    }

    // ---- Sessions ----

    /// Create a session; it becomes visible locally right away
    pub async fn create_session(&self) -> Result<Session> {
        self.ensure_active().await?;
        let session = self.inner.gateway.create_session().await?;

        let mut ctx = self.inner.ctx.write().await;
        if ctx.is_active() {
            ctx.state.sessions.upsert(session.clone());
            ctx.touch();
        }
        tracing::debug!(session = %session.id, "Session created");
        Ok(session)
    }

    /// Fetch every session from the backend and merge it into the store
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.ensure_active().await?;
        let sessions = self.inner.gateway.list_sessions().await?;

        let mut ctx = self.inner.ctx.write().await;
        if ctx.is_active() {
            for session in &sessions {
                ctx.state.sessions.upsert(session.clone());
            }
            ctx.touch();
        }
        Ok(sessions)
    }

    /// Make `session_id` the current session
    ///
    /// Moves the scoped subscriptions to the session, replaces its local
    /// history with the backend's, and replays any buffered background
    /// events. A newer call supersedes an older one still in flight.
    pub async fn load_session(&self, session_id: &str) -> Result<Session> {
        let (generation, known) = {
            let mut ctx = self.inner.ctx.write().await;
            if !ctx.is_active() {
                return Err(ActionError::Inactive);
            }
            ctx.state.focus_generation += 1;
            (
                ctx.state.focus_generation,
                ctx.state.sessions.get(&session_id.to_string()).cloned(),
            )
        };

        let session = match known {
            Some(session) => session,
            None => {
                let sessions = self.inner.gateway.list_sessions().await?;
                let found = sessions.iter().find(|s| s.id == session_id).cloned();
                let mut ctx = self.inner.ctx.write().await;
                if ctx.is_active() {
                    for s in sessions {
                        ctx.state.sessions.upsert(s);
                    }
                    ctx.touch();
                }
                found.ok_or_else(|| ActionError::SessionNotFound(session_id.to_string()))?
            }
        };

        {
            let mut channel = self.inner.channel.lock().await;
            self.check_current(&*self.inner.ctx.read().await, generation, session_id)?;
            channel.focus_session(session_id).await;

            let mut ctx = self.inner.ctx.write().await;
            Self::record_focus(&mut ctx, &channel);
            self.check_current(&ctx, generation, session_id)?;
        }

        let history = match self.inner.gateway.session_messages(session_id).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "Failed to load session history");
                self.restore_focus(generation).await;
                return Err(e);
            }
        };

        let mut ctx = self.inner.ctx.write().await;
        self.check_current(&ctx, generation, session_id)?;
        let count = history.len();
        ctx.install_history(session, history);
        tracing::info!(session = %session_id, messages = count, "Session loaded");
        ctx.current_session()
            .ok_or_else(|| ActionError::SessionNotFound(session_id.to_string()))
    }

    fn check_current(&self, ctx: &SyncContext, generation: u64, session_id: &str) -> Result<()> {
        if !ctx.is_active() {
            return Err(ActionError::Inactive);
        }
        if ctx.state.focus_generation != generation {
            tracing::debug!(session = %session_id, "Session load superseded");
            return Err(ActionError::Superseded(session_id.to_string()));
        }
        Ok(())
    }

    /// Mirror the channel's subscriptions into the context
    ///
    /// Callers hold the channel lock, so focus only moves through here.
    fn record_focus(ctx: &mut SyncContext, channel: &ChannelManager) {
        if !ctx.is_active() {
            return;
        }
        let focus = channel.focused().map(str::to_string);
        let connection = match &ctx.state.connection {
            _ if channel.is_connected() => ConnectionState::Connected {
                focus: focus.clone(),
            },
            ConnectionState::Connected { .. } => ConnectionState::Disconnected,
            other => other.clone(),
        };
        ctx.state.global_kinds = channel.global_kinds();
        if ctx.state.focus != focus || ctx.state.connection != connection {
            ctx.state.focus = focus;
            ctx.state.connection = connection;
            ctx.touch();
        }
    }

    /// Point the channel back at the current session after a failed load
    async fn restore_focus(&self, generation: u64) {
        let mut channel = self.inner.channel.lock().await;
        let current = {
            let ctx = self.inner.ctx.read().await;
            if !ctx.is_active() || ctx.state.focus_generation != generation {
                return;
            }
            ctx.state.current_session.clone()
        };
        match current.as_deref() {
            Some(id) => {
                channel.focus_session(id).await;
            }
            None => channel.unfocus(),
        }
        let mut ctx = self.inner.ctx.write().await;
        Self::record_focus(&mut ctx, &channel);
    }

    // ---- Messaging ----

    /// Send a text message to the current session
    ///
    /// Sets the loading flag before the request goes out. The flag is
    /// cleared by a `session-idle`/`session-error` event, an abort, or a
    /// failed send; with a send timeout configured, also when it expires.
    pub async fn send_message(&self, text: &str, model_id: &str, provider_id: &str) -> Result<()> {
        self.send_request(ChatRequest::text(text, model_id, provider_id))
            .await
    }

    /// Send a prepared request to the current session
    pub async fn send_request(&self, request: ChatRequest) -> Result<()> {
        let (session_id, generation) = {
            let mut ctx = self.inner.ctx.write().await;
            if !ctx.is_active() {
                return Err(ActionError::Inactive);
            }
            let session_id = ctx
                .state
                .current_session
                .clone()
                .ok_or(ActionError::NoSession)?;
            let generation = ctx.begin_send(&session_id);
            (session_id, generation)
        };

        if let Err(e) = self.inner.gateway.send_message(&session_id, &request).await {
            tracing::warn!(session = %session_id, error = %e, "Send failed");
            let mut ctx = self.inner.ctx.write().await;
            if ctx.is_active() && ctx.expire_send(generation) {
                ctx.touch();
            }
            return Err(e);
        }

        tracing::debug!(session = %session_id, parts = request.parts.len(), "Message sent");
        if let Some(timeout) = self.inner.config.send_timeout() {
            self.spawn_send_watchdog(session_id, generation, timeout);
        }
        Ok(())
    }

    fn spawn_send_watchdog(&self, session_id: String, generation: u64, timeout: std::time::Duration) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut ctx = inner.ctx.write().await;
            if ctx.is_active() && ctx.expire_send(generation) {
                tracing::warn!(
                    session = %session_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "No idle event after send; clearing loading flag"
                );
                ctx.touch();
            }
        });
    }

    /// Ask the backend to stop work on a session (default: current)
    pub async fn abort_session(&self, session_id: Option<&str>) -> Result<bool> {
        let session_id = {
            let ctx = self.inner.ctx.read().await;
            if !ctx.is_active() {
                return Err(ActionError::Inactive);
            }
            match session_id {
                Some(id) => id.to_string(),
                None => ctx.state.current_session.clone().ok_or(ActionError::NoSession)?,
            }
        };

        let acknowledged = self.inner.gateway.abort_session(&session_id).await?;

        let mut ctx = self.inner.ctx.write().await;
        if ctx.is_active() && ctx.settle_send(&session_id) {
            ctx.touch();
        }
        tracing::info!(session = %session_id, acknowledged, "Session aborted");
        Ok(acknowledged)
    }

    // ---- Event processing ----

    /// Apply every queued delivery; returns how many were processed
    pub async fn drain(&self) -> usize {
        let mut deliveries = self.inner.deliveries.lock().await;
        let mut processed = 0;
        while let Ok(delivery) = deliveries.try_recv() {
            self.deliver(delivery).await;
            processed += 1;
        }
        processed
    }

    /// Apply deliveries as they arrive until [`shutdown`](Self::shutdown)
    pub async fn run(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut deliveries = self.inner.deliveries.lock().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => {
                        self.deliver(delivery).await;
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("Delivery loop stopped");
    }

    async fn deliver(&self, delivery: Delivery) -> Disposition {
        let (disposition, observers) = {
            let mut ctx = self.inner.ctx.write().await;
            let disposition = ctx.dispatch(&delivery);
            let observers = if disposition.should_notify() {
                ctx.observers()
            } else {
                Vec::new()
            };
            (disposition, observers)
        };

        tracing::trace!(topic = %delivery.topic, ?disposition, "Delivery processed");
        for observer in observers {
            observer(&delivery.event);
        }
        disposition
    }

    /// Stop applying events and release every subscription
    ///
    /// After this returns no event reaches state or observers, and
    /// in-flight actions settle without mutating anything.
    pub async fn shutdown(&self) {
        {
            let mut ctx = self.inner.ctx.write().await;
            if !ctx.is_active() {
                return;
            }
            ctx.deactivate();
        }
        self.inner.shutdown.send_replace(true);
        self.inner.channel.lock().await.disconnect().await;
        tracing::info!("Synchronizer shut down");
    }

    pub async fn is_active(&self) -> bool {
        self.inner.ctx.read().await.is_active()
    }

    // ---- Observers ----

    /// Register a callback for every accepted event
    pub async fn on_event<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.inner.ctx.write().await.add_observer(Arc::new(observer))
    }

    pub async fn remove_observer(&self, id: ObserverId) -> bool {
        self.inner.ctx.write().await.remove_observer(id)
    }

    /// Stream of every accepted event; ends when the synchronizer shuts down
    pub async fn events(&self) -> UnboundedReceiverStream<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_event(move |event| {
            let _ = tx.send(event.clone());
        })
        .await;
        UnboundedReceiverStream::new(rx)
    }

    // ---- Accessors ----

    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.inner.ctx.read().await.state.server_info.clone()
    }

    pub async fn server_error(&self) -> Option<String> {
        self.inner.ctx.read().await.state.server_error.clone()
    }

    pub async fn current_session(&self) -> Option<Session> {
        self.inner.ctx.read().await.current_session()
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.inner.ctx.read().await.state.sessions.iter().cloned().collect()
    }

    /// Messages of the current session
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.ctx.read().await.current_messages()
    }

    pub async fn is_loading(&self) -> bool {
        self.inner.ctx.read().await.state.loading
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.ctx.read().await.state.connection.clone()
    }

    /// Counter bumped on every state change
    pub async fn revision(&self) -> u64 {
        self.inner.ctx.read().await.revision()
    }

    pub async fn snapshot(&self) -> SyncSnapshot {
        self.inner.ctx.read().await.snapshot()
    }

    pub fn gateway_name(&self) -> &str {
        self.inner.gateway.name()
    }
}
