//! The hub wires admission, connections, rooms, presence and delivery
//! together and runs sessions.

use crate::broker::{Broker, InMemoryBroker};
use crate::config::HubConfig;
use crate::connection::{generate_connection_id, ConnectionHandle, SessionChannels};
use crate::delivery::{MessageService, PurgeReport};
use crate::dispatch::Dispatcher;
use crate::error::CoreError;
use crate::membership::{AllowAll, RoomAuthorizer, RoomService};
use crate::metrics;
use crate::presence::PresenceTracker;
use crate::registry::{ConnectionRegistry, RegistryStats};
use crate::session::Session;
use crate::store::{MemoryStore, Store};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use switchboard_admission::{
    build_backend, ConnectContext, ConnectionThrottle, FrameContext, FrameSizeStage,
    IdentityStage, InMemoryRevocationList, OriginStage, Pipeline, RateLimitBackend,
    RateLimitStage, Rejection, RevocationList, RuleError, RuleSet, StaticTokenValidator,
    ThrottleStage, TokenValidator,
};
use switchboard_protocol::{negotiate, CloseCode};
use switchboard_transport::Transport;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Hub construction errors.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Invalid rate-limit rule: {0}")]
    Rules(#[from] RuleError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// A connection attempt as presented by the transport layer.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub remote_addr: String,
    pub origin: Option<String>,
    pub token: Option<String>,
    /// Event topics to subscribe right after admission.
    pub events: Vec<String>,
    /// Protocol version the client asked for, unparsed.
    pub version: Option<String>,
}

impl ConnectRequest {
    #[must_use]
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }
}

/// Result of one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub expired_messages: usize,
    pub deleted_messages: usize,
    pub pruned_presence: usize,
}

/// Hub statistics for health and admin endpoints.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HubStats {
    pub registry: RegistryStats,
    pub rooms: usize,
    pub occupied_rooms: usize,
    pub presence_records: usize,
}

/// Builder for [`Hub`]. Collaborators default to the in-memory ones.
pub struct HubBuilder {
    config: HubConfig,
    broker: Option<Arc<dyn Broker>>,
    store: Option<Arc<dyn Store>>,
    validator: Option<Arc<dyn TokenValidator>>,
    revocations: Option<Arc<dyn RevocationList>>,
    authorizer: Option<Arc<dyn RoomAuthorizer>>,
    limiter: Option<Arc<dyn RateLimitBackend>>,
}

impl HubBuilder {
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            broker: None,
            store: None,
            validator: None,
            revocations: None,
            authorizer: None,
            limiter: None,
        }
    }

    #[must_use]
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_token_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    #[must_use]
    pub fn with_revocation_list(mut self, revocations: Arc<dyn RevocationList>) -> Self {
        self.revocations = Some(revocations);
        self
    }

    #[must_use]
    pub fn with_room_authorizer(mut self, authorizer: Arc<dyn RoomAuthorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    #[must_use]
    pub fn with_rate_limit_backend(mut self, limiter: Arc<dyn RateLimitBackend>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Build the hub, load persisted rooms and create the configured ones.
    ///
    /// # Errors
    ///
    /// Fails for invalid rate-limit rules, an unavailable store, or an
    /// invalid seed room.
    pub async fn build(self) -> Result<Hub, HubError> {
        let config = self.config;
        let admission = &config.admission;
        let broker_timeout = admission.broker_timeout();

        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(InMemoryBroker::new()));
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let validator = self
            .validator
            .unwrap_or_else(|| Arc::new(StaticTokenValidator::new()));
        let revocations = self
            .revocations
            .unwrap_or_else(|| Arc::new(InMemoryRevocationList::new()));
        let authorizer = self.authorizer.unwrap_or_else(|| Arc::new(AllowAll));
        let limiter = self
            .limiter
            .unwrap_or_else(|| build_backend(admission.limiter));

        let rules = Arc::new(
            RuleSet::from_configs(&admission.rules)?
                .with_allow_addresses(admission.allow_addresses.iter().cloned()),
        );
        let throttle = ConnectionThrottle::new();

        let connect_pipeline = Pipeline::new()
            .with_stage(OriginStage::new(admission.allowed_origins.iter().cloned()))
            .with_stage(
                IdentityStage::new(validator, revocations, admission.allow_anonymous)
                    .with_timeout(admission.auth_timeout()),
            )
            .with_stage(ThrottleStage::new(
                throttle.clone(),
                admission.max_connections_per_identity,
            ))
            .with_stage(
                RateLimitStage::new(Arc::clone(&rules), Arc::clone(&limiter))
                    .with_timeout(admission.rate_limit_timeout()),
            );
        let frame_pipeline = Pipeline::new()
            .with_stage(FrameSizeStage::new(admission.max_frame_bytes))
            .with_stage(
                RateLimitStage::new(Arc::clone(&rules), Arc::clone(&limiter))
                    .with_timeout(admission.rate_limit_timeout()),
            );

        let directory = Arc::new(crate::room::RoomDirectory::new(Arc::clone(&store)));
        directory.load().await?;
        for spec in config.rooms.iter().cloned() {
            directory.ensure(spec).await?;
        }

        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&broker), broker_timeout));
        let presence = Arc::new(PresenceTracker::new(Arc::clone(&broker), broker_timeout));
        let rooms = Arc::new(RoomService::new(
            directory,
            Arc::clone(&registry),
            Arc::clone(&presence),
            Arc::clone(&broker),
            authorizer,
            broker_timeout,
        ));
        let messages = Arc::new(MessageService::new(
            store,
            Arc::clone(&rooms),
            Arc::clone(&broker),
            admission.max_frame_bytes,
            broker_timeout,
            config.retention.clone(),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&rooms),
            Arc::clone(&messages),
            Arc::clone(&presence),
            config.sessions.history_on_join,
        );

        info!(
            stages = ?connect_pipeline.stage_names().collect::<Vec<_>>(),
            rules = rules.rules().len(),
            rooms = rooms.directory().len(),
            "Hub ready"
        );

        Ok(Hub {
            inner: Arc::new(HubInner {
                config,
                broker,
                registry,
                presence,
                rooms,
                messages,
                dispatcher,
                rules,
                limiter,
                throttle,
                connect_pipeline,
                frame_pipeline,
            }),
        })
    }
}

struct HubInner {
    config: HubConfig,
    broker: Arc<dyn Broker>,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    rooms: Arc<RoomService>,
    messages: Arc<MessageService>,
    dispatcher: Dispatcher,
    rules: Arc<RuleSet>,
    limiter: Arc<dyn RateLimitBackend>,
    throttle: ConnectionThrottle,
    connect_pipeline: Pipeline<ConnectContext>,
    frame_pipeline: Pipeline<FrameContext>,
}

/// Shared handle to the running hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Build a hub with in-memory collaborators.
    ///
    /// # Errors
    ///
    /// See [`HubBuilder::build`].
    pub async fn new(config: HubConfig) -> Result<Self, HubError> {
        HubBuilder::new(config).build().await
    }

    #[must_use]
    pub fn builder(config: HubConfig) -> HubBuilder {
        HubBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.inner.broker
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.inner.presence
    }

    #[must_use]
    pub fn rooms(&self) -> &Arc<RoomService> {
        &self.inner.rooms
    }

    #[must_use]
    pub fn messages(&self) -> &Arc<MessageService> {
        &self.inner.messages
    }

    #[must_use]
    pub fn rules(&self) -> &Arc<RuleSet> {
        &self.inner.rules
    }

    #[must_use]
    pub fn throttle(&self) -> &ConnectionThrottle {
        &self.inner.throttle
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub(crate) fn frame_pipeline(&self) -> &Pipeline<FrameContext> {
        &self.inner.frame_pipeline
    }

    /// Run the connect pipeline and register the admitted connection.
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] of the first failing stage. A registration
    /// failure also rejects; admission never fails open.
    pub async fn open(
        &self,
        request: &ConnectRequest,
        protocol: &str,
    ) -> Result<(Arc<ConnectionHandle>, SessionChannels), Rejection> {
        let mut ctx = ConnectContext::new(request.remote_addr.clone())
            .with_origin(request.origin.clone())
            .with_token(request.token.clone());

        let admitted = match negotiate(request.version.as_deref()) {
            Ok(_) => self.inner.connect_pipeline.run(&mut ctx).await,
            Err(e) => Err(Rejection::new(CloseCode::UnsupportedVersion, "version", e.to_string())),
        };
        if let Err(rejection) = admitted {
            metrics::record_rejection(rejection.stage, rejection.code.code());
            info!(
                remote_addr = %request.remote_addr,
                stage = rejection.stage,
                code = rejection.code.code(),
                reason = %rejection.message,
                "Connection rejected"
            );
            return Err(rejection);
        }

        let (conn, channels) = ConnectionHandle::new(
            generate_connection_id(),
            std::mem::take(&mut ctx.identity),
            ctx.remote_addr.clone(),
            protocol,
        );
        conn.hold_permit(ctx.permit.take());
        let conn = Arc::new(conn);

        if let Err(e) = self.inner.registry.register(Arc::clone(&conn)).await {
            warn!(connection = %conn.id(), error = %e, "Registration failed");
            return Err(Rejection::new(
                CloseCode::GoingAway,
                "register",
                e.to_string(),
            ));
        }
        Ok((conn, channels))
    }

    /// Admit and serve one connection until it closes.
    ///
    /// Returns the close code the server sent, if it initiated the close.
    pub async fn serve<T: Transport>(&self, mut transport: T, request: ConnectRequest) -> Option<CloseCode> {
        let (conn, channels) = match self.open(&request, transport.name()).await {
            Ok(admitted) => admitted,
            Err(rejection) => {
                if let Err(e) = transport.close(rejection.code).await {
                    debug!(error = %e, "Close after rejection failed");
                }
                return Some(rejection.code);
            }
        };
        Session::new(self.clone(), transport, conn, channels)
            .run(request.events)
            .await
    }

    /// Close connections idle longer than the staleness threshold.
    pub fn sweep_stale(&self) -> Vec<String> {
        self.inner
            .registry
            .sweep_stale(self.inner.config.sessions.stale_after())
    }

    /// Drop rate-limit keys whose windows have fully elapsed.
    pub async fn sweep_limiter(&self) -> usize {
        match self.inner.limiter.sweep().await {
            Ok(pruned) => {
                if pruned > 0 {
                    metrics::record_limiter_pruned(pruned);
                    debug!(pruned, limiter = self.inner.limiter.name(), "Rate-limit keys pruned");
                }
                pruned
            }
            Err(e) => {
                warn!(error = %e, "Rate-limit sweep failed");
                0
            }
        }
    }

    /// Expire and purge messages, and prune offline presence.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreUnavailable`] if the store fails.
    pub async fn sweep_retention(&self, now: DateTime<Utc>) -> Result<RetentionReport, CoreError> {
        let PurgeReport { expired, deleted } = self.inner.messages.sweep_retention(now).await?;
        let pruned_presence = self
            .inner
            .presence
            .prune_stale(self.inner.config.retention.presence_stale_after(), now);
        Ok(RetentionReport {
            expired_messages: expired,
            deleted_messages: deleted,
            pruned_presence,
        })
    }

    /// Spawn the staleness (with rate-limit pruning) and retention sweeps.
    #[must_use]
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        let stale_hub = self.clone();
        let stale = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stale_hub.config().sessions.sweep_interval());
            loop {
                ticker.tick().await;
                let closed = stale_hub.sweep_stale();
                if !closed.is_empty() {
                    info!(count = closed.len(), "Stale connections closed");
                }
                stale_hub.sweep_limiter().await;
            }
        });

        let retention_hub = self.clone();
        let retention = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(retention_hub.config().retention.sweep_interval());
            loop {
                ticker.tick().await;
                if let Err(e) = retention_hub.sweep_retention(Utc::now()).await {
                    warn!(error = %e, "Retention sweep failed");
                }
            }
        });

        vec![stale, retention]
    }

    /// Ask every session to close with `going away`.
    pub fn shutdown(&self) -> usize {
        let count = self.inner.registry.close_all(CloseCode::GoingAway);
        info!(count, "Shutting down sessions");
        count
    }

    /// Wait until every session has deregistered, up to `timeout`.
    ///
    /// Returns `true` when no connections remain.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            while !self.inner.registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            registry: self.inner.registry.stats(),
            rooms: self.inner.rooms.directory().len(),
            occupied_rooms: self.inner.rooms.occupied_rooms(),
            presence_records: self.inner.presence.len(),
        }
    }
}
