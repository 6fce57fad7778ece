//! Network provider: owns sessions, routes requests through the ratchet
//! pipeline, and operates the outage/recovery machinery.
//!
//! All public methods are callable from any task. Hot-path state lives in
//! concurrent maps; the outage gate, the pending-replay permit, and the
//! per-connect-id session gates are the only synchronization points.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use ecliptix_crypto::{ExchangeType, IdentityKeystore};
use ecliptix_proto::codec;
use ecliptix_proto::{AuthenticatedEstablishRequest, EnvelopeType, RestoreStatus, SessionState};
use futures::StreamExt as _;
use zeroize::Zeroize as _;

use crate::connectivity::{ConnectivityHub, ConnectivityIntent, ConnectivitySnapshot};
use crate::events::ProtocolEvents;
use crate::failure::{NetworkFailure, NetworkFailureKind};
use crate::handshake;
use crate::observer::{spawn_probe_bridge, ConnectivityObserver};
use crate::outage::OutageGate;
use crate::pending::{self, PendingRequestManager, ResumeFn};
use crate::pinning::CertificatePinning;
use crate::retry::RetryStrategy;
use crate::session::{
    derive_connect_id, operation_id, request_key, semantic_operation, Session, SessionCatalog,
};
use crate::settings::{ApplicationInstanceSettings, OUTAGE_RECOVERY_TIMEOUT};
use crate::storage::{session_key, timestamp_key, SecureStore};
use crate::transport::{RpcRequestContext, RpcTransport, ServiceType};

/// One-time prekeys generated per fresh identity.
const ONE_TIME_PREKEY_COUNT: u32 = 8;

/// Retry budget for directly invoked establishment calls; unbounded retry
/// belongs to the recovery loop, not the caller's stack.
const DIRECT_ESTABLISH_RETRIES: u32 = 2;

/// How a restore attempt schedules its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    /// Recovery-loop path: retry until the recovery token cancels.
    Auto,
    /// User-initiated: one attempt through the manual-retry gate.
    Manual,
    /// Single attempt, no retry.
    Direct,
}

/// The client-side secure channel provider. Cloning yields another handle
/// to the same provider.
#[derive(Clone)]
pub struct NetworkProvider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    self_weak: Weak<ProviderInner>,
    transport: Arc<dyn RpcTransport>,
    store: Arc<dyn SecureStore>,
    pinning: Arc<dyn CertificatePinning>,
    observer: Arc<dyn ConnectivityObserver>,
    hub: Arc<ConnectivityHub>,
    retry: RetryStrategy,
    pending: PendingRequestManager,
    catalog: SessionCatalog,
    sessions: RwLock<HashMap<u32, Arc<Mutex<Session>>>>,
    session_gates: Mutex<HashMap<u32, Arc<tokio::sync::Mutex<()>>>>,
    request_cancels: Mutex<HashMap<u64, (u32, CancellationToken)>>,
    stream_cancels: Mutex<HashMap<u32, CancellationToken>>,
    outage: OutageGate,
    shutdown: CancellationToken,
    settings: RwLock<Option<ApplicationInstanceSettings>>,
    probe_bridge: Mutex<Option<tokio::task::JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl NetworkProvider {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        store: Arc<dyn SecureStore>,
        pinning: Arc<dyn CertificatePinning>,
        observer: Arc<dyn ConnectivityObserver>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let hub = Arc::new(ConnectivityHub::new());
        let inner = Arc::new_cyclic(|weak| ProviderInner {
            self_weak: weak.clone(),
            transport,
            store,
            pinning,
            observer,
            hub: Arc::clone(&hub),
            retry: RetryStrategy::new(hub),
            pending: PendingRequestManager::new(),
            catalog: SessionCatalog::new(),
            sessions: RwLock::new(HashMap::new()),
            session_gates: Mutex::new(HashMap::new()),
            request_cancels: Mutex::new(HashMap::new()),
            stream_cancels: Mutex::new(HashMap::new()),
            outage: OutageGate::new(shutdown.clone()),
            shutdown,
            settings: RwLock::new(None),
            probe_bridge: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });
        Self { inner }
    }

    /// Subscribe to connectivity snapshots (last-value replay).
    pub fn subscribe_connectivity(&self) -> watch::Receiver<ConnectivitySnapshot> {
        self.inner.hub.subscribe()
    }

    pub fn connectivity_snapshot(&self) -> ConnectivitySnapshot {
        self.inner.hub.current()
    }

    /// Install identity and an unconnected session for `connect_id`.
    pub fn initiate_protocol_system(
        &self,
        settings: &ApplicationInstanceSettings,
        connect_id: u32,
    ) -> Result<(), NetworkFailure> {
        self.inner.ensure_usable()?;
        *self.inner.settings.write() = Some(settings.clone());

        let exchange_type = if connect_id == derive_connect_id(settings, ExchangeType::ServerStreaming)
        {
            ExchangeType::ServerStreaming
        } else {
            ExchangeType::EphemeralConnect
        };
        self.inner.install_fresh_session(connect_id, exchange_type)
    }

    /// True when a session exists and has completed its exchange.
    pub fn has_connection(&self, connect_id: u32) -> bool {
        self.inner
            .session(connect_id)
            .is_some_and(|s| s.lock().is_established())
    }

    /// Bootstrap handshake over the pinned RSA envelope. Persists and
    /// returns the resulting session state.
    pub async fn establish_channel(
        &self,
        connect_id: u32,
    ) -> Result<SessionState, NetworkFailure> {
        self.inner.ensure_usable()?;
        let gate = self.inner.session_gate(connect_id);
        let _permit = gate.lock().await;
        self.inner.establish_channel_locked(connect_id).await
    }

    /// Restore a persisted session, reconciling chains with the server.
    ///
    /// Returns `Ok(true)` when the server restored the session; `Ok(false)`
    /// when the server lost it and a fresh channel was established instead.
    pub async fn restore_channel(
        &self,
        state: SessionState,
        settings: &ApplicationInstanceSettings,
        retry_mode: RestoreMode,
        enable_pending: bool,
    ) -> Result<bool, NetworkFailure> {
        self.inner.ensure_usable()?;
        *self.inner.settings.write() = Some(settings.clone());
        self.inner
            .restore_channel_inner(state, retry_mode, enable_pending)
            .await
    }

    /// Load persisted state for `connect_id` and restore it; false when no
    /// usable state exists or the attempt failed.
    pub async fn try_restore(&self, connect_id: u32) -> bool {
        self.inner.try_restore(connect_id).await
    }

    /// Idempotently ensure a session for `exchange_type`, returning its id.
    pub fn ensure_protocol_for_type(
        &self,
        exchange_type: ExchangeType,
    ) -> Result<u32, NetworkFailure> {
        self.inner.ensure_usable()?;
        let settings = self.inner.current_settings()?;
        let connect_id = derive_connect_id(&settings, exchange_type);
        self.inner.install_fresh_session(connect_id, exchange_type)?;
        Ok(connect_id)
    }

    /// One encrypted request, one encrypted response, delivered to
    /// `on_complete`.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_unary<F>(
        &self,
        connect_id: u32,
        service_type: ServiceType,
        plaintext: &[u8],
        on_complete: F,
        allow_duplicates: bool,
        wait_for_recovery: bool,
        context: Option<RpcRequestContext>,
        cancel: &CancellationToken,
    ) -> Result<(), NetworkFailure>
    where
        F: FnOnce(Vec<u8>) + Send,
    {
        self.inner.ensure_usable()?;
        let plain = self
            .inner
            .execute_unary_pipeline(
                connect_id,
                service_type,
                plaintext,
                allow_duplicates,
                wait_for_recovery,
                context,
                cancel,
            )
            .await?;
        on_complete(plain);
        Ok(())
    }

    /// One encrypted request, a stream of decrypted items to `on_item`.
    pub async fn execute_receive_stream<F>(
        &self,
        connect_id: u32,
        service_type: ServiceType,
        plaintext: &[u8],
        on_item: F,
        allow_duplicates: bool,
        cancel: &CancellationToken,
    ) -> Result<(), NetworkFailure>
    where
        F: FnMut(Vec<u8>) + Send,
    {
        self.inner.ensure_usable()?;
        self.inner
            .execute_receive_stream_pipeline(
                connect_id,
                service_type,
                plaintext,
                on_item,
                allow_duplicates,
                cancel,
            )
            .await
    }

    /// Manual recovery surface: clear exhaustion, retry restore, fall back
    /// to a fresh establishment.
    pub async fn force_fresh_connection(&self) -> Result<(), NetworkFailure> {
        self.inner.ensure_usable()?;
        self.inner.force_fresh_connection().await
    }

    /// Tear down and rebuild the session from a long-lived master key.
    pub async fn recreate_with_master_key(
        &self,
        master_key: &[u8],
        membership_id: &str,
        connect_id: u32,
    ) -> Result<(), NetworkFailure> {
        self.inner.ensure_usable()?;
        self.inner
            .recreate_with_master_key(master_key, membership_id, connect_id)
            .await
    }

    /// Cancel an active receive stream for `connect_id`.
    pub fn cleanup_stream(&self, connect_id: u32) {
        self.inner.cleanup_stream(connect_id);
    }

    /// Drop a session and its persisted state.
    pub async fn clear_connection(&self, connect_id: u32) {
        self.inner.clear_connection(connect_id).await;
    }

    /// Cancel everything and resolve every waiter. Idempotent.
    pub async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

impl ProviderInner {
    fn ensure_usable(&self) -> Result<(), NetworkFailure> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(NetworkFailure::server_shutdown("provider disposed"));
        }
        Ok(())
    }

    fn strong(&self) -> Option<Arc<ProviderInner>> {
        self.self_weak.upgrade()
    }

    fn events_handle(&self) -> Weak<dyn ProtocolEvents> {
        self.self_weak.clone()
    }

    fn session(&self, connect_id: u32) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().get(&connect_id).cloned()
    }

    fn session_gate(&self, connect_id: u32) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.session_gates
                .lock()
                .entry(connect_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn current_settings(&self) -> Result<ApplicationInstanceSettings, NetworkFailure> {
        self.settings
            .read()
            .clone()
            .ok_or_else(|| NetworkFailure::invalid_request("protocol system not initiated"))
    }

    /// Token cancelled by the caller, the provider shutdown, or disposal.
    fn linked_token(&self, caller: &CancellationToken) -> CancellationToken {
        let linked = self.shutdown.child_token();
        let forward = linked.clone();
        let caller = caller.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = caller.cancelled() => forward.cancel(),
                () = forward.cancelled() => {}
            }
        });
        linked
    }

    fn install_fresh_session(
        &self,
        connect_id: u32,
        exchange_type: ExchangeType,
    ) -> Result<(), NetworkFailure> {
        {
            let sessions = self.sessions.read();
            if sessions.contains_key(&connect_id) {
                return Ok(());
            }
        }
        let keystore = IdentityKeystore::create(ONE_TIME_PREKEY_COUNT)?;
        let session = Session::new(connect_id, exchange_type, keystore, self.events_handle());

        let mut sessions = self.sessions.write();
        // CAS semantics: a racing insert wins and ours is dropped.
        sessions.entry(connect_id).or_insert_with(|| Arc::new(Mutex::new(session)));
        drop(sessions);

        self.catalog.register(connect_id, exchange_type);
        tracing::info!(connect_id, ?exchange_type, "protocol session installed");
        Ok(())
    }

    // ── Establishment ────────────────────────────────────────────────────

    async fn establish_channel_locked(
        &self,
        connect_id: u32,
    ) -> Result<SessionState, NetworkFailure> {
        let session_arc = self.session(connect_id).ok_or_else(|| {
            NetworkFailure::invalid_request(format!("no session installed for {connect_id}"))
        })?;
        let exchange_type = { session_arc.lock().exchange_type() };

        self.hub.publish(ConnectivityIntent::Connecting { connect_id });

        let exchange = {
            let mut session = session_arc.lock();
            // Re-establishing an already connected session starts over with
            // a fresh ratchet; the identity keystore is kept.
            if session.is_established() {
                session.reset_channel();
            }
            session.begin_exchange()
        };
        let request_id = operation_id(&semantic_operation(
            ServiceType::EstablishChannel,
            connect_id,
            &[],
            0,
        ));
        let request = match handshake::build_bootstrap_request(&*self.pinning, &exchange, request_id)
        {
            Ok(request) => request,
            Err(failure) => {
                return Err(self.queue_establish_recovery(connect_id, exchange_type, failure));
            }
        };

        let token = self.shutdown.child_token();
        let transport = Arc::clone(&self.transport);
        let outage_entry = self.strong();
        let response = self
            .retry
            .execute_rpc(
                move |_attempt| {
                    let transport = Arc::clone(&transport);
                    let request = request.clone();
                    let outage_entry = outage_entry.clone();
                    async move {
                        transport.establish_channel(request).await.map_err(|e| {
                            let failure = NetworkFailure::from(e);
                            if let Some(inner) = outage_entry {
                                inner.enter_outage_on(&failure);
                            }
                            failure
                        })
                    }
                },
                "establish_channel",
                connect_id,
                ServiceType::EstablishChannel,
                Some(DIRECT_ESTABLISH_RETRIES),
                &token,
            )
            .await;

        let response = match response {
            Ok(response) => response,
            Err(failure) => {
                return Err(self.queue_establish_recovery(connect_id, exchange_type, failure));
            }
        };

        let peer = match handshake::parse_bootstrap_response(&*self.pinning, &response) {
            Ok(peer) => peer,
            Err(failure) => {
                return Err(self.queue_establish_recovery(connect_id, exchange_type, failure));
            }
        };

        let state = {
            let mut session = session_arc.lock();
            session.complete_exchange(&peer)?;
            session.to_state()?
        };
        self.persist_session(connect_id).await;

        // The channel is up: any recovery work queued for it is obsolete.
        self.pending.remove(&pending::establish_key(connect_id, exchange_type));
        self.pending.remove(&pending::restore_key(connect_id));
        self.exit_outage_and_replay();
        self.hub
            .publish(ConnectivityIntent::Connected { connect_id: Some(connect_id) });
        tracing::info!(connect_id, "secure channel established");
        Ok(state)
    }

    /// On a retryable establishment failure: enter the outage and queue a
    /// resume closure so recovery re-runs the handshake.
    fn queue_establish_recovery(
        &self,
        connect_id: u32,
        exchange_type: ExchangeType,
        failure: NetworkFailure,
    ) -> NetworkFailure {
        if !should_queue_recovery(&failure) {
            return failure;
        }
        self.enter_outage_on(&failure);

        let key = pending::establish_key(connect_id, exchange_type);
        let weak = self.self_weak.clone();
        let resume_key = key.clone();
        let resume: ResumeFn = Arc::new(move |cancel| {
            let weak = weak.clone();
            let resume_key = resume_key.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return Err(NetworkFailure::cancelled("provider disposed"));
                };
                if cancel.is_cancelled() {
                    return Err(NetworkFailure::cancelled("recovery cancelled"));
                }
                let gate = inner.session_gate(connect_id);
                let _permit = gate.lock().await;
                inner.establish_channel_locked(connect_id).await?;
                inner.pending.remove(&resume_key);
                Ok(())
            })
        });
        self.pending.register(key, resume);
        failure
    }

    // ── Restore ──────────────────────────────────────────────────────────

    async fn restore_channel_inner(
        &self,
        state: SessionState,
        retry_mode: RestoreMode,
        enable_pending: bool,
    ) -> Result<bool, NetworkFailure> {
        let connect_id = state.connect_id;
        let gate = self.session_gate(connect_id);
        let _permit = gate.lock().await;

        let session = Session::from_state(&state, self.events_handle())?;
        let exchange_type = session.exchange_type();
        self.sessions
            .write()
            .insert(connect_id, Arc::new(Mutex::new(session)));
        self.catalog.register(connect_id, exchange_type);

        let token = match retry_mode {
            RestoreMode::Auto => self.outage.recovery_token(),
            RestoreMode::Manual | RestoreMode::Direct => self.shutdown.child_token(),
        };
        let transport = Arc::clone(&self.transport);
        let outage_entry = self.strong();
        let op = move |_attempt: u32| {
            let transport = Arc::clone(&transport);
            let outage_entry = outage_entry.clone();
            async move {
                transport.restore_channel(connect_id).await.map_err(|e| {
                    let failure = NetworkFailure::from(e);
                    if let Some(inner) = outage_entry {
                        inner.enter_outage_on(&failure);
                    }
                    failure
                })
            }
        };

        let result = match retry_mode {
            RestoreMode::Auto => {
                self.retry
                    .execute_rpc(op, "restore_channel", connect_id, ServiceType::RestoreChannel, None, &token)
                    .await
            }
            RestoreMode::Manual => {
                self.retry
                    .execute_manual_retry_rpc(op, "restore_channel", connect_id, ServiceType::RestoreChannel, &token)
                    .await
            }
            RestoreMode::Direct => {
                self.retry
                    .execute_rpc(op, "restore_channel", connect_id, ServiceType::RestoreChannel, Some(0), &token)
                    .await
            }
        };

        let response = match result {
            Ok(response) => response,
            Err(failure) => {
                return Err(self.queue_restore_recovery(connect_id, enable_pending, failure));
            }
        };

        match response.status {
            RestoreStatus::SessionRestored => {
                let session_arc = self.session(connect_id).ok_or_else(|| {
                    NetworkFailure::invalid_request("session vanished during restore")
                })?;
                {
                    let mut session = session_arc.lock();
                    session.sync_with_remote(
                        response.sending_chain_length,
                        response.receiving_chain_length,
                    )?;
                }
                self.persist_session(connect_id).await;
                self.pending.remove(&pending::restore_key(connect_id));
                self.exit_outage_and_replay();
                self.hub
                    .publish(ConnectivityIntent::Connected { connect_id: Some(connect_id) });
                tracing::info!(connect_id, "session restored");
                Ok(true)
            }
            RestoreStatus::SessionNotFound => {
                // The server lost the session: keep the identity, rebuild
                // the channel from scratch.
                tracing::warn!(connect_id, "server lost session; establishing fresh channel");
                let keystore = IdentityKeystore::from_state(&state.identity_keys)?;
                let fresh =
                    Session::new(connect_id, exchange_type, keystore, self.events_handle());
                self.sessions
                    .write()
                    .insert(connect_id, Arc::new(Mutex::new(fresh)));
                self.establish_channel_locked(connect_id).await?;
                Ok(false)
            }
        }
    }

    fn queue_restore_recovery(
        &self,
        connect_id: u32,
        enable_pending: bool,
        failure: NetworkFailure,
    ) -> NetworkFailure {
        if !enable_pending || !should_queue_recovery(&failure) {
            return failure;
        }
        self.enter_outage_on(&failure);

        let key = pending::restore_key(connect_id);
        let weak = self.self_weak.clone();
        let resume_key = key.clone();
        let resume: ResumeFn = Arc::new(move |cancel| {
            let weak = weak.clone();
            let resume_key = resume_key.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return Err(NetworkFailure::cancelled("provider disposed"));
                };
                if cancel.is_cancelled() {
                    return Err(NetworkFailure::cancelled("recovery cancelled"));
                }
                // Re-run the restore from the current in-memory state.
                let state = {
                    let session_arc = inner.session(connect_id).ok_or_else(|| {
                        NetworkFailure::invalid_request("no session to restore")
                    })?;
                    let session = session_arc.lock();
                    session.to_state()?
                };
                inner
                    .restore_channel_inner(state, RestoreMode::Direct, false)
                    .await?;
                inner.pending.remove(&resume_key);
                Ok(())
            })
        });
        self.pending.register(key, resume);
        failure
    }

    async fn try_restore(&self, connect_id: u32) -> bool {
        let Ok(settings) = self.current_settings() else {
            return false;
        };
        let blob = match self
            .store
            .get(&settings.membership_id, &session_key(connect_id))
            .await
        {
            Ok(Some(blob)) => blob,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(connect_id, error = %e, "session state unreadable");
                return false;
            }
        };
        let state = match codec::decode_session_state(&blob) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(connect_id, error = %e, "session state corrupt");
                return false;
            }
        };
        match self
            .restore_channel_inner(state, RestoreMode::Direct, false)
            .await
        {
            Ok(restored) => restored,
            Err(e) => {
                tracing::warn!(connect_id, error = %e, "restore attempt failed");
                false
            }
        }
    }

    // ── Unary pipeline ───────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn execute_unary_pipeline(
        &self,
        connect_id: u32,
        service_type: ServiceType,
        plaintext: &[u8],
        allow_duplicates: bool,
        wait_for_recovery: bool,
        context: Option<RpcRequestContext>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, NetworkFailure> {
        let key = request_key(connect_id, service_type, plaintext);
        let token = self.linked_token(cancel);

        if !allow_duplicates {
            match self.request_cancels.lock().entry(key) {
                std::collections::hash_map::Entry::Occupied(_) => {
                    return Err(NetworkFailure::duplicate_request(format!(
                        "request {key:#018x} already in flight"
                    )));
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert((connect_id, token.clone()));
                }
            }
        }

        let result = self
            .execute_unary_guarded(
                connect_id,
                service_type,
                plaintext,
                wait_for_recovery,
                context,
                &token,
            )
            .await;

        if !allow_duplicates {
            self.request_cancels.lock().remove(&key);
        }
        result
    }

    async fn execute_unary_guarded(
        &self,
        connect_id: u32,
        service_type: ServiceType,
        plaintext: &[u8],
        wait_for_recovery: bool,
        context: Option<RpcRequestContext>,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, NetworkFailure> {
        if wait_for_recovery {
            self.outage.wait_cleared(OUTAGE_RECOVERY_TIMEOUT, token).await?;
        }

        let Some(session_arc) = self.session(connect_id) else {
            self.hub.publish(ConnectivityIntent::ServerShutdown {
                reason: format!("no session for connect {connect_id}"),
            });
            return Err(NetworkFailure::not_responding(format!(
                "no session for connect {connect_id}"
            )));
        };

        let semantic = semantic_operation(service_type, connect_id, plaintext, now_millis());
        let op_id = operation_id(&semantic);
        let idempotency_key = context
            .map(|c| c.idempotency_key)
            .unwrap_or_else(|| stable_idempotency_key(&semantic));

        // Encrypt once; every retry reuses the same sealed envelope with a
        // fresh attempt-stamped context.
        let envelope = {
            let mut session = session_arc.lock();
            session.seal(plaintext, op_id, EnvelopeType::Request)?
        };

        let transport = Arc::clone(&self.transport);
        let outage_entry = self.strong();
        let op_key = idempotency_key.clone();
        let result = self
            .retry
            .execute_rpc(
                move |attempt| {
                    let transport = Arc::clone(&transport);
                    let envelope = envelope.clone();
                    let context = RpcRequestContext::new(op_key.clone(), attempt);
                    let outage_entry = outage_entry.clone();
                    async move {
                        transport
                            .unary(service_type, envelope, context)
                            .await
                            .map_err(|e| {
                                let failure = NetworkFailure::from(e);
                                if let Some(inner) = outage_entry {
                                    inner.enter_outage_on(&failure);
                                }
                                failure
                            })
                    }
                },
                service_type.wire_name(),
                connect_id,
                service_type,
                None,
                token,
            )
            .await;

        let outcome = match result {
            Ok(response) => {
                let mut session = session_arc.lock();
                session.open(&response)
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(plain) => {
                self.exit_outage_and_replay();
                Ok(plain)
            }
            Err(failure) => {
                let mut failure = failure.with_correlation(idempotency_key);
                if service_type.is_auth_complete()
                    && matches!(
                        failure.kind,
                        NetworkFailureKind::DataCenterNotResponding
                            | NetworkFailureKind::DataCenterShutdown
                            | NetworkFailureKind::ProtocolStateMismatch
                    )
                {
                    failure = failure.with_reinit();
                }
                Err(failure)
            }
        }
    }

    // ── Receive stream pipeline ──────────────────────────────────────────

    async fn execute_receive_stream_pipeline<F>(
        &self,
        connect_id: u32,
        service_type: ServiceType,
        plaintext: &[u8],
        mut on_item: F,
        allow_duplicates: bool,
        cancel: &CancellationToken,
    ) -> Result<(), NetworkFailure>
    where
        F: FnMut(Vec<u8>) + Send,
    {
        let key = request_key(connect_id, service_type, plaintext);
        let token = self.linked_token(cancel);

        if !allow_duplicates {
            match self.request_cancels.lock().entry(key) {
                std::collections::hash_map::Entry::Occupied(_) => {
                    return Err(NetworkFailure::duplicate_request(format!(
                        "stream {key:#018x} already in flight"
                    )));
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert((connect_id, token.clone()));
                }
            }
        }
        self.stream_cancels.lock().insert(connect_id, token.clone());

        let result = self
            .run_receive_stream(connect_id, service_type, plaintext, &mut on_item, &token)
            .await;

        self.stream_cancels.lock().remove(&connect_id);
        if !allow_duplicates {
            self.request_cancels.lock().remove(&key);
        }
        result
    }

    async fn run_receive_stream<F>(
        &self,
        connect_id: u32,
        service_type: ServiceType,
        plaintext: &[u8],
        on_item: &mut F,
        token: &CancellationToken,
    ) -> Result<(), NetworkFailure>
    where
        F: FnMut(Vec<u8>) + Send,
    {
        let Some(session_arc) = self.session(connect_id) else {
            self.hub.publish(ConnectivityIntent::ServerShutdown {
                reason: format!("no session for connect {connect_id}"),
            });
            return Err(NetworkFailure::not_responding(format!(
                "no session for connect {connect_id}"
            )));
        };

        let semantic = semantic_operation(service_type, connect_id, plaintext, now_millis());
        let op_id = operation_id(&semantic);
        let idempotency_key = stable_idempotency_key(&semantic);

        let envelope = {
            let mut session = session_arc.lock();
            session.seal(plaintext, op_id, EnvelopeType::Request)?
        };

        let mut stream = self
            .transport
            .receive_stream(
                service_type,
                envelope,
                RpcRequestContext::new(idempotency_key.clone(), 1),
            )
            .await
            .map_err(|e| NetworkFailure::from(e).with_correlation(idempotency_key.clone()))?;

        let mut delivered = 0u64;
        loop {
            let item = tokio::select! {
                () = token.cancelled() => {
                    tracing::debug!(connect_id, delivered, "receive stream cancelled");
                    return Err(NetworkFailure::cancelled("stream cancelled"));
                }
                item = stream.next() => item,
            };
            match item {
                None => {
                    // Server-initiated close; distinguished from local
                    // cancellation by the token state.
                    tracing::debug!(connect_id, delivered, "receive stream closed by server");
                    return Ok(());
                }
                Some(Ok(envelope)) => {
                    let plain = {
                        let mut session = session_arc.lock();
                        session.open(&envelope)?
                    };
                    if delivered == 0 {
                        // First item proves the channel; clears any recovery.
                        self.exit_outage_and_replay();
                        self.retry.mark_connection_healthy(connect_id);
                    }
                    delivered += 1;
                    on_item(plain);
                }
                Some(Err(e)) => {
                    let failure = NetworkFailure::from(e).with_correlation(idempotency_key);
                    self.enter_outage_on(&failure);
                    return Err(failure);
                }
            }
        }
    }

    // ── Recovery surface ─────────────────────────────────────────────────

    async fn force_fresh_connection(&self) -> Result<(), NetworkFailure> {
        self.hub.publish(ConnectivityIntent::ManualRetryRequested);
        self.retry.clear_exhausted();

        let settings = self.current_settings()?;
        let connect_id = derive_connect_id(&settings, ExchangeType::EphemeralConnect);

        if self.try_restore(connect_id).await {
            return Ok(());
        }
        self.install_fresh_session(connect_id, ExchangeType::EphemeralConnect)?;
        let gate = self.session_gate(connect_id);
        let _permit = gate.lock().await;
        self.establish_channel_locked(connect_id).await.map(|_| ())
    }

    async fn recreate_with_master_key(
        &self,
        master_key: &[u8],
        membership_id: &str,
        connect_id: u32,
    ) -> Result<(), NetworkFailure> {
        let mut root = handshake::derive_authenticated_root(master_key)?;
        let keystore = IdentityKeystore::create_from_master_key(
            master_key,
            membership_id.as_bytes(),
            ONE_TIME_PREKEY_COUNT,
        )
        .map_err(|e| NetworkFailure::critical_auth(e.to_string()))?;

        // Any prior session at this id is superseded: cancel its traffic.
        self.cancel_connection_ops(connect_id);

        let gate = self.session_gate(connect_id);
        let _permit = gate.lock().await;

        let session = Session::new(
            connect_id,
            ExchangeType::EphemeralConnect,
            keystore,
            self.events_handle(),
        );
        let exchange = session.begin_exchange();
        let session_arc = Arc::new(Mutex::new(session));
        self.sessions.write().insert(connect_id, Arc::clone(&session_arc));
        self.catalog.register(connect_id, ExchangeType::EphemeralConnect);

        if let Some(settings) = self.settings.write().as_mut() {
            settings.membership_id = membership_id.to_string();
        }

        let request = AuthenticatedEstablishRequest {
            membership_unique_id: membership_id.as_bytes().to_vec(),
            client_pub_key_exchange: exchange,
        };
        let token = self.shutdown.child_token();
        let transport = Arc::clone(&self.transport);
        let response = self
            .retry
            .execute_rpc(
                move |_attempt| {
                    let transport = Arc::clone(&transport);
                    let request = request.clone();
                    async move {
                        transport
                            .establish_authenticated_channel(request)
                            .await
                            .map_err(NetworkFailure::from)
                    }
                },
                "establish_authenticated_channel",
                connect_id,
                ServiceType::EstablishAuthenticatedChannel,
                Some(DIRECT_ESTABLISH_RETRIES),
                &token,
            )
            .await?;

        let peer = handshake::parse_bootstrap_response(&*self.pinning, &response)?;
        {
            let mut session = session_arc.lock();
            session.complete_authenticated_exchange(&peer, root)?;
        }
        root.zeroize();

        self.persist_session(connect_id).await;
        self.exit_outage_and_replay();
        self.hub
            .publish(ConnectivityIntent::Connected { connect_id: Some(connect_id) });
        tracing::info!(connect_id, "authenticated channel recreated from master key");
        Ok(())
    }

    fn enter_outage_on(&self, failure: &NetworkFailure) {
        if !failure.is_retryable_connectivity() {
            return;
        }
        if self.outage.begin() {
            self.hub.publish(ConnectivityIntent::Recovering {
                reason: failure.message.clone(),
            });
            let recovery = self.outage.recovery_token();
            let bridge = spawn_probe_bridge(
                Arc::clone(&self.observer),
                Arc::clone(&self.hub),
                recovery,
            );
            *self.probe_bridge.lock() = Some(bridge);
        }
    }

    fn exit_outage_and_replay(&self) {
        if self.outage.exit() {
            self.hub.publish(ConnectivityIntent::Connected { connect_id: None });
            self.probe_bridge.lock().take();
            if let Some(inner) = self.strong() {
                let cancel = self.shutdown.child_token();
                tokio::spawn(async move {
                    inner.pending.retry_all(&cancel).await;
                });
            }
        }
    }

    // ── Persistence ──────────────────────────────────────────────────────

    /// Serialize and store session state. Errors are logged, not surfaced;
    /// the ratchet advances monotonically so last-writer-wins is safe.
    async fn persist_session(&self, connect_id: u32) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let Ok(settings) = self.current_settings() else {
            return;
        };
        let Some(session_arc) = self.session(connect_id) else {
            return;
        };

        let encoded = {
            let session = session_arc.lock();
            if session.exchange_type() == ExchangeType::ServerStreaming {
                return;
            }
            if session.peer_handshake().is_none() {
                return;
            }
            match session.to_state().map(|s| codec::encode_session_state(&s)) {
                Ok(Ok(blob)) => blob,
                Ok(Err(e)) => {
                    tracing::warn!(connect_id, error = %e, "session state encode failed");
                    return;
                }
                Err(e) => {
                    tracing::warn!(connect_id, error = %e, "session snapshot failed");
                    return;
                }
            }
        };

        let membership = settings.membership_id;
        if let Err(e) = self
            .store
            .put(&membership, &session_key(connect_id), encoded)
            .await
        {
            tracing::warn!(connect_id, error = %e, "session state write failed");
            return;
        }
        let stamp = codec::encode_timestamp(now_millis()).to_vec();
        if let Err(e) = self
            .store
            .put(&membership, &timestamp_key(connect_id), stamp)
            .await
        {
            tracing::warn!(connect_id, error = %e, "session timestamp write failed");
        }
    }

    fn schedule_persist(&self, connect_id: u32) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let Some(inner) = self.strong() else {
            return;
        };
        tokio::spawn(async move {
            tokio::select! {
                () = inner.shutdown.cancelled() => {}
                () = inner.persist_session(connect_id) => {}
            }
        });
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    fn cancel_connection_ops(&self, connect_id: u32) {
        let mut requests = self.request_cancels.lock();
        requests.retain(|_, (id, token)| {
            if *id == connect_id {
                token.cancel();
                false
            } else {
                true
            }
        });
        drop(requests);

        if let Some(token) = self.stream_cancels.lock().remove(&connect_id) {
            token.cancel();
        }
    }

    fn cleanup_stream(&self, connect_id: u32) {
        if let Some(token) = self.stream_cancels.lock().remove(&connect_id) {
            tracing::debug!(connect_id, "stream cancelled by caller");
            token.cancel();
        }
    }

    async fn clear_connection(&self, connect_id: u32) {
        self.cancel_connection_ops(connect_id);
        self.sessions.write().remove(&connect_id);
        self.catalog.forget(connect_id);

        if let Ok(settings) = self.current_settings() {
            let membership = settings.membership_id;
            if let Err(e) = self.store.remove(&membership, &session_key(connect_id)).await {
                tracing::warn!(connect_id, error = %e, "session state removal failed");
            }
            if let Err(e) = self
                .store
                .remove(&membership, &timestamp_key(connect_id))
                .await
            {
                tracing::warn!(connect_id, error = %e, "session timestamp removal failed");
            }
        }
        tracing::info!(connect_id, "connection cleared");
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("provider disposing");
        self.hub.publish(ConnectivityIntent::Shutdown);

        // Resolve every waiter before tearing anything down.
        self.outage.shut_down();
        self.shutdown.cancel();

        for (_, (_, token)) in self.request_cancels.lock().drain() {
            token.cancel();
        }
        for (_, token) in self.stream_cancels.lock().drain() {
            token.cancel();
        }
        if let Some(bridge) = self.probe_bridge.lock().take() {
            bridge.abort();
        }
        self.sessions.write().clear();
    }
}

impl ProtocolEvents for ProviderInner {
    fn on_ratchet_performed(&self, connect_id: u32, is_sending: bool, new_index: u32) {
        tracing::trace!(connect_id, is_sending, new_index, "ratchet advanced");
        self.schedule_persist(connect_id);
    }

    fn on_chain_synchronized(&self, connect_id: u32, local_len: u32, remote_len: u32) {
        tracing::debug!(connect_id, local_len, remote_len, "chains synchronized");
        self.schedule_persist(connect_id);
    }

    fn on_message_processed(&self, connect_id: u32, receiving_index: u32) {
        tracing::trace!(connect_id, receiving_index, "message processed");
    }
}

/// An outage-worthy establishment/restore failure: the retryable transport
/// and protocol kinds, plus a burned retry budget over those kinds.
fn should_queue_recovery(failure: &NetworkFailure) -> bool {
    failure.is_retryable_connectivity()
        || failure.kind == NetworkFailureKind::RetriesExhausted
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Idempotency key derived from the semantic operation string: stable for
/// retries of the same logical call.
fn stable_idempotency_key(semantic: &str) -> String {
    use sha2::{Digest as _, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"ecliptix-idempotency");
    hasher.update(semantic.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}
