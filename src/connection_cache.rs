//! Pool of sessions to remote participants.
//!
//! Sessions are keyed by participant, authenticated user and isolation
//! scope. A [`Connection`] is moved out of the pool on [`ConnectionCache::acquire`]
//! and moved back on [`ConnectionCache::release`], so the type system rules
//! out lending one session to two branches at once.
//!
//! Catalog changes (a participant altered, dropped, a user mapping changed)
//! invalidate cached sessions. The host publishes them on the channel
//! returned by [`invalidation_channel`]; the cache drains it before every
//! acquire. Sessions leased while their participant was invalidated carry a
//! stale generation and are closed instead of pooled when released.

use ahash::AHashMap as HashMap;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::error::Elapsed;

use crate::config::CoordinatorConfig;
use crate::errors::{DistTxnError, Result};
use crate::isolation::IsolationScope;
use crate::participant::{
    Connector, HealthState, ParticipantId, ParticipantRegistry, RemoteSession, TransportError,
    TransportResult,
};

/// Identity of a pooled session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub participant: ParticipantId,
    pub user: String,
    pub scope: IsolationScope,
}

impl ConnectionKey {
    pub fn new(participant: ParticipantId, user: impl Into<String>, scope: IsolationScope) -> Self {
        Self {
            participant,
            user: user.into(),
            scope,
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.user, self.participant, self.scope)
    }
}

/// A session lent out by the cache.
pub struct Connection {
    id: u64,
    key: ConnectionKey,
    generation: u64,
    broken: bool,
    session: Box<dyn RemoteSession>,
}

impl Connection {
    /// Process-unique id of the underlying session.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.key.participant
    }

    pub fn session(&mut self) -> &mut dyn RemoteSession {
        self.session.as_mut()
    }

    /// Flags the session as unusable; it will be closed on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken || !self.session.is_healthy()
    }

    /// Folds a timed call on this connection into a transport result.
    ///
    /// A timeout counts as unreachable. Either way an unreachable result
    /// leaves the session in an unknown protocol state, so it is marked
    /// broken.
    pub fn settle<T>(
        &mut self,
        outcome: std::result::Result<TransportResult<T>, Elapsed>,
        timeout: Duration,
    ) -> TransportResult<T> {
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(TransportError::Unreachable(format!("call timed out after {timeout:?}"))),
        };
        if let Err(e) = &result {
            if e.breaks_session() {
                self.broken = true;
            }
        }
        result
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("broken", &self.broken)
            .finish()
    }
}

/// What a catalog change invalidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Participant(ParticipantId),
    All,
}

/// Sending half of the invalidation subscription, held by the host's
/// catalog-change hook.
#[derive(Clone)]
pub struct InvalidationNotifier {
    sender: Sender<Invalidation>,
}

impl InvalidationNotifier {
    pub fn notify(&self, event: Invalidation) {
        // The cache went away; nothing left to invalidate.
        if self.sender.send(event).is_err() {
            debug!("invalidation dropped, connection cache is gone");
        }
    }
}

/// Creates the channel a [`ConnectionCache`] listens on.
pub fn invalidation_channel() -> (InvalidationNotifier, Receiver<Invalidation>) {
    let (sender, receiver) = unbounded();
    (InvalidationNotifier { sender }, receiver)
}

/// Diagnostic view of one cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryInfo {
    pub key: ConnectionKey,
    pub idle: usize,
    pub leased: usize,
    pub generation: u64,
    pub health: HealthState,
}

#[derive(Default)]
struct Entry {
    idle: Vec<Connection>,
    leased: usize,
}

#[derive(Default, Clone, Copy)]
struct ParticipantState {
    health: HealthState,
    generation: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ConnectionKey, Entry>,
    participants: HashMap<ParticipantId, ParticipantState>,
    recovered: Vec<ParticipantId>,
    next_id: u64,
}

impl Inner {
    fn participant(&mut self, id: &ParticipantId) -> &mut ParticipantState {
        self.participants.entry(id.clone()).or_default()
    }

    /// Records a health observation; returns true on an
    /// unreachable -> reachable transition.
    fn observe(&mut self, id: &ParticipantId, health: HealthState) -> bool {
        let state = self.participant(id);
        let recovered = state.health == HealthState::Unreachable && health == HealthState::Reachable;
        state.health = health;
        if recovered && !self.recovered.contains(id) {
            self.recovered.push(id.clone());
        }
        recovered
    }

    fn lease_finished(&mut self, key: &ConnectionKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.leased = entry.leased.saturating_sub(1);
        }
    }
}

/// Shared pool of participant sessions.
pub struct ConnectionCache {
    connector: Arc<dyn Connector>,
    registry: Arc<dyn ParticipantRegistry>,
    inner: Mutex<Inner>,
    invalidations: Option<Receiver<Invalidation>>,
    connect_timeout: Duration,
    max_idle_per_key: usize,
}

impl ConnectionCache {
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Arc<dyn ParticipantRegistry>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            connector,
            registry,
            inner: Mutex::new(Inner::default()),
            invalidations: None,
            connect_timeout: config.connect_timeout,
            max_idle_per_key: config.max_idle_per_key,
        }
    }

    /// Subscribes the cache to catalog-change notifications.
    pub fn with_invalidations(mut self, receiver: Receiver<Invalidation>) -> Self {
        self.invalidations = Some(receiver);
        self
    }

    /// Hands out an idle session for `key`, or opens a new one.
    ///
    /// # Errors
    ///
    /// * [`DistTxnError::UnknownParticipant`] if the registry does not know
    ///   the participant.
    /// * [`DistTxnError::ParticipantUnreachable`] if opening the session fails
    ///   or exceeds the connect timeout. No retry is attempted.
    pub async fn acquire(&self, key: &ConnectionKey) -> Result<Connection> {
        self.process_invalidations().await;

        let (reused, stale) = {
            let mut inner = self.inner.lock();
            let generation = inner.participant(&key.participant).generation;
            let entry = inner.entries.entry(key.clone()).or_default();
            let mut stale = Vec::new();
            let mut reused = None;
            while let Some(conn) = entry.idle.pop() {
                if conn.is_broken() || conn.generation != generation {
                    stale.push(conn);
                } else {
                    entry.leased += 1;
                    reused = Some(conn);
                    break;
                }
            }
            (reused, stale)
        };
        close_all(stale).await;

        if let Some(conn) = reused {
            debug!("reusing connection {} for {}", conn.id, key);
            return Ok(conn);
        }
        self.open(key).await
    }

    async fn open(&self, key: &ConnectionKey) -> Result<Connection> {
        let info = self
            .registry
            .lookup(&key.participant)
            .ok_or_else(|| DistTxnError::UnknownParticipant(key.participant.clone()))?;
        let generation = self.inner.lock().participant(&key.participant).generation;

        let session = match tokio::time::timeout(self.connect_timeout, self.connector.connect(&info, &key.user)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.mark_unreachable(&key.participant);
                return Err(DistTxnError::ParticipantUnreachable {
                    participant: key.participant.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.mark_unreachable(&key.participant);
                return Err(DistTxnError::ParticipantUnreachable {
                    participant: key.participant.clone(),
                    reason: format!("connect timed out after {:?}", self.connect_timeout),
                });
            }
        };

        let mut inner = self.inner.lock();
        if inner.observe(&key.participant, HealthState::Reachable) {
            info!("participant {} is reachable again", key.participant);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.entry(key.clone()).or_default().leased += 1;
        debug!("opened connection {} for {}", id, key);

        Ok(Connection {
            id,
            key: key.clone(),
            generation,
            broken: false,
            session,
        })
    }

    /// Returns a connection to the pool. Broken, invalidated or surplus
    /// connections are closed instead.
    pub async fn release(&self, conn: Connection) {
        let doomed = {
            let mut inner = self.inner.lock();
            inner.lease_finished(&conn.key);
            let generation = inner.participant(&conn.key.participant).generation;
            let entry = inner.entries.entry(conn.key.clone()).or_default();
            if conn.is_broken() || conn.generation != generation || entry.idle.len() >= self.max_idle_per_key {
                Some(conn)
            } else {
                entry.idle.push(conn);
                None
            }
        };
        if let Some(mut conn) = doomed {
            debug!("closing connection {} for {}", conn.id, conn.key);
            conn.session.close().await;
        }
    }

    /// Closes matching idle sessions and makes leased ones stale.
    pub async fn invalidate(&self, target: &Invalidation) {
        let doomed = {
            let mut inner = self.inner.lock();
            let matches = |participant: &ParticipantId| match target {
                Invalidation::All => true,
                Invalidation::Participant(id) => id == participant,
            };
            for (id, state) in inner.participants.iter_mut() {
                if matches(id) {
                    state.generation += 1;
                }
            }
            let mut doomed = Vec::new();
            for (key, entry) in inner.entries.iter_mut() {
                if matches(&key.participant) {
                    doomed.append(&mut entry.idle);
                }
            }
            doomed
        };
        info!("invalidated {:?}, closing {} idle connections", target, doomed.len());
        close_all(doomed).await;
    }

    /// Applies every pending catalog-change notification.
    pub async fn process_invalidations(&self) {
        let Some(receiver) = &self.invalidations else {
            return;
        };
        let pending: Vec<Invalidation> = receiver.try_iter().collect();
        for event in pending {
            self.invalidate(&event).await;
        }
    }

    /// Notes that a call on an established session found the participant
    /// unreachable.
    pub fn mark_unreachable(&self, participant: &ParticipantId) {
        let mut inner = self.inner.lock();
        if inner.participant(participant).health != HealthState::Unreachable {
            warn!("participant {} marked unreachable", participant);
        }
        inner.observe(participant, HealthState::Unreachable);
    }

    pub fn health(&self, participant: &ParticipantId) -> HealthState {
        self.inner
            .lock()
            .participants
            .get(participant)
            .map(|state| state.health)
            .unwrap_or_default()
    }

    /// Participants that became reachable again since the last call.
    pub fn take_recovered(&self) -> Vec<ParticipantId> {
        std::mem::take(&mut self.inner.lock().recovered)
    }

    /// Snapshot of every cache key, for diagnostics.
    pub fn show(&self) -> Vec<CacheEntryInfo> {
        let inner = self.inner.lock();
        let mut rows: Vec<CacheEntryInfo> = inner
            .entries
            .iter()
            .map(|(key, entry)| {
                let state = inner.participants.get(&key.participant).copied().unwrap_or_default();
                CacheEntryInfo {
                    key: key.clone(),
                    idle: entry.idle.len(),
                    leased: entry.leased,
                    generation: state.generation,
                    health: state.health,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }

    /// Closes every idle session. Leased sessions are closed when released.
    pub async fn close(&self) {
        self.invalidate(&Invalidation::All).await;
    }
}

async fn close_all(conns: Vec<Connection>) {
    for mut conn in conns {
        conn.session.close().await;
    }
}
