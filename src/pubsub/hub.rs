//! Pub/Sub Hub
//!
//! Routes client channel and pattern subscriptions over the database's
//! notification bus. One listener connection serves the whole process:
//!
//! - `SUBSCRIBE` adds the session locally and, for a channel's first
//!   subscriber, enqueues a `LISTEN` for the listener task (bounded queue;
//!   overflow logs and drops the command while the local state proceeds);
//! - `PSUBSCRIBE` is entirely in-process: every delivery is matched
//!   against the pattern table locally;
//! - `PUBLISH` translates the channel to its database name and `NOTIFY`s;
//!   the message comes back through the listener and fans out from there,
//!   so cross-process and local subscribers see one ordering.
//!
//! Deliveries go straight to each subscriber's write mutex. A slow
//! consumer therefore stalls only its own send, but the listener blocks
//! for the duration of that send; the per-session outbound capacity knob
//! bounds how much can pile up behind one socket.

use crate::glob::glob_match;
use crate::protocol::RespValue;
use crate::pubsub::names::{db_channel, publish_payload, unwrap_payload};
use crate::pubsub::{connect_listener, quote_channel};
use crate::server::session::SessionHandle;
use crate::storage::StorageError;
use bytes::Bytes;
use deadpool_postgres::Pool;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Adaptive listener wait bounds.
const IDLE_WAIT_MIN: Duration = Duration::from_millis(50);
const IDLE_WAIT_MAX: Duration = Duration::from_secs(2);
/// Reconnect backoff bounds.
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// LISTEN/UNLISTEN command queue depth.
const COMMAND_QUEUE_DEPTH: usize = 1024;

/// LISTEN/UNLISTEN work for the listener task.
#[derive(Debug)]
pub enum ListenCommand {
    Listen(String),
    Unlisten(String),
}

#[derive(Default)]
struct HubState {
    /// channel -> subscribed sessions
    channels: HashMap<Bytes, HashMap<u64, Arc<SessionHandle>>>,
    /// pattern -> subscribed sessions
    patterns: HashMap<Bytes, HashMap<u64, Arc<SessionHandle>>>,
    /// session -> its channels
    session_channels: HashMap<u64, HashSet<Bytes>>,
    /// session -> its patterns
    session_patterns: HashMap<u64, HashSet<Bytes>>,
    /// database channels currently LISTENed (or queued to be)
    listening: HashSet<String>,
}

impl HubState {
    fn subscription_count(&self, session_id: u64) -> i64 {
        let channels = self
            .session_channels
            .get(&session_id)
            .map(|s| s.len())
            .unwrap_or(0);
        let patterns = self
            .session_patterns
            .get(&session_id)
            .map(|s| s.len())
            .unwrap_or(0);
        (channels + patterns) as i64
    }
}

/// The process-wide pub/sub hub.
pub struct Hub {
    state: Mutex<HubState>,
    cmd_tx: mpsc::Sender<ListenCommand>,
    pool: Pool,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Hub")
            .field("channels", &state.channels.len())
            .field("patterns", &state.patterns.len())
            .finish()
    }
}

impl Hub {
    /// Builds the hub; the returned receiver feeds
    /// [`spawn_hub_listener`].
    pub fn new(pool: Pool) -> (Arc<Self>, mpsc::Receiver<ListenCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        (
            Arc::new(Self {
                state: Mutex::new(HubState::default()),
                cmd_tx,
                pool,
            }),
            cmd_rx,
        )
    }

    /// Number of channels + patterns a session holds; nonzero means the
    /// session is in subscription mode.
    pub fn subscription_count(&self, session_id: u64) -> i64 {
        self.state.lock().unwrap().subscription_count(session_id)
    }

    /// SUBSCRIBE: one reply frame per channel.
    pub fn subscribe(&self, handle: &Arc<SessionHandle>, channels: &[Bytes]) -> Vec<RespValue> {
        let mut frames = Vec::with_capacity(channels.len());
        let mut to_listen = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for channel in channels {
                let subscribers = state.channels.entry(channel.clone()).or_default();
                let first = subscribers.is_empty();
                subscribers.insert(handle.id, Arc::clone(handle));
                state
                    .session_channels
                    .entry(handle.id)
                    .or_default()
                    .insert(channel.clone());

                if first {
                    let db = db_channel(channel);
                    if state.listening.insert(db.name.clone()) {
                        to_listen.push(db.name);
                    }
                }

                frames.push(RespValue::Push(vec![
                    RespValue::bulk(&b"subscribe"[..]),
                    RespValue::Bulk(channel.clone()),
                    RespValue::Integer(state.subscription_count(handle.id)),
                ]));
            }
        }
        for name in to_listen {
            self.enqueue(ListenCommand::Listen(name));
        }
        frames
    }

    /// UNSUBSCRIBE: no channels means all of them. One frame per channel
    /// (or a single nil-channel frame when there was nothing to leave).
    pub fn unsubscribe(
        &self,
        handle: &Arc<SessionHandle>,
        channels: Option<&[Bytes]>,
    ) -> Vec<RespValue> {
        let mut frames = Vec::new();
        let mut to_unlisten = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let targets: Vec<Bytes> = match channels {
                Some(list) => list.to_vec(),
                None => state
                    .session_channels
                    .get(&handle.id)
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default(),
            };

            for channel in &targets {
                let emptied = if let Some(subscribers) = state.channels.get_mut(channel) {
                    subscribers.remove(&handle.id);
                    subscribers.is_empty()
                } else {
                    false
                };
                if emptied {
                    state.channels.remove(channel);
                    let db = db_channel(channel);
                    if state.listening.remove(&db.name) {
                        to_unlisten.push(db.name);
                    }
                }
                if let Some(set) = state.session_channels.get_mut(&handle.id) {
                    set.remove(channel);
                }

                frames.push(RespValue::Push(vec![
                    RespValue::bulk(&b"unsubscribe"[..]),
                    RespValue::Bulk(channel.clone()),
                    RespValue::Integer(state.subscription_count(handle.id)),
                ]));
            }

            if frames.is_empty() {
                frames.push(RespValue::Push(vec![
                    RespValue::bulk(&b"unsubscribe"[..]),
                    RespValue::Null,
                    RespValue::Integer(state.subscription_count(handle.id)),
                ]));
            }
        }
        for name in to_unlisten {
            self.enqueue(ListenCommand::Unlisten(name));
        }
        frames
    }

    /// PSUBSCRIBE: patterns are matched in-process, so no LISTEN traffic.
    pub fn psubscribe(&self, handle: &Arc<SessionHandle>, patterns: &[Bytes]) -> Vec<RespValue> {
        let mut state = self.state.lock().unwrap();
        patterns
            .iter()
            .map(|pattern| {
                state
                    .patterns
                    .entry(pattern.clone())
                    .or_default()
                    .insert(handle.id, Arc::clone(handle));
                state
                    .session_patterns
                    .entry(handle.id)
                    .or_default()
                    .insert(pattern.clone());
                RespValue::Push(vec![
                    RespValue::bulk(&b"psubscribe"[..]),
                    RespValue::Bulk(pattern.clone()),
                    RespValue::Integer(state.subscription_count(handle.id)),
                ])
            })
            .collect()
    }

    /// PUNSUBSCRIBE: symmetric with [`Hub::unsubscribe`].
    pub fn punsubscribe(
        &self,
        handle: &Arc<SessionHandle>,
        patterns: Option<&[Bytes]>,
    ) -> Vec<RespValue> {
        let mut state = self.state.lock().unwrap();
        let targets: Vec<Bytes> = match patterns {
            Some(list) => list.to_vec(),
            None => state
                .session_patterns
                .get(&handle.id)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default(),
        };

        let mut frames: Vec<RespValue> = targets
            .iter()
            .map(|pattern| {
                if let Some(subscribers) = state.patterns.get_mut(pattern) {
                    subscribers.remove(&handle.id);
                    if subscribers.is_empty() {
                        state.patterns.remove(pattern);
                    }
                }
                if let Some(set) = state.session_patterns.get_mut(&handle.id) {
                    set.remove(pattern);
                }
                RespValue::Push(vec![
                    RespValue::bulk(&b"punsubscribe"[..]),
                    RespValue::Bulk(pattern.clone()),
                    RespValue::Integer(state.subscription_count(handle.id)),
                ])
            })
            .collect();

        if frames.is_empty() {
            frames.push(RespValue::Push(vec![
                RespValue::bulk(&b"punsubscribe"[..]),
                RespValue::Null,
                RespValue::Integer(state.subscription_count(handle.id)),
            ]));
        }
        frames
    }

    /// PUBLISH: NOTIFY the database and report how many local sessions
    /// will receive the message once it loops back through the listener.
    pub async fn publish(&self, channel: &[u8], message: &[u8]) -> Result<i64, StorageError> {
        let receivers = {
            let state = self.state.lock().unwrap();
            let direct = state
                .channels
                .get(channel)
                .map(|subs| subs.len() as i64)
                .unwrap_or(0);
            let patterned: i64 = state
                .patterns
                .iter()
                .filter(|(pattern, _)| glob_match(pattern, channel))
                .map(|(_, subs)| subs.len() as i64)
                .sum();
            direct + patterned
        };

        let db = db_channel(channel);
        let payload = publish_payload(channel, message, db.hashed);
        let client = self.pool.get().await?;
        client
            .execute("SELECT pg_notify($1, $2)", &[&db.name, &payload])
            .await?;
        Ok(receivers)
    }

    /// PUBSUB CHANNELS.
    pub fn channels(&self, pattern: Option<&[u8]>) -> Vec<Bytes> {
        let state = self.state.lock().unwrap();
        state
            .channels
            .keys()
            .filter(|ch| pattern.map(|p| glob_match(p, ch)).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// PUBSUB NUMSUB.
    pub fn numsub(&self, channels: &[Bytes]) -> Vec<(Bytes, i64)> {
        let state = self.state.lock().unwrap();
        channels
            .iter()
            .map(|ch| {
                let count = state.channels.get(ch).map(|s| s.len() as i64).unwrap_or(0);
                (ch.clone(), count)
            })
            .collect()
    }

    /// PUBSUB NUMPAT.
    pub fn numpat(&self) -> i64 {
        self.state.lock().unwrap().patterns.len() as i64
    }

    /// Removes a closing session everywhere and UNLISTENs channels it was
    /// the last subscriber of. Called from session teardown.
    pub fn session_closed(&self, session_id: u64) {
        let mut to_unlisten = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let channels = state.session_channels.remove(&session_id).unwrap_or_default();
            for channel in channels {
                let emptied = if let Some(subscribers) = state.channels.get_mut(&channel) {
                    subscribers.remove(&session_id);
                    subscribers.is_empty()
                } else {
                    false
                };
                if emptied {
                    state.channels.remove(&channel);
                    let db = db_channel(&channel);
                    if state.listening.remove(&db.name) {
                        to_unlisten.push(db.name);
                    }
                }
            }
            let patterns = state.session_patterns.remove(&session_id).unwrap_or_default();
            for pattern in patterns {
                if let Some(subscribers) = state.patterns.get_mut(&pattern) {
                    subscribers.remove(&session_id);
                    if subscribers.is_empty() {
                        state.patterns.remove(&pattern);
                    }
                }
            }
        }
        for name in to_unlisten {
            self.enqueue(ListenCommand::Unlisten(name));
        }
    }

    fn enqueue(&self, command: ListenCommand) {
        if let Err(e) = self.cmd_tx.try_send(command) {
            // Dropping the command leaves the LISTEN set stale until the
            // next reconnect re-syncs it; subscription state proceeds
            warn!(error = %e, "listener command queue full, dropping");
        }
    }

    /// Snapshot of database channels that must be LISTENed (used on
    /// listener (re)connect).
    fn listen_snapshot(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .listening
            .iter()
            .cloned()
            .collect()
    }

    /// Fans one delivery out to direct and pattern subscribers.
    async fn deliver(&self, pg_channel: &str, payload: &str) {
        let (original, message) = unwrap_payload(payload);
        let channel: Bytes =
            original.unwrap_or_else(|| Bytes::copy_from_slice(pg_channel.as_bytes()));

        // Snapshot targets under the lock, send outside it
        let (direct, patterned) = {
            let state = self.state.lock().unwrap();
            let direct: Vec<Arc<SessionHandle>> = state
                .channels
                .get(&channel)
                .map(|subs| subs.values().cloned().collect())
                .unwrap_or_default();
            let patterned: Vec<(Bytes, Arc<SessionHandle>)> = state
                .patterns
                .iter()
                .filter(|(pattern, _)| glob_match(pattern, &channel))
                .flat_map(|(pattern, subs)| {
                    subs.values()
                        .map(|handle| (pattern.clone(), Arc::clone(handle)))
                })
                .collect();
            (direct, patterned)
        };

        for handle in direct {
            let frame = RespValue::Push(vec![
                RespValue::bulk(&b"message"[..]),
                RespValue::Bulk(channel.clone()),
                RespValue::Bulk(message.clone()),
            ]);
            if let Err(e) = handle.send(&frame).await {
                debug!(session = handle.id, error = %e, "pub/sub delivery failed");
            }
        }
        for (pattern, handle) in patterned {
            let frame = RespValue::Push(vec![
                RespValue::bulk(&b"pmessage"[..]),
                RespValue::Bulk(pattern),
                RespValue::Bulk(channel.clone()),
                RespValue::Bulk(message.clone()),
            ]);
            if let Err(e) = handle.send(&frame).await {
                debug!(session = handle.id, error = %e, "pub/sub delivery failed");
            }
        }
    }
}

/// Spawns the hub's listener task.
pub fn spawn_hub_listener(
    hub: Arc<Hub>,
    cmd_rx: mpsc::Receiver<ListenCommand>,
    pg_config: tokio_postgres::Config,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(listener_loop(hub, cmd_rx, pg_config, shutdown_rx))
}

async fn listener_loop(
    hub: Arc<Hub>,
    mut cmd_rx: mpsc::Receiver<ListenCommand>,
    pg_config: tokio_postgres::Config,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        match run_session(&hub, &mut cmd_rx, &pg_config, &mut shutdown_rx).await {
            SessionEnd::Shutdown => {
                debug!("pub/sub listener stopped");
                return;
            }
            SessionEnd::ConnectionLost => {
                backoff = BACKOFF_INITIAL;
                warn!("pub/sub listener lost its connection, reconnecting");
            }
            SessionEnd::Failed(e) => {
                warn!(error = %e, backoff_ms = backoff.as_millis() as u64,
                      "pub/sub listener reconnecting");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => return,
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

enum SessionEnd {
    Shutdown,
    ConnectionLost,
    Failed(tokio_postgres::Error),
}

async fn run_session(
    hub: &Arc<Hub>,
    cmd_rx: &mut mpsc::Receiver<ListenCommand>,
    pg_config: &tokio_postgres::Config,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (client, mut notifications) = match connect_listener(pg_config).await {
        Ok(pair) => pair,
        Err(e) => return SessionEnd::Failed(e),
    };

    // Re-sync the LISTEN set: everything subscribers currently need
    for name in hub.listen_snapshot() {
        if let Err(e) = client
            .batch_execute(&format!("LISTEN {}", quote_channel(&name)))
            .await
        {
            return SessionEnd::Failed(e);
        }
    }
    info!("pub/sub listener connected");

    let mut idle_wait = IDLE_WAIT_MIN;
    loop {
        // Drain queued LISTEN/UNLISTEN work before each wait
        while let Ok(command) = cmd_rx.try_recv() {
            let sql = match &command {
                ListenCommand::Listen(name) => format!("LISTEN {}", quote_channel(name)),
                ListenCommand::Unlisten(name) => format!("UNLISTEN {}", quote_channel(name)),
            };
            if let Err(e) = client.batch_execute(&sql).await {
                return SessionEnd::Failed(e);
            }
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return SessionEnd::Shutdown;
                }
            }
            result = tokio::time::timeout(idle_wait, notifications.recv()) => {
                match result {
                    Err(_) => {
                        // Idle: back off the poll, bounded
                        idle_wait = (idle_wait * 2).min(IDLE_WAIT_MAX);
                    }
                    Ok(Some(notification)) => {
                        idle_wait = IDLE_WAIT_MIN;
                        hub.deliver(notification.channel(), notification.payload()).await;
                    }
                    Ok(None) => return SessionEnd::ConnectionLost,
                }
            }
        }
    }
}
