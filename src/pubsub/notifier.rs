//! Blocking-List Notifier
//!
//! Wakes sessions blocked in BRPOP/BLPOP when another connection pushes
//! onto the list they are watching. Push operations NOTIFY the key's
//! keyspace channel from inside their SQL transaction, so the database
//! delivers the wakeup only for committed pushes; an aborted push wakes
//! nobody.
//!
//! A session registers a waiter for its keys, which LISTENs the matching
//! keyspace channels on the notifier's dedicated connection. Wakeups are
//! delivered with a non-blocking send; a hash-collided or stale wakeup is
//! harmless because the blocked command re-checks the list under a
//! transaction before replying.

use crate::pubsub::names::keyspace_channel;
use crate::pubsub::{connect_listener, quote_channel};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reconnect backoff bounds.
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// LISTEN/UNLISTEN queue depth.
const COMMAND_QUEUE_DEPTH: usize = 1024;

#[derive(Debug)]
pub enum ListenCommand {
    Listen(String),
    Unlisten(String),
}

#[derive(Default)]
struct NotifierState {
    /// keyspace channel -> waiters keyed by waiter id
    waiters: HashMap<String, HashMap<u64, mpsc::Sender<()>>>,
    next_waiter_id: u64,
}

/// The process-wide blocking-list notifier.
pub struct ListNotifier {
    state: Mutex<NotifierState>,
    cmd_tx: mpsc::Sender<ListenCommand>,
}

impl std::fmt::Debug for ListNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("ListNotifier")
            .field("channels", &state.waiters.len())
            .finish()
    }
}

/// A registered wait on one or more keys. Unregisters on drop.
pub struct KeyWait {
    notifier: Arc<ListNotifier>,
    id: u64,
    channels: Vec<String>,
    rx: mpsc::Receiver<()>,
}

impl KeyWait {
    /// Waits for a push wakeup. Returns `false` if the notifier went away.
    pub async fn notified(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

impl Drop for KeyWait {
    fn drop(&mut self) {
        self.notifier.unregister(self.id, &self.channels);
    }
}

impl ListNotifier {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<ListenCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        (
            Arc::new(Self {
                state: Mutex::new(NotifierState::default()),
                cmd_tx,
            }),
            cmd_rx,
        )
    }

    /// Registers a waiter for every key in the list; call *before* the
    /// final empty-check so a push between check and wait still wakes us.
    pub fn register(self: &Arc<Self>, keys: &[Bytes]) -> KeyWait {
        let (tx, rx) = mpsc::channel(1);
        let channels: Vec<String> = keys.iter().map(|k| keyspace_channel(k)).collect();

        let mut to_listen = Vec::new();
        let id = {
            let mut state = self.state.lock().unwrap();
            state.next_waiter_id += 1;
            let id = state.next_waiter_id;
            for channel in &channels {
                let waiters = state.waiters.entry(channel.clone()).or_default();
                if waiters.is_empty() {
                    to_listen.push(channel.clone());
                }
                waiters.insert(id, tx.clone());
            }
            id
        };
        for channel in to_listen {
            self.enqueue(ListenCommand::Listen(channel));
        }

        KeyWait {
            notifier: Arc::clone(self),
            id,
            channels,
            rx,
        }
    }

    fn unregister(&self, id: u64, channels: &[String]) {
        let mut to_unlisten = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for channel in channels {
                if let Some(waiters) = state.waiters.get_mut(channel) {
                    waiters.remove(&id);
                    if waiters.is_empty() {
                        state.waiters.remove(channel);
                        to_unlisten.push(channel.clone());
                    }
                }
            }
        }
        for channel in to_unlisten {
            self.enqueue(ListenCommand::Unlisten(channel));
        }
    }

    /// Signals every waiter on the channel. Non-blocking sends: a waiter
    /// that already has a pending wakeup needs no second one.
    fn signal(&self, channel: &str) {
        let state = self.state.lock().unwrap();
        if let Some(waiters) = state.waiters.get(channel) {
            for tx in waiters.values() {
                let _ = tx.try_send(());
            }
        }
    }

    fn enqueue(&self, command: ListenCommand) {
        if let Err(e) = self.cmd_tx.try_send(command) {
            warn!(error = %e, "notifier command queue full, dropping");
        }
    }

    fn listen_snapshot(&self) -> Vec<String> {
        self.state.lock().unwrap().waiters.keys().cloned().collect()
    }
}

/// Spawns the notifier's listener task.
pub fn spawn_notifier_listener(
    notifier: Arc<ListNotifier>,
    cmd_rx: mpsc::Receiver<ListenCommand>,
    pg_config: tokio_postgres::Config,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(listener_loop(notifier, cmd_rx, pg_config, shutdown_rx))
}

async fn listener_loop(
    notifier: Arc<ListNotifier>,
    mut cmd_rx: mpsc::Receiver<ListenCommand>,
    pg_config: tokio_postgres::Config,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        match run_session(&notifier, &mut cmd_rx, &pg_config, &mut shutdown_rx).await {
            SessionEnd::Shutdown => {
                debug!("block-list notifier stopped");
                return;
            }
            SessionEnd::ConnectionLost => {
                backoff = BACKOFF_INITIAL;
                warn!("block-list notifier lost its connection, reconnecting");
            }
            SessionEnd::Failed(e) => {
                warn!(error = %e, backoff_ms = backoff.as_millis() as u64,
                      "block-list notifier reconnecting");
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
    notifier: &Arc<ListNotifier>,
    cmd_rx: &mut mpsc::Receiver<ListenCommand>,
    pg_config: &tokio_postgres::Config,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (client, mut notifications) = match connect_listener(pg_config).await {
        Ok(pair) => pair,
        Err(e) => return SessionEnd::Failed(e),
    };

    // Re-LISTEN every channel with live waiters
    for channel in notifier.listen_snapshot() {
        if let Err(e) = client
            .batch_execute(&format!("LISTEN {}", quote_channel(&channel)))
            .await
        {
            return SessionEnd::Failed(e);
        }
    }
    info!("block-list notifier connected");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return SessionEnd::Shutdown;
                }
            }
            // LISTEN registration must be prompt: a blocked session is
            // waiting on it
            command = cmd_rx.recv() => {
                let Some(command) = command else {
                    return SessionEnd::Shutdown;
                };
                let sql = match &command {
                    ListenCommand::Listen(name) => format!("LISTEN {}", quote_channel(name)),
                    ListenCommand::Unlisten(name) => format!("UNLISTEN {}", quote_channel(name)),
                };
                if let Err(e) = client.batch_execute(&sql).await {
                    return SessionEnd::Failed(e);
                }
            }
            result = notifications.recv() => {
                match result {
                    Some(notification) => notifier.signal(notification.channel()),
                    None => return SessionEnd::ConnectionLost,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_signal_wakes() {
        let (notifier, _cmd_rx) = ListNotifier::new();
        let mut wait = notifier.register(&[Bytes::from("queue")]);
        notifier.signal(&keyspace_channel(b"queue"));
        assert!(wait.notified().await);
    }

    #[tokio::test]
    async fn test_signal_other_key_does_not_wake() {
        let (notifier, _cmd_rx) = ListNotifier::new();
        let mut wait = notifier.register(&[Bytes::from("queue")]);
        notifier.signal(&keyspace_channel(b"other"));
        let woke = tokio::time::timeout(Duration::from_millis(50), wait.notified()).await;
        assert!(woke.is_err());
    }

    #[tokio::test]
    async fn test_unregister_on_drop_unlistens() {
        let (notifier, mut cmd_rx) = ListNotifier::new();
        {
            let _wait = notifier.register(&[Bytes::from("queue")]);
            match cmd_rx.recv().await {
                Some(ListenCommand::Listen(ch)) => {
                    assert_eq!(ch, keyspace_channel(b"queue"));
                }
                other => panic!("expected Listen, got {:?}", other),
            }
        }
        match cmd_rx.recv().await {
            Some(ListenCommand::Unlisten(ch)) => {
                assert_eq!(ch, keyspace_channel(b"queue"));
            }
            other => panic!("expected Unlisten, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_waiters_all_wake() {
        let (notifier, _cmd_rx) = ListNotifier::new();
        let mut one = notifier.register(&[Bytes::from("q")]);
        let mut two = notifier.register(&[Bytes::from("q")]);
        notifier.signal(&keyspace_channel(b"q"));
        assert!(one.notified().await);
        assert!(two.notified().await);
    }
}
