//! Command Dispatcher
//!
//! Receives one parsed command array per call and turns it into reply
//! frames. The pipeline:
//!
//! 1. name extraction and table lookup ([`crate::commands::table`]),
//! 2. arity validation,
//! 3. the AUTH gate (only a handshake whitelist runs before AUTH),
//! 4. the subscription-mode gate,
//! 5. MULTI queueing (queue-time validation, `QUEUED` replies, dirty
//!    flag on bad commands, EXECABORT on a dirty EXEC),
//! 6. dispatch: session commands handled here, data commands through
//!    [`crate::commands::data`], pub/sub through the hub, blocking list
//!    reads through the notifier.
//!
//! Errors never escape as faults: every failure becomes a RESP error
//! reply and the session keeps running.

use crate::cache::{CacheLayer, WriteEffect};
use crate::commands::data;
use crate::commands::table::{arity_ok, lookup, CommandSpec};
use crate::protocol::{RespValue, RespVersion};
use crate::pubsub::hub::Hub;
use crate::pubsub::notifier::ListNotifier;
use crate::server::session::Session;
use crate::server::ServerStats;
use crate::storage::lists::Side;
use crate::storage::{lists, Store, StorageError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, trace};

/// Re-check period for blocked list reads; bounds the window between a
/// waiter registering and its LISTEN becoming active.
const BLOCKING_RECHECK: Duration = Duration::from_secs(1);

/// Everything the dispatcher needs, shared by every session.
pub struct ServerContext {
    pub store: Store,
    pub cache: CacheLayer,
    pub hub: Arc<Hub>,
    pub notifier: Arc<ListNotifier>,
    pub auth_password: Option<String>,
    pub start_time: Instant,
    pub stats: Arc<ServerStats>,
}

/// What one command produced: frames to write, and whether to close.
#[derive(Debug)]
pub struct Outcome {
    pub replies: Vec<RespValue>,
    pub close: bool,
}

impl Outcome {
    fn reply(value: RespValue) -> Self {
        Self {
            replies: vec![value],
            close: false,
        }
    }

    fn replies(values: Vec<RespValue>) -> Self {
        Self {
            replies: values,
            close: false,
        }
    }

    fn quit(value: RespValue) -> Self {
        Self {
            replies: vec![value],
            close: true,
        }
    }
}

/// The per-process command handler; cheap to clone per session.
#[derive(Clone)]
pub struct CommandHandler {
    ctx: Arc<ServerContext>,
}

impl CommandHandler {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Executes one client command array.
    pub async fn execute(&self, session: &mut Session, frame: RespValue) -> Outcome {
        let args = match extract_args(frame) {
            Ok(args) => args,
            Err(reply) => return Outcome::reply(reply),
        };
        if args.is_empty() {
            return Outcome::reply(RespValue::error("ERR empty command"));
        }

        let name = match std::str::from_utf8(&args[0]) {
            Ok(s) => s.to_uppercase(),
            Err(_) => return Outcome::reply(RespValue::error("ERR invalid command name")),
        };
        let args = &args[1..];
        self.ctx.stats.command_processed();
        trace!(command = %name, argc = args.len(), "dispatch");

        let spec = lookup(&name);

        // MULTI queueing: anything not exempted gets validated and queued
        if session.in_transaction() {
            let exempt = spec.map(|s| s.flags.no_multi).unwrap_or(false);
            if !exempt {
                return self.queue_command(session, &name, args, spec);
            }
        }

        let Some(spec) = spec else {
            return Outcome::reply(RespValue::error(format!(
                "ERR unknown command '{}'",
                name.to_lowercase()
            )));
        };
        if !arity_ok(spec, args.len()) {
            return Outcome::reply(wrong_arity(&name));
        }

        // AUTH gate
        if self.ctx.auth_password.is_some() && !session.authenticated && !spec.flags.pre_auth {
            return Outcome::reply(RespValue::error("NOAUTH Authentication required."));
        }

        // Subscription-mode gate
        if self.ctx.hub.subscription_count(session.handle.id) > 0 && !spec.flags.in_subscribe {
            return Outcome::reply(RespValue::error(format!(
                "ERR Can't execute '{}': only (P)SUBSCRIBE / (P)UNSUBSCRIBE / \
                 PING / QUIT / RESET are allowed in this context",
                name.to_lowercase()
            )));
        }

        match name.as_str() {
            // Connection & session
            "PING" => self.cmd_ping(session, args),
            "ECHO" => Outcome::reply(RespValue::Bulk(args[0].clone())),
            "QUIT" => Outcome::quit(RespValue::ok()),
            "AUTH" => self.cmd_auth(session, args),
            "HELLO" => self.cmd_hello(session, args),
            "RESET" => self.cmd_reset(session),
            "SELECT" => self.cmd_select(args),
            "CLIENT" => self.cmd_client(session, args),
            "COMMAND" => self.cmd_command(args),
            "INFO" => self.cmd_info(),
            "TIME" => self.cmd_time(),

            // Transactions
            "MULTI" => self.cmd_multi(session),
            "EXEC" => self.cmd_exec(session).await,
            "DISCARD" => self.cmd_discard(session),
            "WATCH" => Outcome::reply(RespValue::error("ERR WATCH is not supported")),

            // Pub/sub
            "SUBSCRIBE" => {
                Outcome::replies(self.ctx.hub.subscribe(&session.handle, args))
            }
            "UNSUBSCRIBE" => {
                let channels = if args.is_empty() { None } else { Some(args) };
                Outcome::replies(self.ctx.hub.unsubscribe(&session.handle, channels))
            }
            "PSUBSCRIBE" => {
                Outcome::replies(self.ctx.hub.psubscribe(&session.handle, args))
            }
            "PUNSUBSCRIBE" => {
                let patterns = if args.is_empty() { None } else { Some(args) };
                Outcome::replies(self.ctx.hub.punsubscribe(&session.handle, patterns))
            }
            "PUBLISH" => match self.ctx.hub.publish(&args[0], &args[1]).await {
                Ok(count) => Outcome::reply(RespValue::Integer(count)),
                Err(e) => Outcome::reply(e.to_resp()),
            },
            "PUBSUB" => self.cmd_pubsub(args),

            // Blocking list reads
            "BLPOP" => self.blocking_pop(args, Side::Left).await,
            "BRPOP" => self.blocking_pop(args, Side::Right).await,

            // Everything else is a data command
            _ => self.execute_data(spec, &name, args).await,
        }
    }

    // ---- data path -----------------------------------------------------

    /// Runs a data command on the autocommit path: cache fast path for
    /// GET, a per-command transaction for writes, then invalidation.
    async fn execute_data(&self, spec: &CommandSpec, name: &str, args: &[Bytes]) -> Outcome {
        // String GET is the only cached read
        if name == "GET" {
            if let Some(value) = self.ctx.cache.lookup(&args[0]) {
                trace!("cache hit");
                return Outcome::reply(RespValue::Bulk(value));
            }
            return self.read_through_get(&args[0]).await;
        }

        let result = async {
            let mut client = self.ctx.store.client().await?;
            if spec.flags.write {
                let tx = tokio_postgres::Client::transaction(&mut client).await?;
                let reply = data::run(&tx, name, args).await?;
                tx.commit().await?;
                Ok(reply)
            } else {
                let client: &tokio_postgres::Client = &client;
                data::run(client, name, args).await
            }
        }
        .await;

        match result {
            Ok(reply) => {
                if spec.flags.write {
                    let effect = write_effect(name, args);
                    self.ctx.cache.record_write(&effect);
                    self.ctx.cache.invalidate(&effect).await;
                }
                Outcome::reply(reply)
            }
            // Write transactions roll back on drop; the session lives on
            Err(e) => Outcome::reply(e.to_resp()),
        }
    }

    /// GET with cache fill: fetch the value and its remaining TTL in one
    /// statement so the policy sees a real TTL.
    async fn read_through_get(&self, key: &Bytes) -> Outcome {
        let result = async {
            let client = self.ctx.store.client().await?;
            let client: &tokio_postgres::Client = &client;
            crate::storage::strings::get_with_ttl(client, key).await
        }
        .await;

        match result {
            Ok(Some((value, ttl_ms))) => {
                let remaining = ttl_ms.and_then(|ms| u64::try_from(ms).ok()).map(Duration::from_millis);
                self.ctx.cache.fill(key, &value, remaining);
                Outcome::reply(RespValue::Bulk(value))
            }
            Ok(None) => Outcome::reply(RespValue::Null),
            Err(e) => Outcome::reply(e.to_resp()),
        }
    }

    // ---- transactions --------------------------------------------------

    fn cmd_multi(&self, session: &mut Session) -> Outcome {
        if session.in_transaction() {
            return Outcome::reply(RespValue::error("ERR MULTI calls can not be nested"));
        }
        session.queued = Some(Vec::new());
        session.dirty = false;
        Outcome::reply(RespValue::ok())
    }

    fn cmd_discard(&self, session: &mut Session) -> Outcome {
        if !session.in_transaction() {
            return Outcome::reply(RespValue::error("ERR DISCARD without MULTI"));
        }
        session.discard_transaction();
        Outcome::reply(RespValue::ok())
    }

    /// Queue-time processing: validate, append, reply QUEUED. A bad
    /// command poisons the transaction (EXECABORT later).
    fn queue_command(
        &self,
        session: &mut Session,
        name: &str,
        args: &[Bytes],
        spec: Option<&'static CommandSpec>,
    ) -> Outcome {
        let Some(spec) = spec else {
            session.dirty = true;
            return Outcome::reply(RespValue::error(format!(
                "ERR unknown command '{}'",
                name.to_lowercase()
            )));
        };
        if !arity_ok(spec, args.len()) {
            session.dirty = true;
            return Outcome::reply(wrong_arity(name));
        }
        // Pub/sub and blocking-mode-changing commands cannot be queued
        if spec.flags.in_subscribe && name != "PING" {
            session.dirty = true;
            return Outcome::reply(RespValue::error(format!(
                "ERR {} is not allowed in transactions",
                name
            )));
        }

        let mut command = Vec::with_capacity(args.len() + 1);
        command.push(Bytes::from(name.to_string()));
        command.extend_from_slice(args);
        if let Some(queue) = session.queued.as_mut() {
            queue.push(command);
        }
        Outcome::reply(RespValue::simple_string("QUEUED"))
    }

    /// EXEC: replay the queue inside one SQL transaction. Per-command
    /// errors become error replies inside the result array; the
    /// transaction itself still commits (matching the "report, never
    /// retry" policy). A committed EXEC containing any writer flushes the
    /// cache conservatively.
    async fn cmd_exec(&self, session: &mut Session) -> Outcome {
        let Some(queued) = session.queued.take() else {
            return Outcome::reply(RespValue::error("ERR EXEC without MULTI"));
        };
        if session.dirty {
            session.dirty = false;
            return Outcome::reply(RespValue::error(
                "EXECABORT Transaction discarded because of previous errors.",
            ));
        }

        let mut any_writer = false;
        let result = async {
            let mut client = self.ctx.store.client().await?;
            let tx = tokio_postgres::Client::transaction(&mut client).await?;
            let mut replies = Vec::with_capacity(queued.len());
            for command in &queued {
                let name = String::from_utf8_lossy(&command[0]).to_uppercase();
                if let Some(spec) = lookup(&name) {
                    any_writer |= spec.flags.write;
                }
                // PUBLISH rides the notification bus, not the data tables
                let reply = if name == "PUBLISH" {
                    match self.ctx.hub.publish(&command[1], &command[2]).await {
                        Ok(count) => RespValue::Integer(count),
                        Err(e) => e.to_resp(),
                    }
                } else {
                    match data::run(&tx, &name, &command[1..]).await {
                        Ok(reply) => reply,
                        Err(e @ StorageError::Db(_)) => return Err(e),
                        Err(e) => e.to_resp(),
                    }
                };
                replies.push(reply);
            }
            tx.commit().await?;
            Ok(replies)
        }
        .await;

        match result {
            Ok(replies) => {
                if any_writer {
                    // Individual effects were not tracked inside the
                    // transaction; flush wholesale
                    self.ctx.cache.invalidate(&WriteEffect::Flush).await;
                }
                Outcome::reply(RespValue::Array(replies))
            }
            Err(e) => Outcome::reply(e.to_resp()),
        }
    }

    // ---- blocking list reads -------------------------------------------

    /// BLPOP / BRPOP: register a waiter first, then try, then wait, so a
    /// push landing between the try and the wait still wakes us. Spurious
    /// wakeups re-check under a fresh transaction and simply wait again.
    async fn blocking_pop(&self, args: &[Bytes], side: Side) -> Outcome {
        let keys = &args[..args.len() - 1];
        let timeout = match parse_timeout(&args[args.len() - 1]) {
            Ok(t) => t,
            Err(reply) => return Outcome::reply(reply),
        };
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let mut wait = self.ctx.notifier.register(keys);

            match self.try_pop_any(keys, side).await {
                Ok(Some((key, value))) => {
                    let effect = WriteEffect::Keys(vec![key.clone()]);
                    self.ctx.cache.record_write(&effect);
                    self.ctx.cache.invalidate(&effect).await;
                    return Outcome::reply(RespValue::Array(vec![
                        RespValue::Bulk(key),
                        RespValue::Bulk(value),
                    ]));
                }
                Ok(None) => {}
                Err(e) => return Outcome::reply(e.to_resp()),
            }

            let wait_for = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Outcome::reply(RespValue::NullArray);
                    }
                    (d - now).min(BLOCKING_RECHECK)
                }
                None => BLOCKING_RECHECK,
            };

            tokio::select! {
                woke = wait.notified() => {
                    if !woke {
                        // Notifier gone (shutdown); behave like a timeout
                        return Outcome::reply(RespValue::NullArray);
                    }
                    debug!("blocked pop woken by keyspace notification");
                }
                _ = sleep(wait_for) => {
                    if let Some(d) = deadline {
                        if Instant::now() >= d {
                            return Outcome::reply(RespValue::NullArray);
                        }
                    }
                }
            }
        }
    }

    /// One pop attempt across the key list, first hit wins.
    async fn try_pop_any(
        &self,
        keys: &[Bytes],
        side: Side,
    ) -> Result<Option<(Bytes, Bytes)>, StorageError> {
        let mut client = self.ctx.store.client().await?;
        for key in keys {
            let tx = tokio_postgres::Client::transaction(&mut client).await?;
            let mut popped = lists::pop(&tx, key, side, 1).await?;
            tx.commit().await?;
            if let Some(value) = popped.pop() {
                return Ok(Some((key.clone(), value)));
            }
        }
        Ok(None)
    }

    // ---- session commands ----------------------------------------------

    fn cmd_ping(&self, session: &Session, args: &[Bytes]) -> Outcome {
        let in_subscribe = self.ctx.hub.subscription_count(session.handle.id) > 0;
        if in_subscribe {
            // Subscribe mode replies with a pong push frame
            let payload = args.first().cloned().unwrap_or_default();
            return Outcome::reply(RespValue::Push(vec![
                RespValue::bulk(&b"pong"[..]),
                RespValue::Bulk(payload),
            ]));
        }
        match args.first() {
            Some(message) => Outcome::reply(RespValue::Bulk(message.clone())),
            None => Outcome::reply(RespValue::pong()),
        }
    }

    fn cmd_auth(&self, session: &mut Session, args: &[Bytes]) -> Outcome {
        let Some(expected) = self.ctx.auth_password.as_deref() else {
            return Outcome::reply(RespValue::error(
                "ERR Client sent AUTH, but no password is set. \
                 Did you mean AUTH <username> <password>?",
            ));
        };
        let (user, password) = match args {
            [password] => (&b"default"[..], &password[..]),
            [user, password] => (&user[..], &password[..]),
            _ => return Outcome::reply(wrong_arity("AUTH")),
        };
        if user == b"default" && password == expected.as_bytes() {
            session.authenticated = true;
            Outcome::reply(RespValue::ok())
        } else {
            Outcome::reply(RespValue::error(
                "WRONGPASS invalid username-password pair or user is disabled.",
            ))
        }
    }

    fn cmd_hello(&self, session: &mut Session, args: &[Bytes]) -> Outcome {
        let mut version = session.handle.version();
        let mut i = 0;
        if let Some(raw) = args.first() {
            let Some(requested) = std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(RespVersion::from_number)
            else {
                return Outcome::reply(RespValue::error(
                    "NOPROTO unsupported protocol version",
                ));
            };
            version = requested;
            i = 1;
        }

        while i < args.len() {
            match args[i].to_ascii_uppercase().as_slice() {
                b"AUTH" => {
                    let (Some(user), Some(password)) = (args.get(i + 1), args.get(i + 2)) else {
                        return Outcome::reply(RespValue::error("ERR syntax error in HELLO"));
                    };
                    let outcome = self.cmd_auth(session, &[user.clone(), password.clone()]);
                    if outcome.replies.iter().any(|r| r.is_error()) {
                        return outcome;
                    }
                    i += 3;
                }
                b"SETNAME" => {
                    let Some(name) = args.get(i + 1) else {
                        return Outcome::reply(RespValue::error("ERR syntax error in HELLO"));
                    };
                    session.name = Some(String::from_utf8_lossy(name).into_owned());
                    i += 2;
                }
                _ => return Outcome::reply(RespValue::error("ERR syntax error in HELLO")),
            }
        }

        if self.ctx.auth_password.is_some() && !session.authenticated {
            return Outcome::reply(RespValue::error("NOAUTH Authentication required."));
        }

        session.handle.set_version(version);
        Outcome::reply(RespValue::Map(vec![
            (
                RespValue::simple_string("server"),
                RespValue::simple_string("postkeys"),
            ),
            (
                RespValue::simple_string("version"),
                RespValue::simple_string(crate::VERSION),
            ),
            (
                RespValue::simple_string("proto"),
                RespValue::Integer(version.as_number()),
            ),
            (
                RespValue::simple_string("id"),
                RespValue::Integer(session.handle.id as i64),
            ),
            (
                RespValue::simple_string("mode"),
                RespValue::simple_string("standalone"),
            ),
            (
                RespValue::simple_string("role"),
                RespValue::simple_string("master"),
            ),
            (RespValue::simple_string("modules"), RespValue::Array(vec![])),
        ]))
    }

    fn cmd_reset(&self, session: &mut Session) -> Outcome {
        // Leave every subscription and drop transactional state
        self.ctx.hub.session_closed(session.handle.id);
        session.reset(self.ctx.auth_password.is_some());
        Outcome::reply(RespValue::simple_string("RESET"))
    }

    fn cmd_select(&self, args: &[Bytes]) -> Outcome {
        match &args[0][..] {
            b"0" => Outcome::reply(RespValue::ok()),
            _ => Outcome::reply(RespValue::error("ERR DB index is out of range")),
        }
    }

    fn cmd_client(&self, session: &mut Session, args: &[Bytes]) -> Outcome {
        let sub = args[0].to_ascii_uppercase();
        match sub.as_slice() {
            b"ID" => Outcome::reply(RespValue::Integer(session.handle.id as i64)),
            b"GETNAME" => match &session.name {
                Some(name) => Outcome::reply(RespValue::bulk_from_string(name.clone())),
                None => Outcome::reply(RespValue::Bulk(Bytes::new())),
            },
            b"SETNAME" => match args.get(1) {
                Some(name) => {
                    session.name = Some(String::from_utf8_lossy(name).into_owned());
                    Outcome::reply(RespValue::ok())
                }
                None => Outcome::reply(wrong_arity("CLIENT|SETNAME")),
            },
            b"SETINFO" => match (args.get(1), args.get(2)) {
                (Some(attr), Some(value)) => {
                    let joined = format!(
                        "{}={}",
                        String::from_utf8_lossy(attr),
                        String::from_utf8_lossy(value)
                    );
                    session.lib_info = Some(match session.lib_info.take() {
                        Some(prev) => format!("{prev} {joined}"),
                        None => joined,
                    });
                    Outcome::reply(RespValue::ok())
                }
                _ => Outcome::reply(wrong_arity("CLIENT|SETINFO")),
            },
            _ => Outcome::reply(RespValue::error(format!(
                "ERR Unknown CLIENT subcommand or wrong number of arguments for '{}'",
                String::from_utf8_lossy(&args[0])
            ))),
        }
    }

    fn cmd_command(&self, args: &[Bytes]) -> Outcome {
        match args.first().map(|a| a.to_ascii_uppercase()) {
            Some(sub) if sub == b"COUNT" => Outcome::reply(RespValue::Integer(
                crate::commands::table::command_count() as i64,
            )),
            Some(sub) if sub == b"DOCS" => Outcome::reply(RespValue::Map(vec![])),
            _ => {
                let entries = crate::commands::table::all_commands()
                    .map(|spec| {
                        // Redis arity counts the command name; negative
                        // means "at least"
                        let arity = match spec.max_args {
                            Some(max) if max == spec.min_args => spec.min_args as i64 + 1,
                            _ => -(spec.min_args as i64 + 1),
                        };
                        RespValue::Array(vec![
                            RespValue::bulk_from_string(spec.name.to_lowercase()),
                            RespValue::Integer(arity),
                        ])
                    })
                    .collect();
                Outcome::reply(RespValue::Array(entries))
            }
        }
    }

    fn cmd_info(&self) -> Outcome {
        let uptime = self.ctx.start_time.elapsed().as_secs();
        let stats = &self.ctx.stats;
        let mut info = String::new();
        info.push_str("# Server\r\n");
        info.push_str("server:postkeys\r\n");
        info.push_str(&format!("version:{}\r\n", crate::VERSION));
        info.push_str("mode:standalone\r\n");
        info.push_str(&format!("uptime_in_seconds:{uptime}\r\n"));
        info.push_str("\r\n# Clients\r\n");
        info.push_str(&format!(
            "connected_clients:{}\r\n",
            stats.active_connections()
        ));
        info.push_str("\r\n# Stats\r\n");
        info.push_str(&format!(
            "total_connections_received:{}\r\n",
            stats.connections_accepted()
        ));
        info.push_str(&format!(
            "total_commands_processed:{}\r\n",
            stats.commands_processed()
        ));
        if let Some(cache) = self.ctx.cache.cache() {
            let cache_stats = cache.stats();
            info.push_str("\r\n# Cache\r\n");
            info.push_str(&format!("cache_entries:{}\r\n", cache.size()));
            info.push_str(&format!(
                "cache_hits:{}\r\n",
                cache_stats.hits.load(std::sync::atomic::Ordering::Relaxed)
            ));
            info.push_str(&format!(
                "cache_misses:{}\r\n",
                cache_stats.misses.load(std::sync::atomic::Ordering::Relaxed)
            ));
        }
        Outcome::reply(RespValue::bulk_from_string(info))
    }

    fn cmd_time(&self) -> Outcome {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Outcome::reply(RespValue::Array(vec![
            RespValue::bulk_from_string(now.as_secs().to_string()),
            RespValue::bulk_from_string(now.subsec_micros().to_string()),
        ]))
    }

    fn cmd_pubsub(&self, args: &[Bytes]) -> Outcome {
        match args[0].to_ascii_uppercase().as_slice() {
            b"CHANNELS" => {
                let pattern = args.get(1).map(|p| &p[..]);
                let channels = self.ctx.hub.channels(pattern);
                Outcome::reply(RespValue::Array(
                    channels.into_iter().map(RespValue::Bulk).collect(),
                ))
            }
            b"NUMSUB" => {
                let mut flat = Vec::new();
                for (channel, count) in self.ctx.hub.numsub(&args[1..]) {
                    flat.push(RespValue::Bulk(channel));
                    flat.push(RespValue::Integer(count));
                }
                Outcome::reply(RespValue::Array(flat))
            }
            b"NUMPAT" => Outcome::reply(RespValue::Integer(self.ctx.hub.numpat())),
            _ => Outcome::reply(RespValue::error(format!(
                "ERR Unknown PUBSUB subcommand or wrong number of arguments for '{}'",
                String::from_utf8_lossy(&args[0])
            ))),
        }
    }
}

/// The keys a write command touches, for cache invalidation. Extra keys
/// are harmless (invalidation is idempotent); missing ones would be a
/// coherency bug.
fn write_effect(name: &str, args: &[Bytes]) -> WriteEffect {
    match name {
        "FLUSHDB" | "FLUSHALL" => WriteEffect::Flush,
        "DEL" | "UNLINK" => WriteEffect::Keys(args.to_vec()),
        "MSET" => WriteEffect::Keys(args.iter().step_by(2).cloned().collect()),
        "RENAME" | "RENAMENX" | "COPY" | "SMOVE" | "RPOPLPUSH" => {
            WriteEffect::Keys(args.iter().take(2).cloned().collect())
        }
        "BITOP" => WriteEffect::Keys(args.get(1).cloned().into_iter().collect()),
        "BLPOP" | "BRPOP" => WriteEffect::Keys(args[..args.len().saturating_sub(1)].to_vec()),
        _ => match args.first() {
            Some(key) => WriteEffect::Keys(vec![key.clone()]),
            None => WriteEffect::None,
        },
    }
}

/// Pulls the argument vector out of a parsed frame.
fn extract_args(frame: RespValue) -> Result<Vec<Bytes>, RespValue> {
    let RespValue::Array(items) = frame else {
        return Err(RespValue::error("ERR invalid command format"));
    };
    items
        .into_iter()
        .map(|item| match item {
            RespValue::Bulk(b) => Ok(b),
            RespValue::SimpleString(s) => Ok(Bytes::from(s)),
            _ => Err(RespValue::error("ERR invalid command format")),
        })
        .collect()
}

fn wrong_arity(name: &str) -> RespValue {
    RespValue::error(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_lowercase()
    ))
}

/// Blocking-timeout argument: float seconds, 0 means forever.
fn parse_timeout(raw: &Bytes) -> Result<Option<Duration>, RespValue> {
    let seconds: f64 = std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RespValue::error("ERR timeout is not a float or out of range"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(RespValue::error("ERR timeout is negative"));
    }
    if seconds == 0.0 {
        Ok(None)
    } else {
        Ok(Some(Duration::from_secs_f64(seconds)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_effect_shapes() {
        let k = |s: &str| Bytes::from(s.to_string());
        assert_eq!(write_effect("FLUSHDB", &[]), WriteEffect::Flush);
        assert_eq!(
            write_effect("SET", &[k("a"), k("v")]),
            WriteEffect::Keys(vec![k("a")])
        );
        assert_eq!(
            write_effect("MSET", &[k("a"), k("1"), k("b"), k("2")]),
            WriteEffect::Keys(vec![k("a"), k("b")])
        );
        assert_eq!(
            write_effect("RENAME", &[k("old"), k("new")]),
            WriteEffect::Keys(vec![k("old"), k("new")])
        );
        assert_eq!(
            write_effect("BLPOP", &[k("q1"), k("q2"), k("0")]),
            WriteEffect::Keys(vec![k("q1"), k("q2")])
        );
        assert_eq!(
            write_effect("BITOP", &[k("AND"), k("dest"), k("s1")]),
            WriteEffect::Keys(vec![k("dest")])
        );
    }

    #[test]
    fn test_extract_args() {
        let frame = RespValue::Array(vec![
            RespValue::bulk(&b"GET"[..]),
            RespValue::bulk(&b"key"[..]),
        ]);
        let args = extract_args(frame).unwrap();
        assert_eq!(args, vec![Bytes::from("GET"), Bytes::from("key")]);

        assert!(extract_args(RespValue::Integer(1)).is_err());
        assert!(extract_args(RespValue::Array(vec![RespValue::Integer(1)])).is_err());
    }

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout(&Bytes::from("0")).unwrap(), None);
        assert_eq!(
            parse_timeout(&Bytes::from("1.5")).unwrap(),
            Some(Duration::from_millis(1500))
        );
        assert!(parse_timeout(&Bytes::from("-1")).is_err());
        assert!(parse_timeout(&Bytes::from("abc")).is_err());
    }
}
