//! Command Table
//!
//! The descriptor for every command the server accepts: arity bounds
//! (argument count, command name excluded; `None` max means variadic) and
//! the flags the dispatcher gates on. Kept as a sorted static slice with a
//! binary-search lookup.

/// Behavior flags consulted by the dispatcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandFlags {
    /// Mutates storage: runs in a transaction, invalidates the cache, and
    /// trips the EXEC conservative flush.
    pub write: bool,
    /// Allowed before AUTH when a password is configured.
    pub pre_auth: bool,
    /// Allowed while the session holds subscriptions.
    pub in_subscribe: bool,
    /// Handled by the session/dispatcher itself, never queued by MULTI.
    pub no_multi: bool,
}

/// One command descriptor.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: Option<usize>,
    pub flags: CommandFlags,
}

const fn flags(write: bool, pre_auth: bool, in_subscribe: bool, no_multi: bool) -> CommandFlags {
    CommandFlags {
        write,
        pre_auth,
        in_subscribe,
        no_multi,
    }
}

const RO: CommandFlags = flags(false, false, false, false);
const RW: CommandFlags = flags(true, false, false, false);
/// Pre-auth allowed (connection handshake commands).
const HELLO_F: CommandFlags = flags(false, true, false, true);
/// Subscription-state commands: legal in subscription mode. They are not
/// MULTI-exempt; the queueing path rejects them explicitly so EXEC can
/// never flip a session into subscribe mode.
const PS: CommandFlags = flags(false, false, true, false);

/// Sorted by name; `lookup` binary-searches it.
static COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "APPEND", min_args: 2, max_args: Some(2), flags: RW },
    CommandSpec { name: "AUTH", min_args: 1, max_args: Some(2), flags: flags(false, true, false, true) },
    CommandSpec { name: "BITCOUNT", min_args: 1, max_args: Some(4), flags: RO },
    CommandSpec { name: "BITFIELD", min_args: 1, max_args: None, flags: RW },
    CommandSpec { name: "BITOP", min_args: 3, max_args: None, flags: RW },
    CommandSpec { name: "BITPOS", min_args: 2, max_args: Some(5), flags: RO },
    CommandSpec { name: "BLPOP", min_args: 2, max_args: None, flags: RW },
    CommandSpec { name: "BRPOP", min_args: 2, max_args: None, flags: RW },
    CommandSpec { name: "CLIENT", min_args: 1, max_args: None, flags: RO },
    CommandSpec { name: "COMMAND", min_args: 0, max_args: None, flags: flags(false, true, false, false) },
    CommandSpec { name: "COPY", min_args: 2, max_args: Some(3), flags: RW },
    CommandSpec { name: "DBSIZE", min_args: 0, max_args: Some(0), flags: RO },
    CommandSpec { name: "DECR", min_args: 1, max_args: Some(1), flags: RW },
    CommandSpec { name: "DECRBY", min_args: 2, max_args: Some(2), flags: RW },
    CommandSpec { name: "DEL", min_args: 1, max_args: None, flags: RW },
    CommandSpec { name: "DISCARD", min_args: 0, max_args: Some(0), flags: flags(false, false, false, true) },
    CommandSpec { name: "ECHO", min_args: 1, max_args: Some(1), flags: RO },
    CommandSpec { name: "EXEC", min_args: 0, max_args: Some(0), flags: flags(false, false, false, true) },
    CommandSpec { name: "EXISTS", min_args: 1, max_args: None, flags: RO },
    CommandSpec { name: "EXPIRE", min_args: 2, max_args: Some(2), flags: RW },
    CommandSpec { name: "EXPIREAT", min_args: 2, max_args: Some(2), flags: RW },
    CommandSpec { name: "FLUSHALL", min_args: 0, max_args: Some(1), flags: RW },
    CommandSpec { name: "FLUSHDB", min_args: 0, max_args: Some(1), flags: RW },
    CommandSpec { name: "GET", min_args: 1, max_args: Some(1), flags: RO },
    CommandSpec { name: "GETBIT", min_args: 2, max_args: Some(2), flags: RO },
    CommandSpec { name: "GETDEL", min_args: 1, max_args: Some(1), flags: RW },
    CommandSpec { name: "GETEX", min_args: 1, max_args: None, flags: RW },
    CommandSpec { name: "GETRANGE", min_args: 3, max_args: Some(3), flags: RO },
    CommandSpec { name: "GETSET", min_args: 2, max_args: Some(2), flags: RW },
    CommandSpec { name: "HDEL", min_args: 2, max_args: None, flags: RW },
    CommandSpec { name: "HELLO", min_args: 0, max_args: None, flags: HELLO_F },
    CommandSpec { name: "HEXISTS", min_args: 2, max_args: Some(2), flags: RO },
    CommandSpec { name: "HGET", min_args: 2, max_args: Some(2), flags: RO },
    CommandSpec { name: "HGETALL", min_args: 1, max_args: Some(1), flags: RO },
    CommandSpec { name: "HINCRBY", min_args: 3, max_args: Some(3), flags: RW },
    CommandSpec { name: "HINCRBYFLOAT", min_args: 3, max_args: Some(3), flags: RW },
    CommandSpec { name: "HKEYS", min_args: 1, max_args: Some(1), flags: RO },
    CommandSpec { name: "HLEN", min_args: 1, max_args: Some(1), flags: RO },
    CommandSpec { name: "HMGET", min_args: 2, max_args: None, flags: RO },
    CommandSpec { name: "HMSET", min_args: 3, max_args: None, flags: RW },
    CommandSpec { name: "HSCAN", min_args: 2, max_args: Some(6), flags: RO },
    CommandSpec { name: "HSET", min_args: 3, max_args: None, flags: RW },
    CommandSpec { name: "HSETNX", min_args: 3, max_args: Some(3), flags: RW },
    CommandSpec { name: "HSTRLEN", min_args: 2, max_args: Some(2), flags: RO },
    CommandSpec { name: "HVALS", min_args: 1, max_args: Some(1), flags: RO },
    CommandSpec { name: "INCR", min_args: 1, max_args: Some(1), flags: RW },
    CommandSpec { name: "INCRBY", min_args: 2, max_args: Some(2), flags: RW },
    CommandSpec { name: "INCRBYFLOAT", min_args: 2, max_args: Some(2), flags: RW },
    CommandSpec { name: "INFO", min_args: 0, max_args: None, flags: RO },
    CommandSpec { name: "KEYS", min_args: 1, max_args: Some(1), flags: RO },
    CommandSpec { name: "LINDEX", min_args: 2, max_args: Some(2), flags: RO },
    CommandSpec { name: "LINSERT", min_args: 4, max_args: Some(4), flags: RW },
    CommandSpec { name: "LLEN", min_args: 1, max_args: Some(1), flags: RO },
    CommandSpec { name: "LPOP", min_args: 1, max_args: Some(2), flags: RW },
    CommandSpec { name: "LPOS", min_args: 2, max_args: None, flags: RO },
    CommandSpec { name: "LPUSH", min_args: 2, max_args: None, flags: RW },
    CommandSpec { name: "LPUSHX", min_args: 2, max_args: None, flags: RW },
    CommandSpec { name: "LRANGE", min_args: 3, max_args: Some(3), flags: RO },
    CommandSpec { name: "LREM", min_args: 3, max_args: Some(3), flags: RW },
    CommandSpec { name: "LSET", min_args: 3, max_args: Some(3), flags: RW },
    CommandSpec { name: "LTRIM", min_args: 3, max_args: Some(3), flags: RW },
    CommandSpec { name: "MGET", min_args: 1, max_args: None, flags: RO },
    CommandSpec { name: "MSET", min_args: 2, max_args: None, flags: RW },
    CommandSpec { name: "MULTI", min_args: 0, max_args: Some(0), flags: flags(false, false, false, true) },
    CommandSpec { name: "PERSIST", min_args: 1, max_args: Some(1), flags: RW },
    CommandSpec { name: "PEXPIRE", min_args: 2, max_args: Some(2), flags: RW },
    CommandSpec { name: "PEXPIREAT", min_args: 2, max_args: Some(2), flags: RW },
    CommandSpec { name: "PFADD", min_args: 1, max_args: None, flags: RW },
    CommandSpec { name: "PFCOUNT", min_args: 1, max_args: None, flags: RO },
    CommandSpec { name: "PFMERGE", min_args: 1, max_args: None, flags: RW },
    CommandSpec { name: "PING", min_args: 0, max_args: Some(1), flags: flags(false, true, true, false) },
    CommandSpec { name: "PSUBSCRIBE", min_args: 1, max_args: None, flags: PS },
    CommandSpec { name: "PTTL", min_args: 1, max_args: Some(1), flags: RO },
    CommandSpec { name: "PUBLISH", min_args: 2, max_args: Some(2), flags: RO },
    CommandSpec { name: "PUBSUB", min_args: 1, max_args: None, flags: RO },
    CommandSpec { name: "PUNSUBSCRIBE", min_args: 0, max_args: None, flags: PS },
    CommandSpec { name: "QUIT", min_args: 0, max_args: Some(0), flags: flags(false, true, true, true) },
    CommandSpec { name: "RANDOMKEY", min_args: 0, max_args: Some(0), flags: RO },
    CommandSpec { name: "RENAME", min_args: 2, max_args: Some(2), flags: RW },
    CommandSpec { name: "RENAMENX", min_args: 2, max_args: Some(2), flags: RW },
    CommandSpec { name: "RESET", min_args: 0, max_args: Some(0), flags: flags(false, false, true, true) },
    CommandSpec { name: "RPOP", min_args: 1, max_args: Some(2), flags: RW },
    CommandSpec { name: "RPOPLPUSH", min_args: 2, max_args: Some(2), flags: RW },
    CommandSpec { name: "RPUSH", min_args: 2, max_args: None, flags: RW },
    CommandSpec { name: "RPUSHX", min_args: 2, max_args: None, flags: RW },
    CommandSpec { name: "SADD", min_args: 2, max_args: None, flags: RW },
    CommandSpec { name: "SCAN", min_args: 1, max_args: Some(5), flags: RO },
    CommandSpec { name: "SCARD", min_args: 1, max_args: Some(1), flags: RO },
    CommandSpec { name: "SDIFF", min_args: 1, max_args: None, flags: RO },
    CommandSpec { name: "SDIFFSTORE", min_args: 2, max_args: None, flags: RW },
    CommandSpec { name: "SELECT", min_args: 1, max_args: Some(1), flags: RO },
    CommandSpec { name: "SET", min_args: 2, max_args: None, flags: RW },
    CommandSpec { name: "SETBIT", min_args: 3, max_args: Some(3), flags: RW },
    CommandSpec { name: "SETEX", min_args: 3, max_args: Some(3), flags: RW },
    CommandSpec { name: "SETNX", min_args: 2, max_args: Some(2), flags: RW },
    CommandSpec { name: "SETRANGE", min_args: 3, max_args: Some(3), flags: RW },
    CommandSpec { name: "SINTER", min_args: 1, max_args: None, flags: RO },
    CommandSpec { name: "SINTERSTORE", min_args: 2, max_args: None, flags: RW },
    CommandSpec { name: "SISMEMBER", min_args: 2, max_args: Some(2), flags: RO },
    CommandSpec { name: "SMEMBERS", min_args: 1, max_args: Some(1), flags: RO },
    CommandSpec { name: "SMISMEMBER", min_args: 2, max_args: None, flags: RO },
    CommandSpec { name: "SMOVE", min_args: 3, max_args: Some(3), flags: RW },
    CommandSpec { name: "SPOP", min_args: 1, max_args: Some(2), flags: RW },
    CommandSpec { name: "SRANDMEMBER", min_args: 1, max_args: Some(2), flags: RO },
    CommandSpec { name: "SREM", min_args: 2, max_args: None, flags: RW },
    CommandSpec { name: "SSCAN", min_args: 2, max_args: Some(6), flags: RO },
    CommandSpec { name: "STRLEN", min_args: 1, max_args: Some(1), flags: RO },
    CommandSpec { name: "SUBSCRIBE", min_args: 1, max_args: None, flags: PS },
    CommandSpec { name: "SUBSTR", min_args: 3, max_args: Some(3), flags: RO },
    CommandSpec { name: "SUNION", min_args: 1, max_args: None, flags: RO },
    CommandSpec { name: "SUNIONSTORE", min_args: 2, max_args: None, flags: RW },
    CommandSpec { name: "TIME", min_args: 0, max_args: Some(0), flags: RO },
    CommandSpec { name: "TTL", min_args: 1, max_args: Some(1), flags: RO },
    CommandSpec { name: "TYPE", min_args: 1, max_args: Some(1), flags: RO },
    CommandSpec { name: "UNLINK", min_args: 1, max_args: None, flags: RW },
    CommandSpec { name: "UNSUBSCRIBE", min_args: 0, max_args: None, flags: PS },
    CommandSpec { name: "WATCH", min_args: 1, max_args: None, flags: flags(false, false, false, true) },
    CommandSpec { name: "ZADD", min_args: 3, max_args: None, flags: RW },
    CommandSpec { name: "ZCARD", min_args: 1, max_args: Some(1), flags: RO },
    CommandSpec { name: "ZCOUNT", min_args: 3, max_args: Some(3), flags: RO },
    CommandSpec { name: "ZINCRBY", min_args: 3, max_args: Some(3), flags: RW },
    CommandSpec { name: "ZINTERSTORE", min_args: 3, max_args: None, flags: RW },
    CommandSpec { name: "ZMSCORE", min_args: 2, max_args: None, flags: RO },
    CommandSpec { name: "ZPOPMAX", min_args: 1, max_args: Some(2), flags: RW },
    CommandSpec { name: "ZPOPMIN", min_args: 1, max_args: Some(2), flags: RW },
    CommandSpec { name: "ZRANGE", min_args: 3, max_args: None, flags: RO },
    CommandSpec { name: "ZRANGEBYSCORE", min_args: 3, max_args: None, flags: RO },
    CommandSpec { name: "ZRANK", min_args: 2, max_args: Some(2), flags: RO },
    CommandSpec { name: "ZREM", min_args: 2, max_args: None, flags: RW },
    CommandSpec { name: "ZREMRANGEBYRANK", min_args: 3, max_args: Some(3), flags: RW },
    CommandSpec { name: "ZREMRANGEBYSCORE", min_args: 3, max_args: Some(3), flags: RW },
    CommandSpec { name: "ZREVRANGE", min_args: 3, max_args: None, flags: RO },
    CommandSpec { name: "ZREVRANGEBYSCORE", min_args: 3, max_args: None, flags: RO },
    CommandSpec { name: "ZREVRANK", min_args: 2, max_args: Some(2), flags: RO },
    CommandSpec { name: "ZSCAN", min_args: 2, max_args: Some(6), flags: RO },
    CommandSpec { name: "ZSCORE", min_args: 2, max_args: Some(2), flags: RO },
    CommandSpec { name: "ZUNIONSTORE", min_args: 3, max_args: None, flags: RW },
];

/// Looks a command up by its upper-cased name.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS
        .binary_search_by(|spec| spec.name.cmp(name))
        .ok()
        .map(|i| &COMMANDS[i])
}

/// Total number of known commands (COMMAND COUNT).
pub fn command_count() -> usize {
    COMMANDS.len()
}

/// Iterates every descriptor (COMMAND).
pub fn all_commands() -> impl Iterator<Item = &'static CommandSpec> {
    COMMANDS.iter()
}

/// Checks an argument count against the spec's bounds.
pub fn arity_ok(spec: &CommandSpec, argc: usize) -> bool {
    argc >= spec.min_args && spec.max_args.map(|max| argc <= max).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_sorted() {
        for pair in COMMANDS.windows(2) {
            assert!(
                pair[0].name < pair[1].name,
                "table out of order at {}",
                pair[1].name
            );
        }
    }

    #[test]
    fn test_lookup_hits_and_misses() {
        assert!(lookup("GET").is_some());
        assert!(lookup("ZUNIONSTORE").is_some());
        assert!(lookup("NOPE").is_none());
        // Lookup is by upper-cased name only
        assert!(lookup("get").is_none());
    }

    #[test]
    fn test_arity_bounds() {
        let get = lookup("GET").unwrap();
        assert!(arity_ok(get, 1));
        assert!(!arity_ok(get, 0));
        assert!(!arity_ok(get, 2));

        let del = lookup("DEL").unwrap();
        assert!(arity_ok(del, 1));
        assert!(arity_ok(del, 30));
        assert!(!arity_ok(del, 0));
    }

    #[test]
    fn test_write_flags() {
        assert!(lookup("SET").unwrap().flags.write);
        assert!(lookup("FLUSHDB").unwrap().flags.write);
        assert!(!lookup("GET").unwrap().flags.write);
        assert!(!lookup("KEYS").unwrap().flags.write);
    }

    #[test]
    fn test_pre_auth_whitelist() {
        for name in ["AUTH", "PING", "QUIT", "HELLO", "COMMAND"] {
            assert!(lookup(name).unwrap().flags.pre_auth, "{name} must be pre-auth");
        }
        assert!(!lookup("GET").unwrap().flags.pre_auth);
    }

    #[test]
    fn test_subscribe_mode_whitelist() {
        for name in [
            "SUBSCRIBE",
            "UNSUBSCRIBE",
            "PSUBSCRIBE",
            "PUNSUBSCRIBE",
            "PING",
            "QUIT",
            "RESET",
        ] {
            assert!(
                lookup(name).unwrap().flags.in_subscribe,
                "{name} must be legal in subscribe mode"
            );
        }
        assert!(!lookup("GET").unwrap().flags.in_subscribe);
    }
}
