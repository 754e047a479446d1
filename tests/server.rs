//! Wire-level integration tests.
//!
//! These need a real PostgreSQL: set `POSTKEYS_TEST_DB` to a connection
//! string (e.g. `host=127.0.0.1 user=postgres dbname=postkeys_test`)
//! and run with `cargo test -- --ignored`. Each test talks RESP over a
//! plain TCP socket to an in-process server and uses its own key prefix
//! so tests can run concurrently against one database.

use bytes::BytesMut;
use postkeys::cache::{Cache, CacheLayer};
use postkeys::commands::{CommandHandler, ServerContext};
use postkeys::protocol::{parse_message, RespValue};
use postkeys::pubsub::hub::{spawn_hub_listener, Hub};
use postkeys::pubsub::notifier::{spawn_notifier_listener, ListNotifier};
use postkeys::server::{serve, ServerStats};
use postkeys::storage::{schema, Store};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

fn test_dsn() -> String {
    std::env::var("POSTKEYS_TEST_DB")
        .expect("set POSTKEYS_TEST_DB to run the integration tests")
}

async fn start_server(password: Option<&str>) -> SocketAddr {
    let pg_config: tokio_postgres::Config = test_dsn().parse().expect("invalid POSTKEYS_TEST_DB");
    let manager = deadpool_postgres::Manager::from_config(
        pg_config.clone(),
        tokio_postgres::NoTls,
        deadpool_postgres::ManagerConfig {
            recycling_method: deadpool_postgres::RecyclingMethod::Fast,
        },
    );
    let pool = deadpool_postgres::Pool::builder(manager)
        .max_size(8)
        .build()
        .unwrap();

    {
        let client = pool.get().await.unwrap();
        let client: &tokio_postgres::Client = &client;
        schema::ensure_schema(client).await.unwrap();
    }

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    // Leak the sender so background tasks run for the whole test binary
    std::mem::forget(_shutdown_tx);

    let cache = Cache::new(Duration::from_secs(5), 0, None);
    let cache_layer = CacheLayer::new(Some(cache), None, None);

    let (hub, hub_cmd_rx) = Hub::new(pool.clone());
    spawn_hub_listener(
        Arc::clone(&hub),
        hub_cmd_rx,
        pg_config.clone(),
        shutdown_rx.clone(),
    );
    let (notifier, notifier_cmd_rx) = ListNotifier::new();
    spawn_notifier_listener(
        Arc::clone(&notifier),
        notifier_cmd_rx,
        pg_config,
        shutdown_rx.clone(),
    );

    let ctx = Arc::new(ServerContext {
        store: Store::new(pool),
        cache: cache_layer,
        hub,
        notifier,
        auth_password: password.map(|p| p.to_string()),
        start_time: Instant::now(),
        stats: Arc::new(ServerStats::new()),
    });
    let handler = CommandHandler::new(ctx);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, handler, shutdown_rx, 64));
    addr
}

struct Client {
    stream: TcpStream,
    buffer: BytesMut,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buffer: BytesMut::new(),
        }
    }

    async fn send(&mut self, args: &[&[u8]]) {
        let mut frame = format!("*{}\r\n", args.len()).into_bytes();
        for arg in args {
            frame.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            frame.extend_from_slice(arg);
            frame.extend_from_slice(b"\r\n");
        }
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn read_reply(&mut self) -> RespValue {
        loop {
            if let Some((value, consumed)) = parse_message(&self.buffer).unwrap() {
                let _ = self.buffer.split_to(consumed);
                return value;
            }
            let n = tokio::time::timeout(
                Duration::from_secs(10),
                self.stream.read_buf(&mut self.buffer),
            )
            .await
            .expect("timed out waiting for a reply")
            .unwrap();
            assert!(n > 0, "server closed the connection");
        }
    }

    async fn round_trip(&mut self, args: &[&[u8]]) -> RespValue {
        self.send(args).await;
        self.read_reply().await
    }
}

fn unique_key(prefix: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{prefix}:{nanos}")
}

fn bulk(s: &str) -> RespValue {
    RespValue::bulk(bytes::Bytes::from(s.to_string()))
}

#[tokio::test]
#[ignore]
async fn string_set_get_with_ttl() {
    let addr = start_server(None).await;
    let mut client = Client::connect(addr).await;
    let key = unique_key("s1");

    let reply = client
        .round_trip(&[b"SET", key.as_bytes(), b"bar", b"PX", b"500"])
        .await;
    assert_eq!(reply, RespValue::simple_string("OK"));

    let reply = client.round_trip(&[b"GET", key.as_bytes()]).await;
    assert_eq!(reply, bulk("bar"));

    tokio::time::sleep(Duration::from_millis(700)).await;

    // Lazy expiry: the key must be gone even if the janitor has not run
    let reply = client.round_trip(&[b"GET", key.as_bytes()]).await;
    assert_eq!(reply, RespValue::Null);
    let reply = client.round_trip(&[b"EXISTS", key.as_bytes()]).await;
    assert_eq!(reply, RespValue::Integer(0));
}

#[tokio::test]
#[ignore]
async fn wrong_type_does_not_clobber() {
    let addr = start_server(None).await;
    let mut client = Client::connect(addr).await;
    let key = unique_key("s2");

    client.round_trip(&[b"SET", key.as_bytes(), b"v"]).await;
    let reply = client.round_trip(&[b"LPUSH", key.as_bytes(), b"x"]).await;
    match reply {
        RespValue::Error(e) => assert!(e.starts_with("WRONGTYPE"), "got {e}"),
        other => panic!("expected WRONGTYPE, got {other:?}"),
    }
    // The failed push must not have touched the string
    let reply = client.round_trip(&[b"GET", key.as_bytes()]).await;
    assert_eq!(reply, bulk("v"));
    let reply = client.round_trip(&[b"TYPE", key.as_bytes()]).await;
    assert_eq!(reply, RespValue::simple_string("string"));
}

#[tokio::test]
#[ignore]
async fn concurrent_pops_are_disjoint() {
    let addr = start_server(None).await;
    let mut setup = Client::connect(addr).await;
    let key = unique_key("s3");

    let reply = setup
        .round_trip(&[b"RPUSH", key.as_bytes(), b"a", b"b", b"c", b"d"])
        .await;
    assert_eq!(reply, RespValue::Integer(4));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            client.round_trip(&[b"LPOP", key.as_bytes()]).await
        }));
    }

    let mut popped = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            RespValue::Bulk(v) => popped.push(v),
            other => panic!("expected a value, got {other:?}"),
        }
    }
    popped.sort();
    assert_eq!(
        popped,
        vec![
            bytes::Bytes::from("a"),
            bytes::Bytes::from("b"),
            bytes::Bytes::from("c"),
            bytes::Bytes::from("d"),
        ]
    );

    let reply = setup.round_trip(&[b"LLEN", key.as_bytes()]).await;
    assert_eq!(reply, RespValue::Integer(0));
}

#[tokio::test]
#[ignore]
async fn multi_exec_is_atomic_and_invisible() {
    let addr = start_server(None).await;
    let mut client = Client::connect(addr).await;
    let mut observer = Client::connect(addr).await;
    let key = unique_key("s4");

    assert_eq!(
        client.round_trip(&[b"MULTI"]).await,
        RespValue::simple_string("OK")
    );
    assert_eq!(
        client.round_trip(&[b"INCR", key.as_bytes()]).await,
        RespValue::simple_string("QUEUED")
    );
    assert_eq!(
        client.round_trip(&[b"INCR", key.as_bytes()]).await,
        RespValue::simple_string("QUEUED")
    );

    // Queued effects must be invisible before EXEC
    let observed = observer.round_trip(&[b"GET", key.as_bytes()]).await;
    assert_eq!(observed, RespValue::Null);

    let reply = client.round_trip(&[b"EXEC"]).await;
    assert_eq!(
        reply,
        RespValue::Array(vec![RespValue::Integer(1), RespValue::Integer(2)])
    );

    let observed = observer.round_trip(&[b"GET", key.as_bytes()]).await;
    assert_eq!(observed, bulk("2"));
}

#[tokio::test]
#[ignore]
async fn discarded_multi_leaves_no_trace() {
    let addr = start_server(None).await;
    let mut client = Client::connect(addr).await;
    let key = unique_key("s4d");

    client.round_trip(&[b"MULTI"]).await;
    client.round_trip(&[b"SET", key.as_bytes(), b"v"]).await;
    assert_eq!(
        client.round_trip(&[b"DISCARD"]).await,
        RespValue::simple_string("OK")
    );
    assert_eq!(
        client.round_trip(&[b"EXISTS", key.as_bytes()]).await,
        RespValue::Integer(0)
    );
}

#[tokio::test]
#[ignore]
async fn pubsub_fan_out_with_hashed_channel() {
    let addr = start_server(None).await;
    let channel = "c".repeat(200);

    let mut subscriber = Client::connect(addr).await;
    let reply = subscriber
        .round_trip(&[b"SUBSCRIBE", channel.as_bytes()])
        .await;
    assert_eq!(
        reply,
        RespValue::Array(vec![
            bulk("subscribe"),
            bulk(&channel),
            RespValue::Integer(1),
        ])
    );

    // The hub listener drains its LISTEN queue between waits that back
    // off to two seconds when idle; give it a full cycle
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let mut publisher = Client::connect(addr).await;
    let reply = publisher
        .round_trip(&[b"PUBLISH", channel.as_bytes(), b"hello"])
        .await;
    assert_eq!(reply, RespValue::Integer(1));

    // The frame must report the original, unhashed channel name
    let delivery = subscriber.read_reply().await;
    assert_eq!(
        delivery,
        RespValue::Array(vec![bulk("message"), bulk(&channel), bulk("hello")])
    );
}

#[tokio::test]
#[ignore]
async fn blpop_wakes_on_push() {
    let addr = start_server(None).await;
    let key = unique_key("s11");

    let blocked_key = key.clone();
    let blocked = tokio::spawn(async move {
        let mut client = Client::connect(addr).await;
        let started = Instant::now();
        let reply = client
            .round_trip(&[b"BLPOP", blocked_key.as_bytes(), b"5"])
            .await;
        (reply, started.elapsed())
    });

    // Let the waiter register and LISTEN first
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut pusher = Client::connect(addr).await;
    pusher.round_trip(&[b"RPUSH", key.as_bytes(), b"v"]).await;

    let (reply, _elapsed) = blocked.await.unwrap();
    assert_eq!(
        reply,
        RespValue::Array(vec![bulk(&key), bulk("v")])
    );
}

#[tokio::test]
#[ignore]
async fn hyperloglog_estimates() {
    let addr = start_server(None).await;
    let mut client = Client::connect(addr).await;
    let key = unique_key("s8");

    client
        .round_trip(&[b"PFADD", key.as_bytes(), b"a", b"b", b"c", b"d", b"e"])
        .await;
    let reply = client.round_trip(&[b"PFCOUNT", key.as_bytes()]).await;
    match reply {
        RespValue::Integer(n) => assert!((4..=6).contains(&n), "count = {n}"),
        other => panic!("expected integer, got {other:?}"),
    }

    let big = unique_key("s8big");
    for chunk in (0..1000).collect::<Vec<_>>().chunks(100) {
        let mut args: Vec<Vec<u8>> = vec![b"PFADD".to_vec(), big.clone().into_bytes()];
        for i in chunk {
            args.push(format!("unique_{i}").into_bytes());
        }
        let refs: Vec<&[u8]> = args.iter().map(|a| a.as_slice()).collect();
        client.round_trip(&refs).await;
    }
    let reply = client.round_trip(&[b"PFCOUNT", big.as_bytes()]).await;
    match reply {
        RespValue::Integer(n) => assert!((950..=1050).contains(&n), "count = {n}"),
        other => panic!("expected integer, got {other:?}"),
    }
}

#[tokio::test]
#[ignore]
async fn auth_gate_blocks_everything_else() {
    let addr = start_server(Some("sekrit")).await;
    let mut client = Client::connect(addr).await;

    let reply = client.round_trip(&[b"GET", b"whatever"]).await;
    assert_eq!(
        reply,
        RespValue::error("NOAUTH Authentication required.")
    );

    // The handshake whitelist still works
    assert_eq!(
        client.round_trip(&[b"PING"]).await,
        RespValue::simple_string("PONG")
    );

    let reply = client.round_trip(&[b"AUTH", b"wrong"]).await;
    assert!(matches!(reply, RespValue::Error(ref e) if e.starts_with("WRONGPASS")));

    assert_eq!(
        client.round_trip(&[b"AUTH", b"sekrit"]).await,
        RespValue::simple_string("OK")
    );
    let key = unique_key("auth");
    assert_eq!(
        client.round_trip(&[b"SET", key.as_bytes(), b"v"]).await,
        RespValue::simple_string("OK")
    );
}

#[tokio::test]
#[ignore]
async fn list_order_survives_mixed_pushes() {
    let addr = start_server(None).await;
    let mut client = Client::connect(addr).await;
    let key = unique_key("order");

    client.round_trip(&[b"RPUSH", key.as_bytes(), b"b"]).await;
    client.round_trip(&[b"LPUSH", key.as_bytes(), b"a"]).await;
    client.round_trip(&[b"RPUSH", key.as_bytes(), b"c"]).await;

    let reply = client
        .round_trip(&[b"LRANGE", key.as_bytes(), b"0", b"-1"])
        .await;
    assert_eq!(
        reply,
        RespValue::Array(vec![bulk("a"), bulk("b"), bulk("c")])
    );
}

#[tokio::test]
#[ignore]
async fn zset_ordering_and_ranks() {
    let addr = start_server(None).await;
    let mut client = Client::connect(addr).await;
    let key = unique_key("z");

    client
        .round_trip(&[
            b"ZADD",
            key.as_bytes(),
            b"2",
            b"bob",
            b"1",
            b"alice",
            b"2",
            b"ann",
        ])
        .await;

    // Ties break on member bytes
    let reply = client
        .round_trip(&[b"ZRANGE", key.as_bytes(), b"0", b"-1"])
        .await;
    assert_eq!(
        reply,
        RespValue::Array(vec![bulk("alice"), bulk("ann"), bulk("bob")])
    );

    assert_eq!(
        client.round_trip(&[b"ZRANK", key.as_bytes(), b"bob"]).await,
        RespValue::Integer(2)
    );
    assert_eq!(
        client
            .round_trip(&[b"ZREVRANK", key.as_bytes(), b"bob"])
            .await,
        RespValue::Integer(0)
    );
}
