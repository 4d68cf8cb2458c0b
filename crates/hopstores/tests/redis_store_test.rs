// crates/hopstores/tests/redis_store_test.rs
//
// Exercises the Redis-backed stores against a real server. Start one
// with: docker run -p 6379:6379 redis

use std::time::Duration;

use hopcore::store::{ContextStore, GlobalStore};
use hopstores::{RedisContextStore, RedisGlobalStore, RedisStoreConfig};
use uuid::Uuid;

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

async fn redis_available() -> bool {
    tokio::net::TcpStream::connect("127.0.0.1:6379")
        .await
        .is_ok()
}

/// A throwaway namespace per test run so runs never see each other's keys.
fn test_config() -> RedisStoreConfig {
    RedisStoreConfig {
        namespace: format!("hoptest-{}", Uuid::new_v4()),
        linger: Duration::from_secs(5),
        ..Default::default()
    }
}

#[tokio::test]
#[ignore] // Requires running Redis server
async fn test_context_store_roundtrip_and_retirement() {
    init_tracing();
    if !redis_available().await {
        println!("Skipping test: Redis is not available on 127.0.0.1:6379");
        return;
    }

    let config = test_config();
    println!("Using namespace {}", config.namespace);
    let store = RedisContextStore::connect(config.clone())
        .await
        .expect("connect context store");

    assert_eq!(store.get("t1").await.expect("get missing"), None);

    store.put("t1", "{\"id\":\"t1\"}").await.expect("put");
    assert_eq!(
        store.get("t1").await.expect("get").as_deref(),
        Some("{\"id\":\"t1\"}")
    );

    // Retiring shortens retention without hiding the state; late
    // deliveries still need to see the finished flag.
    store.expire("t1").await.expect("expire");
    assert!(
        store.get("t1").await.expect("get after expire").is_some(),
        "retired state must stay readable until the linger runs out"
    );

    store.remove("t1").await.expect("remove");
    assert_eq!(store.get("t1").await.expect("get after remove"), None);
    println!("Context store roundtrip OK");
}

#[tokio::test]
#[ignore] // Requires running Redis server
async fn test_global_store_counters_and_values() {
    init_tracing();
    if !redis_available().await {
        println!("Skipping test: Redis is not available on 127.0.0.1:6379");
        return;
    }

    let store = RedisGlobalStore::connect(test_config())
        .await
        .expect("connect global store");

    assert_eq!(store.incr("backlog:a->end").await.expect("incr"), 1);
    assert_eq!(store.incr("backlog:a->end").await.expect("incr"), 2);
    assert_eq!(store.decr("backlog:a->end").await.expect("decr"), 1);
    assert_eq!(
        store.get("backlog:a->end").await.expect("get").as_deref(),
        Some("1"),
        "counters read back as strings"
    );

    store.put("arrive:j:t:0", "+\"9.50\"").await.expect("put");
    assert_eq!(
        store.get("arrive:j:t:0").await.expect("get").as_deref(),
        Some("+\"9.50\"")
    );
    println!("Counters and values OK");
}

#[tokio::test]
#[ignore] // Requires running Redis server
async fn test_global_store_tracks_live_hosts() {
    init_tracing();
    if !redis_available().await {
        println!("Skipping test: Redis is not available on 127.0.0.1:6379");
        return;
    }

    let store = RedisGlobalStore::connect(test_config())
        .await
        .expect("connect global store");

    store.keep_alive("quotes", "10.0.0.1").await.expect("keep alive");
    store.keep_alive("quotes", "10.0.0.2").await.expect("keep alive");
    // Refreshing an existing host must not double-count it.
    store.keep_alive("quotes", "10.0.0.1").await.expect("keep alive");

    assert_eq!(store.alive_count("quotes").await.expect("count"), 2);
    assert_eq!(
        store.alive_count("unknown-pipeline").await.expect("count"),
        0
    );

    let hosts = store.host_ips().await.expect("hosts");
    assert!(hosts.contains(&"10.0.0.1".to_string()), "hosts: {hosts:?}");
    assert!(hosts.contains(&"10.0.0.2".to_string()), "hosts: {hosts:?}");
    println!("Liveness OK, hosts: {hosts:?}");
}
