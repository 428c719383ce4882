use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use telli_cache_client::{CacheClient, CacheError, ClientConfig, TtlStatus};
use telli_cache_common::decode;
use telli_cache_engine::{KVEngine, MemoryEngine};

const TEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Starts the in-memory server on an ephemeral port.
async fn spawn_server() -> (String, Arc<MemoryEngine>) {
    let engine = Arc::new(MemoryEngine::with_shard_count(4));
    let (listener, addr) = telli_cache_server::bind("127.0.0.1:0").await.expect("bind");
    tokio::spawn(telli_cache_server::serve(listener, Arc::clone(&engine)));
    (format!("redis://{addr}"), engine)
}

fn client_for(url: &str, namespace: &str) -> CacheClient {
    let config = ClientConfig::from_url(url)
        .expect("config")
        .with_namespace(namespace)
        .with_command_timeout(TEST_TIMEOUT);
    CacheClient::new(config).expect("client")
}

/// Reads one command frame from a raw peer connection.
async fn read_command(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<Vec<Vec<u8>>> {
    loop {
        if let Some(frame) = decode(buf).expect("valid frame") {
            return frame.into_command_args().ok();
        }
        match stream.read_buf(buf).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Starts a raw peer that answers every command with `reply`.
async fn spawn_raw_server(reply: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = BytesMut::new();
                while read_command(&mut stream, &mut buf).await.is_some() {
                    if stream.write_all(reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    format!("redis://{addr}")
}

#[tokio::test]
async fn set_get_roundtrip() {
    let (url, _engine) = spawn_server().await;
    let cache = client_for(&url, "telli:dialog");

    cache.set("greeting", "hello").await.expect("set");
    assert_eq!(cache.get("greeting").await.expect("get"), Some(b"hello".to_vec()));
    assert_eq!(cache.get_string("greeting").await.expect("get"), Some("hello".to_string()));
}

#[tokio::test]
async fn missing_key_is_absent_not_error() {
    let (url, _engine) = spawn_server().await;
    let cache = client_for(&url, "telli:dialog");

    assert_eq!(cache.get("never-set").await.expect("get"), None);
    assert!(!cache.has("never-set").await.expect("has"));
    assert_eq!(cache.ttl("never-set").await.expect("ttl"), TtlStatus::Missing);
}

#[tokio::test]
async fn delete_absent_key_succeeds() {
    let (url, _engine) = spawn_server().await;
    let cache = client_for(&url, "telli:dialog");

    assert!(!cache.delete("ghost").await.expect("delete"));

    cache.set("ghost", "boo").await.expect("set");
    assert!(cache.has("ghost").await.expect("has"));
    assert!(cache.delete("ghost").await.expect("delete"));
    assert_eq!(cache.get("ghost").await.expect("get"), None);
}

#[tokio::test]
async fn keys_are_stored_under_namespace_prefix() {
    let (url, engine) = spawn_server().await;
    let cache = client_for(&url, "telli:dialog");

    cache.set("user:42", "active").await.expect("set");
    let stored = engine.get(b"telli:dialog:user:42").expect("prefixed key");
    assert_eq!(&*stored, b"active");
    assert!(engine.get(b"user:42").is_none());
}

#[tokio::test]
async fn clients_sharing_namespace_see_each_other() {
    let (url, _engine) = spawn_server().await;
    let writer = client_for(&url, "telli:dialog");
    let reader = client_for(&url, "telli:dialog");

    writer.set("conversation:7", "draft").await.expect("set");
    assert_eq!(reader.get("conversation:7").await.expect("get"), Some(b"draft".to_vec()));

    reader.delete("conversation:7").await.expect("delete");
    assert_eq!(writer.get("conversation:7").await.expect("get"), None);
}

#[tokio::test]
async fn namespaces_are_isolated() {
    let (url, _engine) = spawn_server().await;
    let ns1 = client_for(&url, "ns1");
    let ns2 = client_for(&url, "ns2");

    ns1.set("shared", "one").await.expect("set");
    ns2.set("shared", "two").await.expect("set");
    ns1.set("only-ns1", "x").await.expect("set");

    assert_eq!(ns1.get("shared").await.expect("get"), Some(b"one".to_vec()));
    assert_eq!(ns2.get("shared").await.expect("get"), Some(b"two".to_vec()));
    assert!(!ns2.has("only-ns1").await.expect("has"));

    assert!(ns2.delete("shared").await.expect("delete"));
    assert_eq!(ns1.get("shared").await.expect("get"), Some(b"one".to_vec()));
}

#[tokio::test]
async fn keys_and_clear_stay_within_namespace() {
    let (url, _engine) = spawn_server().await;
    let dialog = client_for(&url, "telli:dialog");
    let admin = client_for(&url, "telli:admin");
    // Shares a textual prefix with "telli:dialog" but is a different namespace.
    let lookalike = client_for(&url, "telli:dialogx");

    for idx in 0..150 {
        dialog.set(&format!("item:{idx}"), "v").await.expect("set");
    }
    admin.set("item:0", "v").await.expect("set");
    lookalike.set("item:0", "v").await.expect("set");

    let mut keys = dialog.keys().await.expect("keys");
    keys.sort();
    assert_eq!(keys.len(), 150);
    assert!(keys.contains(&"item:149".to_string()));
    assert!(keys.iter().all(|key| key.starts_with("item:")));

    assert_eq!(dialog.clear().await.expect("clear"), 150);
    assert!(dialog.keys().await.expect("keys").is_empty());
    assert_eq!(admin.keys().await.expect("keys"), vec!["item:0".to_string()]);
    assert_eq!(lookalike.keys().await.expect("keys"), vec!["item:0".to_string()]);
}

#[tokio::test]
async fn ttl_entry_expires() {
    let (url, _engine) = spawn_server().await;
    let cache = client_for(&url, "telli:dialog");

    cache
        .set_with_ttl("user:42", "active", Duration::from_secs(1))
        .await
        .expect("set");
    assert_eq!(cache.get_string("user:42").await.expect("get"), Some("active".to_string()));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(cache.get("user:42").await.expect("get"), None);
}

#[tokio::test]
async fn sub_second_ttl_is_honoured() {
    let (url, _engine) = spawn_server().await;
    let cache = client_for(&url, "telli:dialog");

    cache
        .set_with_ttl("flash", "x", Duration::from_millis(100))
        .await
        .expect("set");
    match cache.ttl("flash").await.expect("ttl") {
        TtlStatus::ExpiresIn(remaining) => assert!(remaining <= Duration::from_millis(100)),
        other => panic!("unexpected ttl {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!cache.has("flash").await.expect("has"));
}

#[tokio::test]
async fn plain_set_clears_ttl() {
    let (url, _engine) = spawn_server().await;
    let cache = client_for(&url, "telli:dialog");

    cache
        .set_with_ttl("session", "a", Duration::from_secs(30))
        .await
        .expect("set");
    cache.set("session", "b").await.expect("set");
    assert_eq!(cache.ttl("session").await.expect("ttl"), TtlStatus::NoExpiry);
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct ModelSettings {
    model: String,
    max_tokens: u32,
}

#[tokio::test]
async fn json_helpers_roundtrip() {
    let (url, _engine) = spawn_server().await;
    let cache = client_for(&url, "telli:dialog");
    let settings = ModelSettings {
        model: "gpt-4o-mini".to_string(),
        max_tokens: 2048,
    };

    cache.set_json("settings", &settings).await.expect("set");
    let loaded: Option<ModelSettings> = cache.get_json("settings").await.expect("get");
    assert_eq!(loaded, Some(settings));

    cache.set("broken", "{not json").await.expect("set");
    let err = cache.get_json::<ModelSettings>("broken").await.unwrap_err();
    assert!(matches!(err, CacheError::Codec(_)));
}

#[tokio::test]
async fn concurrent_callers_receive_their_own_replies() {
    let (url, _engine) = spawn_server().await;
    let config = ClientConfig::from_url(&url)
        .expect("config")
        .with_namespace("telli:dialog")
        .with_command_timeout(Duration::from_secs(2))
        .with_pool_size(2, 4);
    let cache = CacheClient::new(config).expect("client");

    let mut tasks = Vec::new();
    for idx in 0..64 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move {
            let key = format!("worker:{idx}");
            let value = format!("value-{idx}");
            cache.set(&key, &value).await.expect("set");
            let got = cache.get_string(&key).await.expect("get");
            assert_eq!(got, Some(value));
        }));
    }
    for task in tasks {
        task.await.expect("task");
    }
    assert!(cache.idle_connections() <= 2);
}

#[tokio::test]
async fn ping_reaches_server() {
    let (url, _engine) = spawn_server().await;
    let cache = client_for(&url, "telli:dialog");
    cache.ping().await.expect("ping");
    assert_eq!(cache.idle_connections(), 1);
}

#[tokio::test]
async fn silent_server_times_out_as_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            // Accept and never answer.
            held.push(stream);
        }
    });

    let config = ClientConfig::from_url(&format!("redis://{addr}"))
        .expect("config")
        .with_command_timeout(Duration::from_millis(200));
    let cache = CacheClient::new(config).expect("client");

    let started = Instant::now();
    let err = cache.get("anything").await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_unavailable(), "unexpected error {err:?}");
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(1200), "took {elapsed:?}");
    assert_eq!(cache.idle_connections(), 0);
}

#[tokio::test]
async fn refused_connection_is_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let cache = client_for(&format!("redis://{addr}"), "telli:dialog");
    let err = cache.set("key", "value").await.unwrap_err();
    assert!(err.is_unavailable(), "unexpected error {err:?}");
}

#[tokio::test]
async fn garbage_reply_is_protocol_error() {
    let url = spawn_raw_server(b"?garbage\r\n").await;
    let cache = client_for(&url, "telli:dialog");

    let err = cache.get("key").await.unwrap_err();
    assert!(err.is_protocol(), "unexpected error {err:?}");
    assert_eq!(cache.idle_connections(), 0);
}

#[tokio::test]
async fn wrong_reply_type_is_protocol_error() {
    let url = spawn_raw_server(b":1\r\n").await;
    let cache = client_for(&url, "telli:dialog");

    let err = cache.get("key").await.unwrap_err();
    assert!(matches!(err, CacheError::Protocol(_)));
}

#[tokio::test]
async fn rejected_auth_is_protocol_error() {
    let (url, _engine) = spawn_server().await;
    let url = url.replace("redis://", "redis://:secret@");
    let cache = client_for(&url, "telli:dialog");

    let err = cache.get("key").await.unwrap_err();
    assert!(err.is_protocol(), "unexpected error {err:?}");
}

#[tokio::test]
async fn abandoned_command_does_not_leak_late_reply() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let served = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&served);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let mut buf = BytesMut::new();
                while read_command(&mut stream, &mut buf).await.is_some() {
                    let reply: &[u8] = if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        // First command ever: answer only after the client gave up.
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        b"$5\r\nstale\r\n"
                    } else {
                        b"$5\r\nfresh\r\n"
                    };
                    if stream.write_all(reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let config = ClientConfig::from_url(&format!("redis://{addr}"))
        .expect("config")
        .with_command_timeout(Duration::from_millis(100))
        .with_pool_size(1, 1);
    let cache = CacheClient::new(config).expect("client");

    let err = cache.get("key").await.unwrap_err();
    assert!(err.is_unavailable());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(cache.get("key").await.expect("get"), Some(b"fresh".to_vec()));
}

#[tokio::test]
async fn idle_connection_closed_by_server_is_replaced() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                // One reply per connection, then hang up like an idle timeout.
                let mut buf = BytesMut::new();
                if read_command(&mut stream, &mut buf).await.is_some() {
                    let _ = stream.write_all(b"+PONG\r\n").await;
                }
            });
        }
    });

    let cache = client_for(&format!("redis://{addr}"), "telli:dialog");
    cache.ping().await.expect("first ping");
    assert_eq!(cache.idle_connections(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    cache.ping().await.expect("ping after server closed idle connection");
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unrepresentable_ttl_is_rejected_without_dropping_connection() {
    let (url, engine) = spawn_server().await;
    let cache = client_for(&url, "telli:dialog");

    let err = cache
        .set_with_ttl("forever", "value", Duration::MAX)
        .await
        .unwrap_err();
    assert!(err.is_protocol(), "unexpected error {err:?}");
    assert!(engine.get(b"telli:dialog:forever").is_none());

    cache.ping().await.expect("ping");
    assert_eq!(cache.idle_connections(), 1);
}

#[test]
fn missing_env_url_is_configuration_error() {
    let err = ClientConfig::from_lookup(|_| None).unwrap_err();
    assert!(matches!(err, CacheError::Configuration(_)));
}
