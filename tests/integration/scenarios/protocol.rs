//! Protocol integration tests
//!
//! End-to-end tests for the client against the mock server
//! Note: Pure codec tests live next to the codec

use crate::integration::{MockMemcached, MockMemcachedBuilder, ResponseMode};
use mcharness::{ClientError, McClient, Reply, StoreMode, StoreOptions, REPLICATE_FLAG};

// ============================================================================
// Storage and retrieval
// ============================================================================

#[tokio::test]
async fn test_protocol_basic_get_set() {
    let mock = MockMemcached::new().await.unwrap();
    let mut client = mock.client().await;

    assert!(client.set("testkey", "hello_world").await.unwrap());

    let item = client.get("testkey").await.unwrap().into_value().flatten().unwrap();
    assert_eq!(item.key, "testkey");
    assert_eq!(item.value, b"hello_world");
    assert_eq!(item.flags, 0);
    assert_eq!(item.size(), 11);

    let stats = mock.stats();
    assert_eq!(stats.sets, 1);
    assert_eq!(stats.gets, 1);

    mock.shutdown();
}

#[tokio::test]
async fn test_protocol_binary_safe_values() {
    let mock = MockMemcached::new().await.unwrap();
    let mut client = mock.client().await;

    // CRLF inside the payload must not end the value early
    let value = b"line one\r\nline two\r\n\x00\xff".to_vec();
    assert!(client.set("blob", &value).await.unwrap());

    let item = client.get("blob").await.unwrap().into_value().flatten().unwrap();
    assert_eq!(item.value, value);
    assert_eq!(item.value_str(), None);

    // Empty values are legal too
    assert!(client.set("empty", "").await.unwrap());
    let item = client.get("empty").await.unwrap().into_value().flatten().unwrap();
    assert!(item.value.is_empty());

    mock.shutdown();
}

#[tokio::test]
async fn test_protocol_multi_get_covers_every_key() {
    let mock = MockMemcachedBuilder::new()
        .with_data("a", b"1")
        .with_data("c", b"3")
        .build()
        .await
        .unwrap();
    let mut client = mock.client().await;

    let items = client
        .get_many(&["a", "b", "c"])
        .await
        .unwrap()
        .into_value()
        .unwrap();

    assert_eq!(items.len(), 3);
    assert_eq!(items["a"].as_ref().unwrap().value, b"1");
    assert!(items["b"].is_none());
    assert_eq!(items["c"].as_ref().unwrap().value, b"3");

    // One logical call, three keys
    assert_eq!(client.counters().gets, 3);
    assert_eq!(mock.stats().gets, 1);

    mock.shutdown();
}

#[tokio::test]
async fn test_protocol_add_and_replace() {
    let mock = MockMemcached::new().await.unwrap();
    let mut client = mock.client().await;

    assert!(!client.replace("k", "v0").await.unwrap());
    assert!(client.add("k", "v1").await.unwrap());
    assert!(!client.add("k", "v2").await.unwrap());
    assert!(client.replace("k", "v3").await.unwrap());

    assert_eq!(mock.get_stored_value("k"), Some(b"v3".to_vec()));
    assert_eq!(client.counters().sets, 4);

    mock.shutdown();
}

#[tokio::test]
async fn test_protocol_replicate_flag() {
    let mock = MockMemcached::new().await.unwrap();
    let mut client = mock.client().await;

    let options = StoreOptions {
        replicate: true,
        ..StoreOptions::default()
    };
    assert!(client
        .store(StoreMode::Set, "replicated", "v", options)
        .await
        .unwrap());
    assert_eq!(mock.get_stored_flags("replicated"), Some(REPLICATE_FLAG));

    let item = client.get("replicated").await.unwrap().into_value().flatten().unwrap();
    assert_eq!(item.flags, REPLICATE_FLAG);
    assert!(mock
        .requests()
        .contains(&"set replicated 1024 0 1".to_string()));

    mock.shutdown();
}

#[tokio::test]
async fn test_protocol_delete_operations() {
    let mock = MockMemcached::new().await.unwrap();
    let mut client = mock.client().await;

    assert!(client.set("delkey", "to_delete").await.unwrap());
    assert!(client.delete("delkey").await.unwrap());
    assert_eq!(client.get("delkey").await.unwrap(), Reply::Value(None));

    // Deleting a missing key is not an error
    assert!(!client.delete("nonexistent").await.unwrap());
    assert_eq!(client.counters().deletes, 2);

    mock.shutdown();
}

#[tokio::test]
async fn test_protocol_incr_decr() {
    let mock = MockMemcachedBuilder::new()
        .with_data("counter", b"10")
        .with_data("text", b"abc")
        .build()
        .await
        .unwrap();
    let mut client = mock.client().await;

    assert_eq!(client.incr("counter", 5).await.unwrap(), Some(15));
    assert_eq!(client.decr("counter", 3).await.unwrap(), Some(12));
    assert_eq!(client.incr("missing", 1).await.unwrap(), None);
    assert_eq!(client.decr("missing", 1).await.unwrap(), None);

    // A CLIENT_ERROR is not part of the arithmetic grammar
    let result = client.incr("text", 1).await;
    assert!(matches!(
        result,
        Err(ClientError::UnexpectedResponse { .. })
    ));
    assert!(!client.is_connected());

    mock.shutdown();
}

// ============================================================================
// noreply
// ============================================================================

#[tokio::test]
async fn test_protocol_noreply_set_then_get() {
    let mock = MockMemcached::new().await.unwrap();
    let mut client = mock.client().await;

    let options = StoreOptions {
        noreply: true,
        ..StoreOptions::default()
    };
    assert!(client
        .store(StoreMode::Set, "quiet", "shh", options)
        .await
        .unwrap());

    let item = client.get("quiet").await.unwrap().into_value().flatten().unwrap();
    assert_eq!(item.value, b"shh");

    mock.shutdown();
}

#[tokio::test]
async fn test_protocol_noreply_delete_and_arith() {
    let mock = MockMemcachedBuilder::new()
        .with_data("n", b"1")
        .build()
        .await
        .unwrap();
    let mut client = mock.client().await;

    assert!(client.incr_noreply("n", 4).await.unwrap());
    assert!(client.decr_noreply("n", 2).await.unwrap());
    assert_eq!(mock.get_stored_value("n"), Some(b"3".to_vec()));

    assert!(client.delete_noreply("n").await.unwrap());
    assert_eq!(mock.get_stored_value("n"), None);

    mock.shutdown();
}

#[tokio::test]
async fn test_protocol_noreply_detects_answer() {
    let mock = MockMemcachedBuilder::new()
        .response_mode(ResponseMode::Custom("STORED\r\n".to_string()))
        .build()
        .await
        .unwrap();
    let mut client = mock.client().await;

    let options = StoreOptions {
        noreply: true,
        ..StoreOptions::default()
    };
    assert!(!client
        .store(StoreMode::Set, "k", "v", options)
        .await
        .unwrap());

    // The rest of the unexpected answer must not leak into the next reply
    assert!(client.is_connected());
    mock.set_response_mode(ResponseMode::Normal);
    assert_eq!(client.version().await.unwrap(), "VERSION 1.0 mock");

    mock.set_response_mode(ResponseMode::Custom("DELETED\r\n".to_string()));
    assert!(!client.delete_noreply("k").await.unwrap());
    mock.set_response_mode(ResponseMode::Normal);
    assert_eq!(client.version().await.unwrap(), "VERSION 1.0 mock");

    mock.shutdown();
}

// ============================================================================
// Admin commands
// ============================================================================

#[tokio::test]
async fn test_protocol_version_and_stats() {
    let mock = MockMemcachedBuilder::new()
        .with_data("a", b"1")
        .build()
        .await
        .unwrap();
    let mut client = mock.client().await;

    assert_eq!(client.version().await.unwrap(), "VERSION 1.0 mock");

    let stats = client.stats(None).await.unwrap().unwrap();
    assert_eq!(stats["version"], "1.0 mock");
    assert_eq!(stats["curr_items"], "1");
    assert_eq!(stats["pid"], std::process::id().to_string());

    let items = client.stats(Some("items")).await.unwrap().unwrap();
    assert_eq!(items["items:count"], "1");
    assert!(mock.requests().contains(&"stats items".to_string()));

    assert_eq!(client.counters().others, 3);

    mock.shutdown();
}

#[tokio::test]
async fn test_protocol_stats_timeout_is_none() {
    let mock = MockMemcachedBuilder::new()
        .response_mode(ResponseMode::Silent)
        .build()
        .await
        .unwrap();
    let mut client = mock.client().await;

    assert_eq!(client.stats(None).await.unwrap(), None);

    mock.shutdown();
}

#[tokio::test]
async fn test_protocol_metaget() {
    let mock = MockMemcachedBuilder::new()
        .with_data("present", b"v")
        .build()
        .await
        .unwrap();
    let mut client = mock.client().await;

    let meta = client.metaget("present").await.unwrap();
    assert_eq!(meta["age"], "0");
    assert_eq!(meta["exptime"], "0");
    assert_eq!(meta["from"], "127.0.0.1");
    assert_eq!(meta["is_transient"], "0");

    assert!(client.metaget("absent").await.unwrap().is_empty());
    assert_eq!(client.counters().gets, 2);

    mock.shutdown();
}

#[tokio::test]
async fn test_protocol_issue_command() {
    let mock = MockMemcached::new().await.unwrap();
    let mut client = mock.client().await;

    assert_eq!(
        client.issue_command("version\r\n").await.unwrap(),
        "VERSION 1.0 mock"
    );
    assert_eq!(
        client.issue_command("bogus_command\r\n").await.unwrap(),
        "ERROR"
    );
    assert_eq!(client.counters().others, 2);

    mock.shutdown();
}

#[tokio::test]
async fn test_protocol_shutdown_closes_connection() {
    let mock = MockMemcached::new().await.unwrap();
    let mut client = mock.client().await;

    assert_eq!(client.shutdown().await.unwrap(), "OK");
    assert!(matches!(
        client.version().await,
        Err(ClientError::ConnectionClosed) | Err(ClientError::Io(_))
    ));

    mock.shutdown();
}

// ============================================================================
// Error responses
// ============================================================================

#[tokio::test]
async fn test_protocol_server_error_is_a_value() {
    let mock = MockMemcachedBuilder::new()
        .response_mode(ResponseMode::Custom(
            "SERVER_ERROR out of memory\r\n".to_string(),
        ))
        .build()
        .await
        .unwrap();
    let mut client = mock.client().await;

    let reply = client.get("k").await.unwrap();
    assert_eq!(reply.server_error(), Some("SERVER_ERROR out of memory"));

    // Delete maps it to "not deleted"
    assert!(!client.delete("k").await.unwrap());
    assert!(client.is_connected());

    mock.shutdown();
}

#[tokio::test]
async fn test_protocol_violation_disconnects() {
    let mock = MockMemcachedBuilder::new()
        .response_mode(ResponseMode::Custom("BOGUS\r\n".to_string()))
        .build()
        .await
        .unwrap();
    let mut client = mock.client().await;

    match client.get_many(&["k1", "k2"]).await {
        Err(ClientError::UnexpectedResponse { line, keys }) => {
            assert_eq!(line, "BOGUS");
            assert_eq!(keys, vec!["k1".to_string(), "k2".to_string()]);
        }
        other => panic!("Expected protocol violation, got {:?}", other),
    }
    assert!(!client.is_connected());
    assert!(matches!(
        client.delete("k1").await,
        Err(ClientError::NotConnected(_))
    ));

    mock.shutdown();
}

#[tokio::test]
async fn test_protocol_error_on_store_reconnects() {
    let mock = MockMemcachedBuilder::new()
        .response_mode(ResponseMode::Custom("ERROR\r\n".to_string()))
        .build()
        .await
        .unwrap();
    let mut client = mock.client().await;

    assert!(!client.set("k", "v").await.unwrap());
    assert!(client.is_connected());

    // The fresh connection works once the server behaves again
    mock.set_response_mode(ResponseMode::Normal);
    assert!(client.set("k", "v").await.unwrap());

    mock.shutdown();
}

#[tokio::test]
async fn test_protocol_connection_closed() {
    let mock = MockMemcachedBuilder::new()
        .response_mode(ResponseMode::Failure)
        .build()
        .await
        .unwrap();
    let mut client = mock.client().await;

    assert!(matches!(
        client.get("k").await,
        Err(ClientError::ConnectionClosed) | Err(ClientError::Io(_))
    ));

    mock.shutdown();
}

#[tokio::test]
async fn test_protocol_reconnect_after_disconnect() {
    let mock = MockMemcached::new().await.unwrap();
    let mut client = McClient::new(mock.endpoint());

    client.ensure_connected().await.unwrap();
    assert!(client.set("k", "v").await.unwrap());

    client.disconnect();
    assert!(!client.is_connected());
    client.connect().await.unwrap();
    assert_eq!(
        client.get("k").await.unwrap().into_value().flatten().map(|i| i.value),
        Some(b"v".to_vec())
    );

    mock.shutdown();
}
