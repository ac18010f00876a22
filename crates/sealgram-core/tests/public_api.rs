//! Tests for the public building blocks used without an engine.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sealgram_core::{
    AlertDescription, ConcurrentQueue, CredentialKind, Error, SecurityStore, SocketConfig,
};

#[test]
fn test_queue_blocking_peek_then_pop() {
    let queue = Arc::new(ConcurrentQueue::new());
    let peeker = {
        let queue = queue.clone();
        thread::spawn(move || queue.peek())
    };

    thread::sleep(Duration::from_millis(20));
    queue.push(vec![1u8, 2, 3]);

    assert_eq!(peeker.join().unwrap(), vec![1, 2, 3]);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.pop(), vec![1, 2, 3]);
    assert!(matches!(queue.try_pop(), Err(Error::WouldBlock)));
}

#[test]
fn test_store_answers_credential_requests() {
    let mut store = SecurityStore::new();
    store.add_identity("Client_identity", "secretPSK").unwrap();

    let mut out = [0u8; 64];
    let n = store
        .lookup_credential(CredentialKind::Identity, None, &mut out)
        .unwrap();
    assert_eq!(&out[..n], b"Client_identity");

    let n = store
        .lookup_credential(CredentialKind::Key, Some(b"Client_identity"), &mut out)
        .unwrap();
    assert_eq!(&out[..n], b"secretPSK");

    assert_eq!(
        store.lookup_credential(CredentialKind::Key, Some(b"someone"), &mut out),
        Err(AlertDescription::DecryptError)
    );
}

#[test]
fn test_config_roundtrips_through_json() {
    let config = SocketConfig::default().with_send_backoff(Duration::from_millis(7));
    let json = serde_json::to_string(&config).unwrap();
    let back: SocketConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back.send_backoff_ms, 7);
    assert_eq!(back.eviction_timeout_ms, config.eviction_timeout_ms);
}
