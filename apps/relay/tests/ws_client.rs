//! Exchange-side relay adapters against a live relay server.

use std::sync::Arc;
use std::time::Duration;

use chatkey_crypto::identity::UserIdentity;
use chatkey_crypto::keystore::MemoryKeyStore;
use chatkey_exchange::directory::InMemoryDirectory;
use chatkey_exchange::identity::provision_identity;
use chatkey_exchange::presence::Presence;
use chatkey_exchange::relay::Relay;
use chatkey_exchange::store::SqliteRecordStore;
use chatkey_exchange::{ExchangeConfig, HttpPresence, KeyExchangeService, ServiceDeps, WsRelay};
use chatkey_relay::config::RelayConfig;
use chatkey_relay::router::build_router;
use chatkey_relay::state::AppState;
use chatkey_shared::ids::{ChatId, UserId};
use chatkey_shared::signal::Signal;
use zeroize::Zeroizing;

/// Serve the relay on an ephemeral port and return its address.
async fn spawn_relay() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(AppState::new(RelayConfig::default()));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}

async fn wait_for<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn signal_travels_between_two_connections() {
    let addr = spawn_relay().await;
    let (alice, bob) = (UserId::new(), UserId::new());
    let alice_relay = WsRelay::connect(&format!("ws://{addr}"), alice).await.unwrap();
    let bob_relay = WsRelay::connect(&format!("ws://{addr}"), bob).await.unwrap();
    let mut bob_inbox = bob_relay.subscribe(bob).await;

    let signal = Signal::RotateRequest {
        chat_id: ChatId::new(),
    };
    alice_relay.send(bob, signal).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), bob_inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, signal);
    assert!(alice_relay.is_connected());
}

#[tokio::test]
async fn signal_to_offline_user_is_reported_undeliverable() {
    let addr = spawn_relay().await;
    let alice = UserId::new();
    let alice_relay = WsRelay::connect(&format!("ws://{addr}"), alice).await.unwrap();

    let signal = Signal::RotateRequest {
        chat_id: ChatId::new(),
    };
    alice_relay.send(UserId::new(), signal).await.unwrap();

    wait_for("undeliverable report", || alice_relay.undelivered() == 1).await;
}

#[tokio::test]
async fn presence_follows_relay_connections() {
    let addr = spawn_relay().await;
    let presence = HttpPresence::new(&format!("http://{addr}"));
    let alice = UserId::new();

    assert!(!presence.is_recently_online(alice, Duration::from_secs(60)).await);

    let connection = WsRelay::connect(&format!("ws://{addr}"), alice).await.unwrap();
    assert!(!connection.is_subscribed());
    assert!(presence.is_recently_online(alice, Duration::from_secs(60)).await);
    let answer = presence.fetch(alice).await.unwrap();
    assert_eq!(answer.user_id, alice);
    assert!(answer.online);
}

async fn client(
    addr: &str,
    identity: &UserIdentity,
    store: Arc<SqliteRecordStore>,
    directory: Arc<InMemoryDirectory>,
) -> (KeyExchangeService, Arc<WsRelay>) {
    let relay = Arc::new(
        WsRelay::connect(&format!("ws://{addr}"), identity.user_id)
            .await
            .unwrap(),
    );
    // Slow the fallback poller so the relay does the work.
    let config = ExchangeConfig {
        poll_initial_ms: 60_000,
        poll_max_ms: 60_000,
        ..ExchangeConfig::default()
    };
    let service = KeyExchangeService::new(
        identity.clone(),
        ServiceDeps {
            store,
            directory,
            presence: Arc::new(HttpPresence::new(&format!("http://{addr}"))),
            relay: relay.clone(),
        },
        Arc::new(MemoryKeyStore::new()),
        config,
    )
    .unwrap();
    (service, relay)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_clients_activate_a_key_over_the_relay() {
    let addr = spawn_relay().await;
    let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
    let directory = Arc::new(InMemoryDirectory::new());
    let mut identities = Vec::new();
    for secret in ["alice-secret", "bob-secret"] {
        let identity = provision_identity(
            UserId::new(),
            Zeroizing::new(secret.as_bytes().to_vec()),
            directory.as_ref(),
        )
        .await
        .unwrap();
        identities.push(identity);
    }
    let (alice, alice_relay) =
        client(&addr, &identities[0], store.clone(), directory.clone()).await;
    let (bob, bob_relay) = client(&addr, &identities[1], store, directory).await;
    let chat = ChatId::new();
    alice.open_chat(chat, identities[1].user_id).await.unwrap();
    bob.open_chat(chat, identities[0].user_id).await.unwrap();
    alice.start().unwrap();
    bob.start().unwrap();
    wait_for("relay subscriptions", || {
        alice_relay.is_subscribed() && bob_relay.is_subscribed()
    })
    .await;

    alice.initiate_exchange(chat).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let a = alice.get_active_key(chat).await.unwrap();
        let b = bob.get_active_key(chat).await.unwrap();
        if let (Some(a), Some(b)) = (a, b) {
            assert_eq!(a, b);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "keys never activated");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    alice.shutdown();
    bob.shutdown();
}
