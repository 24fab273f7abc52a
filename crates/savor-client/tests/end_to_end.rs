//! The client against the real backend on a local port: HTTP through reqwest,
//! change events through the realtime websocket.

use std::sync::Arc;
use std::time::Duration;

use savor_api::auth::AppStateInner;
use savor_client::config::ClientConfig;
use savor_client::http::HttpBackend;
use savor_client::ws::WsChangeSource;
use savor_client::{MutationOutcome, Savor, ToggleState};
use savor_db::Database;
use savor_realtime::Hub;
use savor_types::api::{Credentials, Session};

async fn spawn_backend() -> ClientConfig {
    spawn_backend_with_hub().await.0
}

async fn spawn_backend_with_hub() -> (ClientConfig, Hub) {
    let hub = Hub::new();
    let state = Arc::new(AppStateInner {
        db: Database::open_in_memory().unwrap(),
        hub: hub.clone(),
        jwt_secret: "end-to-end".to_string(),
        storage_dir: std::env::temp_dir().join(format!("savor-e2e-{}", uuid::Uuid::new_v4())),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, savor_api::router(state)).await.unwrap();
    });
    let config = ClientConfig::new(format!("http://{addr}"), format!("ws://{addr}/realtime"));
    (config, hub)
}

async fn register(config: &ClientConfig, username: &str) -> Session {
    HttpBackend::new(config)
        .unwrap()
        .register(&Credentials {
            username: username.to_string(),
            password: "correct horse".to_string(),
        })
        .await
        .unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..50 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn likes_reconcile_against_the_server() {
    let config = spawn_backend().await;
    let alice = Savor::with_session(&config, &register(&config, "alice").await).unwrap();
    let bob_session = register(&config, "bob").await;
    let bob = Savor::with_session(&config, &bob_session).unwrap();

    let feed = alice.feed();
    let post = feed.publish("Saffron risotto", None).await.unwrap();

    let outcome = alice.interactions().toggle_like(post.id).await;
    assert_eq!(outcome, MutationOutcome::Confirmed(ToggleState::new(true, 1)));

    // Bob's screen predates his own like from another device
    bob.interactions().seed_post(&post);
    bob.gateway().like_post(post.id).await;
    let outcome = bob.interactions().set_liked(post.id, true).await;
    assert!(outcome.is_confirmed());
    assert_eq!(bob.interactions().take_error(), None);

    let fresh = bob.gateway().fetch_post(post.id).await.data.unwrap();
    assert_eq!(fresh.likes_count, 2);
    assert!(fresh.user_has_liked);
}

#[tokio::test]
async fn comment_thread_reloads_on_realtime_change() {
    let config = spawn_backend().await;
    let alice = Savor::with_session(&config, &register(&config, "alice").await).unwrap();
    let bob = Savor::with_session(&config, &register(&config, "bob").await).unwrap();

    let post = alice.feed().publish("Tasting menu", None).await.unwrap();

    let thread = alice.comment_thread(post.id);
    thread.load().await.unwrap();
    let mut listener = alice.listener();
    listener.mount(thread.filter(), Arc::clone(&thread)).await.unwrap();
    // Let the server register the subscription before anything changes
    tokio::time::sleep(Duration::from_millis(200)).await;

    let bobs_thread = bob.comment_thread(post.id);
    let parent = bobs_thread.submit("Course four was perfect", None).await.unwrap();
    bobs_thread.submit("The sorbet too", Some(parent.id)).await.unwrap();

    assert!(eventually(|| thread.comment_count() == 2).await);
    let comments = thread.comments();
    assert_eq!(comments[0].replies[0].content, "The sorbet too");

    listener.unmount();
    alice.close().await;
}

#[tokio::test]
async fn remounting_releases_server_subscriptions() {
    let (config, hub) = spawn_backend_with_hub().await;
    let alice = Savor::with_session(&config, &register(&config, "alice").await).unwrap();

    let mut listener = alice.listener();
    for _ in 0..5 {
        let thread = alice.comment_thread(uuid::Uuid::new_v4());
        listener.mount(thread.filter(), thread).await.unwrap();
    }
    assert!(eventually(|| hub.active_subscriptions() == 1).await);

    listener.unmount();
    assert!(eventually(|| hub.active_subscriptions() == 0).await);
    alice.close().await;
}

#[tokio::test]
async fn chat_between_two_clients() {
    let config = spawn_backend().await;
    let alice = Savor::with_session(&config, &register(&config, "alice").await).unwrap();
    let bob_session = register(&config, "bob").await;
    let bob = Savor::with_session(&config, &bob_session).unwrap();

    let conversation = alice.inbox().open_with(bob_session.user_id).await.unwrap();
    let store = alice.conversation(conversation.id);
    store.send("Table for two at eight?").await.unwrap();

    bob.inbox().load().await.unwrap();
    assert_eq!(bob.inbox().unread(conversation.id), 1);
    assert_eq!(bob.inbox().mark_read(conversation.id).await, MutationOutcome::Confirmed(0));

    let bobs_view = bob.conversation(conversation.id);
    bobs_view.load().await.unwrap();
    assert_eq!(bobs_view.messages()[0].body, "Table for two at eight?");
}

#[tokio::test]
async fn realtime_rejects_a_bad_token() {
    let config = spawn_backend().await;
    let source = WsChangeSource::new(config.realtime_url.clone(), "not-a-token");
    let result = savor_realtime::ChangeSource::subscribe(
        &source,
        savor_types::events::ChangeFilter::table(savor_types::events::tables::POSTS),
    )
    .await;
    assert!(result.is_err());
}
