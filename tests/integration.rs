//! Integration tests for tether
//!
//! A Sender and a Receiver talk to each other over the in-process channels,
//! exercising the public API end to end.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether::{
    BroadcastHub, ConnectionState, MessageChannel, Receiver, Responder, Sender, SharedTarget,
    Target, TetherConfig, TetherError,
};

fn test_config() -> TetherConfig {
    TetherConfig::new()
        .request_timeout(Duration::from_secs(2))
        .disconnect_grace(Duration::ZERO)
}

/// Connected sender/receiver pair over a message channel
async fn port_pair(config: TetherConfig) -> (Sender, Receiver) {
    let (host, guest) = MessageChannel::new();
    let receiver = Receiver::new(config.clone());
    receiver.connect(guest).await.unwrap();
    let sender = Sender::new(config);
    sender.connect(host).await.unwrap();
    (sender, receiver)
}

#[tokio::test]
async fn test_ping_pong() {
    let (sender, receiver) = port_pair(test_config()).await;
    receiver.on_request("ping", |env, res| {
        assert_eq!(env.body, json!("hi"));
        res.send(json!("pong"))?;
        Ok(())
    });

    let reply = sender.post_request("ping", json!("hi")).await.unwrap();
    assert_eq!(reply, json!("pong"));
    assert_eq!(sender.pending_count(), 0);
}

#[tokio::test]
async fn test_missing_handler() {
    let (sender, _receiver) = port_pair(test_config()).await;

    let err = sender.post_request("missing", Value::Null).await.unwrap_err();
    assert_eq!(err.to_string(), "Request \"missing\" not found");
    assert!(matches!(err, TetherError::Remote(_)));
}

#[tokio::test]
async fn test_typed_request() {
    #[derive(Serialize)]
    struct GetCookie {
        name: String,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Cookie {
        name: String,
        value: String,
    }

    let (sender, receiver) = port_pair(test_config()).await;
    receiver.on_request("store.getCookie", |env, res| {
        let name = env.body["name"].as_str().unwrap_or_default().to_string();
        res.reply(&json!({ "name": name, "value": "abc" }))?;
        Ok(())
    });

    let cookie: Cookie = sender
        .request(
            "store.getCookie",
            &GetCookie {
                name: "sid".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        cookie,
        Cookie {
            name: "sid".to_string(),
            value: "abc".to_string()
        }
    );
}

#[tokio::test]
async fn test_three_events_then_unsubscribe() {
    let (sender, receiver) = port_pair(test_config()).await;

    let feed: Arc<Mutex<Option<Responder>>> = Arc::new(Mutex::new(None));
    let slot = feed.clone();
    receiver.on_subscribe("page.onUrlChange", move |_, res| {
        *slot.lock() = Some(res);
        Ok(())
    });
    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();
    receiver.on_unsubscribe("page.onUrlChange", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription = sender
        .subscribe("page.onUrlChange", move |event| sink.lock().push(event))
        .unwrap();

    // Wait for the subscribe batch to reach the receiver
    tokio::time::sleep(Duration::from_millis(30)).await;
    let responder = feed.lock().clone().expect("subscribe handler ran");
    assert_eq!(receiver.active_subscription_count(), 1);

    for n in 1..=3 {
        responder.send(json!({ "url": format!("/page/{}", n) })).unwrap();
    }
    assert_eq!(
        *seen.lock(),
        vec![
            json!({"url": "/page/1"}),
            json!({"url": "/page/2"}),
            json!({"url": "/page/3"})
        ]
    );

    subscription.unsubscribe();
    assert_eq!(sender.subscription_count(), 0);

    // Already in flight: delivered to the channel, dropped by the sender
    responder.send(json!({ "url": "/page/4" })).unwrap();
    assert_eq!(seen.lock().len(), 3);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(receiver.active_subscription_count(), 0);
}

#[tokio::test]
async fn test_subscription_options_reach_handler() {
    let (sender, receiver) = port_pair(test_config()).await;
    let options = Arc::new(Mutex::new(None));
    let slot = options.clone();
    receiver.on_subscribe("element.onClick", move |env, _| {
        *slot.lock() = Some(env.body);
        Ok(())
    });

    let _subscription = sender
        .subscribe_with("element.onClick", json!("#submit"), |_| {})
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(*options.lock(), Some(json!("#submit")));
}

#[tokio::test]
async fn test_ten_requests_share_one_frame() {
    // Long flush delay: only the size threshold can flush
    let config = test_config().batch_delay(Duration::from_secs(5));
    let (sender, receiver) = port_pair(config).await;
    receiver.on_request("echo", |env, res| {
        res.send(env.body)?;
        Ok(())
    });

    let start = Instant::now();
    let calls = (0..10).map(|n| sender.post_request("echo", json!(n)));
    let replies = futures::future::join_all(calls).await;

    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(sender.frames_sent(), 1);
    for (n, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.unwrap(), json!(n));
    }
}

#[tokio::test]
async fn test_spaced_requests_use_separate_frames() {
    let (sender, receiver) = port_pair(test_config()).await;
    receiver.on_request("echo", |env, res| {
        res.send(env.body)?;
        Ok(())
    });

    for n in 0..3 {
        assert_eq!(sender.post_request("echo", json!(n)).await.unwrap(), json!(n));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(sender.frames_sent(), 3);
}

#[tokio::test]
async fn test_disconnect_fails_fast() {
    let (sender, receiver) = port_pair(test_config()).await;
    receiver.on_request("ping", |_, res| {
        res.send(json!("pong"))?;
        Ok(())
    });
    sender.post_request("ping", Value::Null).await.unwrap();

    sender.disconnect().unwrap();

    let start = Instant::now();
    let err = sender.post_request("ping", Value::Null).await.unwrap_err();
    assert!(matches!(err, TetherError::NotConnected));
    assert!(start.elapsed() < Duration::from_millis(100));

    // The receiver heard the disconnect notice
    assert_eq!(receiver.state(), ConnectionState::Disconnected);
    assert_eq!(sender.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_wildcard_handler() {
    let (sender, receiver) = port_pair(test_config()).await;
    receiver.on_request("*", |env, res| {
        res.send(json!({ "handled": env.name }))?;
        Ok(())
    });
    receiver.on_request("exact", |_, res| {
        res.send(json!("exact"))?;
        Ok(())
    });

    assert_eq!(
        sender.post_request("anything.at.all", Value::Null).await.unwrap(),
        json!({"handled": "anything.at.all"})
    );
    assert_eq!(
        sender.post_request("exact", Value::Null).await.unwrap(),
        json!("exact")
    );
}

#[tokio::test]
async fn test_deferred_reply_from_task() {
    let (sender, receiver) = port_pair(test_config()).await;
    receiver.on_request("slow.add", |env, res| {
        let a = env.body["a"].as_i64().unwrap_or(0);
        let b = env.body["b"].as_i64().unwrap_or(0);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = res.send(json!(a + b));
        });
        Ok(())
    });

    let sum = sender
        .post_request("slow.add", json!({"a": 2, "b": 3}))
        .await
        .unwrap();
    assert_eq!(sum, json!(5));
}

#[tokio::test]
async fn test_broadcast_with_two_senders() {
    let hub = BroadcastHub::new();
    let receiver = Receiver::new(test_config());
    receiver.on_request("whoami", |env, res| {
        res.send(json!(env.sender_id))?;
        Ok(())
    });
    receiver.connect(hub.open("bridge")).await.unwrap();

    let first = Sender::new(test_config());
    let second = Sender::new(test_config());
    first.connect(hub.open("bridge")).await.unwrap();
    second.connect(hub.open("bridge")).await.unwrap();

    let (a, b) = tokio::join!(
        first.post_request("whoami", Value::Null),
        second.post_request("whoami", Value::Null)
    );
    assert_eq!(a.unwrap(), json!(first.id()));
    assert_eq!(b.unwrap(), json!(second.id()));
}

#[tokio::test]
async fn test_shared_target_both_endpoints() {
    let target = SharedTarget::new();
    let receiver = Receiver::new(test_config());
    receiver.on_request("ping", |_, res| {
        res.send(json!("pong"))?;
        Ok(())
    });
    receiver.connect(target.clone()).await.unwrap();

    let sender = Sender::new(test_config());
    sender.connect(Target::from(target.clone())).await.unwrap();

    assert_eq!(sender.post_request("ping", Value::Null).await.unwrap(), json!("pong"));

    // Listener targets are left open for other parties
    sender.disconnect().unwrap();
    assert_eq!(target.listener_count(), 0);
}

#[tokio::test]
async fn test_state_receiver_tracks_lifecycle() {
    let (host, _guest) = MessageChannel::new();
    let sender = Sender::new(test_config().disconnect_grace(Duration::from_millis(20)));
    let mut states = sender.state_receiver();
    assert_eq!(*states.borrow(), ConnectionState::Disconnected);

    sender.connect(host).await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

    sender.disconnect().unwrap();
    assert_eq!(sender.state(), ConnectionState::Disconnecting);

    tokio::time::timeout(Duration::from_secs(1), async {
        while *states.borrow_and_update() != ConnectionState::Disconnected {
            states.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
}
