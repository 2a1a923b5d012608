//! Stress tests for pathological cases
//!
//! These tests verify batching keeps up under load and that concurrent
//! callers on several threads never see each other's replies.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether::{BroadcastHub, MessageChannel, Receiver, Responder, Sender, TetherConfig};

fn test_config() -> TetherConfig {
    TetherConfig::new()
        .request_timeout(Duration::from_secs(5))
        .disconnect_grace(Duration::ZERO)
}

async fn echo_pair(config: TetherConfig) -> (Sender, Receiver) {
    let (host, guest) = MessageChannel::new();
    let receiver = Receiver::new(config.clone());
    receiver.on_request("echo", |env, res| {
        res.send(env.body)?;
        Ok(())
    });
    receiver.connect(guest).await.unwrap();
    let sender = Sender::new(config);
    sender.connect(host).await.unwrap();
    (sender, receiver)
}

/// Test that a burst of requests is coalesced into full batches
#[tokio::test]
async fn test_burst_is_batched() {
    let (sender, _receiver) = echo_pair(test_config()).await;
    let count = 2_000;

    let start = Instant::now();
    let calls = (0..count).map(|n| sender.post_request("echo", json!(n)));
    let replies = futures::future::join_all(calls).await;
    let elapsed = start.elapsed();

    for (n, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.unwrap(), json!(n));
    }

    let frames = sender.frames_sent();
    println!("{} requests in {:?} over {} frames", count, elapsed, frames);
    assert!(frames >= (count / 10) as u64);
    assert!(frames < count as u64 / 2, "batching did not coalesce: {} frames", frames);
    assert_eq!(sender.pending_count(), 0);
}

/// Test that callers on several threads each get their own replies
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_across_threads() {
    let (sender, _receiver) = echo_pair(test_config()).await;

    let tasks: Vec<_> = (0..8)
        .map(|worker| {
            let sender = sender.clone();
            tokio::spawn(async move {
                for seq in 0..200 {
                    let body = json!({ "worker": worker, "seq": seq });
                    let reply = sender.post_request("echo", body.clone()).await.unwrap();
                    assert_eq!(reply, body);
                }
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(sender.pending_count(), 0);
}

/// Test that many subscriptions each receive only their own events
#[tokio::test]
async fn test_many_subscriptions_fan_out() {
    let (sender, receiver) = echo_pair(test_config()).await;

    let feeds: Arc<Mutex<Vec<Responder>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = feeds.clone();
    receiver.on_subscribe("*", move |_, res| {
        sink.lock().push(res);
        Ok(())
    });

    let subscriptions = 100;
    let seen: Arc<Mutex<HashMap<String, Vec<Value>>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut handles = Vec::new();
    for n in 0..subscriptions {
        let name = format!("sensor.{}", n);
        let seen = seen.clone();
        let key = name.clone();
        handles.push(
            sender
                .subscribe(&name, move |event| {
                    seen.lock().entry(key.clone()).or_default().push(event);
                })
                .unwrap(),
        );
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let feeds = feeds.lock().clone();
    assert_eq!(feeds.len(), subscriptions);
    assert_eq!(receiver.active_subscription_count(), subscriptions);

    for round in 0..5 {
        for feed in &feeds {
            feed.send(json!({ "name": feed.name(), "round": round })).unwrap();
        }
    }

    let seen = seen.lock();
    assert_eq!(seen.len(), subscriptions);
    for (name, events) in seen.iter() {
        assert_eq!(events.len(), 5);
        for (round, event) in events.iter().enumerate() {
            assert_eq!(event, &json!({ "name": name, "round": round }));
        }
    }
    drop(seen);

    for handle in handles {
        handle.unsubscribe();
    }
    assert_eq!(sender.subscription_count(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(receiver.active_subscription_count(), 0);
}

/// Test that many senders on one broadcast channel stay isolated
#[tokio::test]
async fn test_many_senders_on_broadcast() {
    let hub = BroadcastHub::new();
    let receiver = Receiver::new(test_config());
    receiver.on_request("whoami", |env, res| {
        res.send(json!(env.sender_id))?;
        Ok(())
    });
    receiver.connect(hub.open("bus")).await.unwrap();

    let mut senders = Vec::new();
    for _ in 0..20 {
        let sender = Sender::new(test_config());
        sender.connect(hub.open("bus")).await.unwrap();
        senders.push(sender);
    }

    let calls = senders.iter().map(|sender| async move {
        let reply = sender.post_request("whoami", Value::Null).await.unwrap();
        assert_eq!(reply, json!(sender.id()));
    });
    futures::future::join_all(calls).await;

    for sender in &senders {
        assert_eq!(sender.pending_count(), 0);
    }
}
