//! Tether CLI entry point

mod cli;

use crate::cli::{Cli, Commands, TransportChoice};
use anyhow::{Context, Result};
use clap::Parser;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether::{BroadcastHub, MessageChannel, Receiver, Sender, SharedTarget, Target, TetherConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = TetherConfig::new()
        .request_timeout(Duration::from_millis(cli.timeout_ms))
        .batch_delay(Duration::from_millis(cli.batch_delay_ms))
        .max_batch_size(cli.max_batch);

    let (sender, receiver) = connect_pair(cli.transport, config).await?;

    let outcome = match cli.command {
        Commands::Ping { count } => ping(&sender, &receiver, count).await,
        Commands::Bench { requests } => bench(&sender, &receiver, requests).await,
        Commands::Watch { events, interval_ms } => {
            watch(&sender, &receiver, events, interval_ms).await
        }
    };

    sender.disconnect()?;
    receiver.disconnect()?;
    outcome
}

/// Both ends of the chosen channel kind
fn targets(choice: TransportChoice) -> (Target, Target) {
    match choice {
        TransportChoice::Port => {
            let (host, guest) = MessageChannel::new();
            (host.into(), guest.into())
        }
        TransportChoice::Broadcast => {
            let hub = BroadcastHub::new();
            (hub.open("tether").into(), hub.open("tether").into())
        }
        TransportChoice::Shared => {
            let target = SharedTarget::new();
            (target.clone().into(), target.into())
        }
    }
}

async fn connect_pair(choice: TransportChoice, config: TetherConfig) -> Result<(Sender, Receiver)> {
    let (host, guest) = targets(choice);

    let receiver = Receiver::new(config.clone());
    receiver
        .connect(guest)
        .await
        .context("Failed to connect receiver")?;

    let sender = Sender::new(config);
    sender
        .connect(host)
        .await
        .context("Failed to connect sender")?;

    info!(transport = ?choice, sender = %sender.id(), receiver = %receiver.id(), "Endpoints connected");
    Ok((sender, receiver))
}

async fn ping(sender: &Sender, receiver: &Receiver, count: usize) -> Result<()> {
    receiver.on_request("ping", |env, res| {
        res.send(json!({ "pong": env.body }))?;
        Ok(())
    });

    for seq in 0..count {
        let start = Instant::now();
        let reply = sender
            .post_request("ping", json!(seq))
            .await
            .with_context(|| format!("Ping {} failed", seq))?;
        println!(
            "{} seq={} time={:.3}ms",
            reply,
            seq,
            start.elapsed().as_secs_f64() * 1000.0
        );
    }

    Ok(())
}

async fn bench(sender: &Sender, receiver: &Receiver, requests: usize) -> Result<()> {
    receiver.on_request("echo", |env, res| {
        res.send(env.body)?;
        Ok(())
    });

    let start = Instant::now();
    let calls = (0..requests).map(|n| sender.post_request("echo", json!(n)));
    let results = futures::future::join_all(calls).await;
    let elapsed = start.elapsed();

    let failed = results.iter().filter(|r| r.is_err()).count();
    if let Some(Err(e)) = results.iter().find(|r| r.is_err()) {
        println!("First failure: {}", e);
    }

    println!("Requests:  {}", requests);
    println!("Failed:    {}", failed);
    println!("Frames:    {}", sender.frames_sent());
    println!("Elapsed:   {:.2?}", elapsed);
    println!(
        "Rate:      {:.0} req/s",
        requests as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    Ok(())
}

async fn watch(sender: &Sender, receiver: &Receiver, events: usize, interval_ms: u64) -> Result<()> {
    let tickers: Arc<DashMap<String, JoinHandle<()>>> = Arc::new(DashMap::new());

    let started = tickers.clone();
    receiver.on_subscribe("clock.tick", move |env, res| {
        let interval = env
            .body
            .get("interval_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(100);
        let id = res.id().to_string();

        let task = tokio::spawn(async move {
            let mut tick = 0u64;
            loop {
                tokio::time::sleep(Duration::from_millis(interval)).await;
                tick += 1;
                if res.send(json!({ "tick": tick })).is_err() {
                    break;
                }
            }
        });
        started.insert(id, task);
        Ok(())
    });

    let stopped = tickers.clone();
    receiver.on_unsubscribe("clock.tick", move |env, _| {
        if let Some((_, task)) = stopped.remove(&env.id) {
            task.abort();
        }
        Ok(())
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = sender.subscribe_with(
        "clock.tick",
        json!({ "interval_ms": interval_ms }),
        move |event| {
            let _ = tx.send(event);
        },
    )?;

    let wait = Duration::from_millis(interval_ms.saturating_mul(10).max(1000));
    for _ in 0..events {
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(event)) => println!("{}", event),
            Ok(None) => break,
            Err(_) => anyhow::bail!("No event within {:?}", wait),
        }
    }

    subscription.unsubscribe();

    // Let the unsubscribe batch go out before tearing down
    tokio::time::sleep(sender.config().batch_delay * 2).await;
    println!("Active tickers after unsubscribe: {}", tickers.len());

    Ok(())
}
