//! # Stream Probe
//!
//! Plays a short scripted call against a running voice-echo-backend and checks the replies.
//!
//! ```text
//! stream_probe [ws-url] [silence-wait-ms]
//! stream_probe ws://localhost:8007 2600
//! ```
//!
//! ## Script:
//! 1. `connected`, `start`, two `media` frames, a `dtmf` and a `mark`
//! 2. Wait past the server's silence threshold so the two frames are echoed back
//! 3. `clear`, then `stop`
//!
//! Exits non-zero if an acknowledgement or echo is missing.

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

const STREAM_SID: &str = "probe_stream_0001";
const DEFAULT_URL: &str = "ws://localhost:8007";
const DEFAULT_SILENCE_WAIT_MS: u64 = 2600;

fn script_before_silence() -> Vec<Value> {
    vec![
        json!({"event": "connected"}),
        json!({
            "event": "start",
            "sequence_number": 1,
            "stream_sid": STREAM_SID,
            "start": {
                "stream_sid": STREAM_SID,
                "call_sid": "probe_call_0001",
                "account_sid": "probe_account",
                "from": "+15550000001",
                "to": "+15550000002",
                "media_format": {"encoding": "raw/slin", "sample_rate": "8000", "bit_rate": "16"}
            }
        }),
        json!({
            "event": "media",
            "sequence_number": 2,
            "stream_sid": STREAM_SID,
            "media": {"chunk": 1, "timestamp": "100", "payload": "cHJvYmVfYXVkaW9fY2h1bmtfMQ=="}
        }),
        json!({
            "event": "media",
            "sequence_number": 3,
            "stream_sid": STREAM_SID,
            "media": {"chunk": 2, "timestamp": "200", "payload": "cHJvYmVfYXVkaW9fY2h1bmtfMg=="}
        }),
        json!({
            "event": "dtmf",
            "sequence_number": 4,
            "stream_sid": STREAM_SID,
            "dtmf": {"digit": "1", "duration": "100"}
        }),
        json!({
            "event": "mark",
            "sequence_number": 5,
            "stream_sid": STREAM_SID,
            "mark": {"name": "probe_mark"}
        }),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let url = args.next().unwrap_or_else(|| DEFAULT_URL.to_string());
    let silence_wait = match args.next() {
        Some(ms) => Duration::from_millis(ms.parse().context("silence wait must be milliseconds")?),
        None => Duration::from_millis(DEFAULT_SILENCE_WAIT_MS),
    };

    info!("Connecting to {}", url);
    let (ws_stream, _response) = connect_async(url.as_str())
        .await
        .with_context(|| format!("cannot connect to {}", url))?;
    let (mut sender, mut receiver) = ws_stream.split();

    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Value>();
    let reader = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                    Ok(frame) => {
                        info!("⬅️  {}", frame);
                        let _ = frames_tx.send(frame);
                    }
                    Err(e) => warn!("Non-JSON text frame ({}): {}", e, text),
                },
                Ok(Message::Close(frame)) => {
                    info!("Server closed the stream: {:?}", frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Read error: {}", e);
                    break;
                }
            }
        }
    });

    for event in script_before_silence() {
        info!("➡️  {}", event["event"]);
        sender.send(Message::Text(event.to_string())).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    info!("Waiting {:?} for the silence threshold", silence_wait);
    tokio::time::sleep(silence_wait).await;

    info!("➡️  clear");
    sender
        .send(Message::Text(json!({"event": "clear", "stream_sid": STREAM_SID}).to_string()))
        .await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    info!("➡️  stop");
    let stop = json!({
        "event": "stop",
        "stream_sid": STREAM_SID,
        "stop": {"call_sid": "probe_call_0001", "account_sid": "probe_account", "reason": "callended"}
    });
    sender.send(Message::Text(stop.to_string())).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let _ = sender.send(Message::Close(None)).await;

    if tokio::time::timeout(Duration::from_secs(2), reader).await.is_err() {
        warn!("Server did not close the stream, giving up on the reader");
    }

    let mut frames = Vec::new();
    while let Ok(frame) = frames_rx.try_recv() {
        frames.push(frame);
    }

    let missing = missing_replies(&frames);
    if !missing.is_empty() {
        bail!("{} frames received, missing: {}", frames.len(), missing.join(", "));
    }

    info!("✅ All {} expected replies received", frames.len());
    Ok(())
}

/// Everything the script should have provoked, in no particular order.
fn missing_replies(frames: &[Value]) -> Vec<&'static str> {
    let has = |pred: &dyn Fn(&Value) -> bool| frames.iter().any(pred);
    let mut missing = Vec::new();

    if !has(&|f: &Value| f["event"] == "dtmf" && f["dtmf"]["digit"] == "1") {
        missing.push("dtmf ack");
    }
    if !has(&|f: &Value| f["event"] == "mark" && f["mark"]["name"] == "probe_mark") {
        missing.push("mark ack");
    }
    if !has(&|f: &Value| f["event"] == "clear") {
        missing.push("clear ack");
    }

    let echoed: Vec<&Value> = frames
        .iter()
        .filter(|f| f["event"] == "media")
        .map(|f| &f["media"]["chunk"])
        .collect();
    if echoed != [&json!(1), &json!(2)] {
        missing.push("media echoes of chunks 1 and 2");
    }

    missing
}
