//! Telemetry Flood Demo - adaptive outbound pipeline under load
//!
//! Floods the pipeline with high-frequency emitter pulses while a trickle of
//! command responses goes out at Critical priority. Watch the queue pressure,
//! downsampling and adaptive rate in the periodic metrics lines.
//!
//! Usage: cargo run --example telemetry_flood -- ws://127.0.0.1:5155/myko

use std::time::Duration;

use forge_outbound::{MessageKind, OutboundClient, PipelineConfig, PipelineEvent, Priority};
use serde_json::json;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("info,forge_outbound=debug"))
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:5155/myko".to_string());

    let config = PipelineConfig::builder()
        .message_rate(30.0, 10)
        .max_queue_length(200)
        .batch_limits(20, 32_768, 25)
        .downsampling(true, 2, 5, 0.6)
        .metrics_interval_secs(2.0)
        .build();

    println!("Connecting to {}...", url);
    let mut client = OutboundClient::connect(&url, config).await?;

    let mut events = client.events().ok_or("event stream already taken")?;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PipelineEvent::StateChanged { from, to } => println!("state: {} -> {}", from, to),
                PipelineEvent::BackoffStarted { attempt, wait } => {
                    println!("backoff #{}: {:.1}s", attempt, wait.as_secs_f64())
                }
                PipelineEvent::Metrics(metrics) => println!("metrics: {}", metrics),
                PipelineEvent::GaveUp { attempts } => println!("gave up after {} attempts", attempts),
                _ => {}
            }
        }
    });

    // 200 emitters pulsing every 10ms: far more than 30 frames/s can carry.
    let producer = client.producer();
    let flood = tokio::spawn(async move {
        for tick in 0u64..1000 {
            for emitter in 0..200 {
                let pulse = json!({
                    "event": "ws:m:set",
                    "data": { "item": { "emitterId": format!("emitter-{}", emitter), "tick": tick } }
                });
                // Unkeyed on purpose so coalescing does not hide the flood.
                let _ = producer.enqueue_value(&pulse, MessageKind::EmitterPulse, "");
            }
            sleep(Duration::from_millis(10)).await;
        }
    });

    for n in 0..20 {
        let response = json!({ "event": "ws:m:set", "data": { "commandId": n, "status": "ok" } });
        client.enqueue(response.to_string(), Priority::Critical, "")?;
        sleep(Duration::from_millis(500)).await;
    }

    flood.await?;
    let dropped = client.shutdown().await?;
    println!("Shut down with {} messages unsent", dropped);
    Ok(())
}
