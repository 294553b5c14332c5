//! Subscriber example
//!
//! Run with: cargo run --example subscriber -- [HOST] [SUBJECT...]
//!
//! Examples:
//!   cargo run --example subscriber                           # 127.0.0.1, subject '>'
//!   cargo run --example subscriber -- localhost 'foo.>' bar  # two subscriptions
//!
//! Every line typed on stdin is published to `demo.input`.

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};

use natsmd_rs::client::{ClientConfig, ClientEvent, NatsSubscriber};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("natsmd_rs=info".parse()?),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let host = args
        .next()
        .unwrap_or_else(|| "127.0.0.1".to_string())
        .replace("localhost", "127.0.0.1");
    let mut subjects: Vec<String> = args.collect();
    if subjects.is_empty() {
        subjects.push(">".to_string());
    }

    let config = ClientConfig::new(host, 4222).name("subscriber-demo");
    let (mut subscriber, mut events) = NatsSubscriber::new(config);
    subscriber.connect().await?;

    for subject in &subjects {
        subscriber.subscribe(subject.clone()).await?;
        println!("Subscribed to {}", subject);
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Connected(info)) => {
                    println!("Connected to {} (max_payload {})", info.server_id, info.max_payload);
                }
                Some(ClientEvent::Message { subject, reply, payload }) => {
                    println!(
                        "[{}]{} {} bytes: {}",
                        String::from_utf8_lossy(&subject),
                        reply
                            .map(|r| format!(" reply={}", String::from_utf8_lossy(&r)))
                            .unwrap_or_default(),
                        payload.len(),
                        String::from_utf8_lossy(&payload[..payload.len().min(80)])
                    );
                }
                Some(ClientEvent::Error(e)) => eprintln!("Error: {}", e),
                Some(ClientEvent::Disconnected) | None => {
                    println!("Disconnected");
                    break;
                }
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    subscriber.publish("demo.input", None, Bytes::from(line)).await?;
                }
                _ => {
                    stdin_open = false;
                    subscriber.disconnect().await;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                subscriber.disconnect().await;
            }
        }
    }

    Ok(())
}
