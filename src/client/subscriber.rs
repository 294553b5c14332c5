//! Subscriber front-end
//!
//! Runs a `NatsConnector` on a background task and reports traffic through
//! an event channel.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

use super::config::ClientConfig;
use super::connector::NatsConnector;
use super::engine::ClientEvent;

/// Requests from the handle to the connection task
#[derive(Debug)]
enum Command {
    Subscribe(Bytes),
    Unsubscribe(Bytes),
    Publish {
        subject: Bytes,
        reply: Option<Bytes>,
        payload: Bytes,
    },
    Close,
}

/// Pub/sub client with a background connection task
///
/// # Example
/// ```no_run
/// use natsmd_rs::client::{ClientConfig, ClientEvent, NatsSubscriber};
///
/// # async fn example() -> natsmd_rs::error::Result<()> {
/// let config = ClientConfig::new("127.0.0.1", 4222).name("reader");
/// let (mut subscriber, mut events) = NatsSubscriber::new(config);
///
/// subscriber.connect().await?;
/// subscriber.subscribe("news.>").await?;
///
/// while let Some(event) = events.recv().await {
///     if let ClientEvent::Message { subject, payload, .. } = event {
///         println!("{:?}: {} bytes", subject, payload.len());
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct NatsSubscriber {
    config: ClientConfig,
    event_tx: mpsc::Sender<ClientEvent>,
    commands: Option<mpsc::Sender<Command>>,
    task: Option<JoinHandle<()>>,
}

impl NatsSubscriber {
    /// Create a new subscriber.
    ///
    /// Returns the subscriber and a receiver for events.
    pub fn new(config: ClientConfig) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (tx, rx) = mpsc::channel(config.event_channel_capacity);

        let subscriber = Self {
            config,
            event_tx: tx,
            commands: None,
            task: None,
        };

        (subscriber, rx)
    }

    /// Connect to the server and start the connection task.
    pub async fn connect(&mut self) -> Result<()> {
        let (connector, info) = NatsConnector::connect(self.config.clone()).await?;
        let _ = self.event_tx.send(ClientEvent::Connected(info)).await;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let events = self.event_tx.clone();
        self.task = Some(tokio::spawn(drive(connector, cmd_rx, events)));
        self.commands = Some(cmd_tx);
        Ok(())
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        let commands = self.commands.as_ref().ok_or(Error::ConnectionClosed)?;
        commands.send(cmd).await.map_err(|_| Error::ConnectionClosed)
    }

    /// Subscribe to a subject or wildcard pattern.
    pub async fn subscribe(&self, subject: impl Into<Bytes>) -> Result<()> {
        self.send(Command::Subscribe(subject.into())).await
    }

    /// Drop a subscription.
    pub async fn unsubscribe(&self, subject: impl Into<Bytes>) -> Result<()> {
        self.send(Command::Unsubscribe(subject.into())).await
    }

    /// Publish a payload, fragmenting it if the server requires.
    pub async fn publish(
        &self,
        subject: impl Into<Bytes>,
        reply: Option<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.send(Command::Publish {
            subject: subject.into(),
            reply,
            payload: payload.into(),
        })
        .await
    }

    /// Disconnect from the server.
    pub async fn disconnect(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Close).await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Check if the connection task is running.
    pub fn is_connected(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

async fn apply<S>(connector: &mut NatsConnector<S>, cmd: Command) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match cmd {
        Command::Subscribe(subject) => connector.subscribe(&subject).await.map(|_| ()),
        Command::Unsubscribe(subject) => connector.unsubscribe(&subject).await.map(|_| ()),
        Command::Publish {
            subject,
            reply,
            payload,
        } => {
            connector
                .publish(&subject, reply.as_deref(), payload)
                .await?;
            connector.flush().await
        }
        Command::Close => Ok(()),
    }
}

async fn drive<S>(
    mut connector: NatsConnector<S>,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ClientEvent>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut batch = Vec::new();

    loop {
        tokio::select! {
            read = connector.read_some() => {
                let result = match read {
                    Ok(_) => match connector.process(&mut batch) {
                        Ok(()) => connector.flush().await,
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                };
                for event in batch.drain(..) {
                    let _ = events.send(event).await;
                }
                if let Err(e) = result {
                    if !matches!(e, Error::ConnectionClosed) {
                        let _ = events.send(ClientEvent::Error(e.to_string())).await;
                    }
                    break;
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(Command::Close) | None => break,
                    Some(cmd) => {
                        if let Err(e) = apply(&mut connector, cmd).await {
                            tracing::warn!(error = %e, "Client command failed");
                            let _ = events.send(ClientEvent::Error(e.to_string())).await;
                            if matches!(e, Error::Io(_) | Error::ConnectionClosed) {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    if let Err(e) = connector.close().await {
        tracing::debug!(error = %e, "Close failed");
    }
    let _ = events.send(ClientEvent::Disconnected).await;
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio_test::io::Builder;

    use super::*;

    #[tokio::test]
    async fn test_drive_reports_remote_error() {
        let config = ClientConfig::default();
        let mut connect = BytesMut::new();
        crate::protocol::encoder::write_connect(&mut connect, &config.connect_options()).unwrap();

        let mock = Builder::new()
            .read(b"INFO {\"server_id\":\"S\"}\r\n")
            .write(&connect)
            .read(b"-ERR 'Authorization Violation'\r\n")
            .build();
        let (connector, _) = NatsConnector::handshake(mock, config).await.unwrap();

        let (_cmd_tx, cmd_rx) = mpsc::channel(4);
        let (ev_tx, mut ev_rx) = mpsc::channel(8);
        drive(connector, cmd_rx, ev_tx).await;

        assert!(matches!(ev_rx.recv().await, Some(ClientEvent::Error(t)) if t.contains("Authorization Violation")));
        assert_eq!(ev_rx.recv().await, Some(ClientEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_commands_before_connect_fail() {
        let (subscriber, _events) = NatsSubscriber::new(ClientConfig::default());
        assert!(matches!(
            subscriber.subscribe("a").await,
            Err(Error::ConnectionClosed)
        ));
        assert!(!subscriber.is_connected());
    }
}
