//! Client connection over a byte stream
//!
//! Wraps a `NatsClient` engine around a socket: reads feed the engine,
//! engine output is written back.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::protocol::message::ServerInfo;

use super::config::ClientConfig;
use super::engine::{ClientEvent, NatsClient};

/// Connected client
pub struct NatsConnector<S = TcpStream> {
    stream: S,
    client: NatsClient,
    read_buf: BytesMut,
}

impl NatsConnector<TcpStream> {
    /// Connect over TCP and complete the INFO/CONNECT handshake
    pub async fn connect(config: ClientConfig) -> Result<(Self, ServerInfo)> {
        let addr = config.addr();
        let timeout = config.connect_timeout;

        tracing::info!(addr = %addr, "Connecting");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout)??;
        if config.tcp_nodelay {
            stream.set_nodelay(true)?;
        }

        tokio::time::timeout(timeout, Self::handshake(stream, config))
            .await
            .map_err(|_| Error::Timeout)?
    }
}

impl<S> NatsConnector<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wait for INFO on an open stream, then send CONNECT
    pub async fn handshake(stream: S, config: ClientConfig) -> Result<(Self, ServerInfo)> {
        let read_buf = BytesMut::with_capacity(config.read_buffer_size);
        let mut conn = Self {
            stream,
            client: NatsClient::new(config),
            read_buf,
        };

        let mut events = Vec::new();
        loop {
            conn.read_some().await?;
            conn.process(&mut events)?;
            if let Some(info) = events.iter().find_map(|e| match e {
                ClientEvent::Connected(info) => Some(info.clone()),
                _ => None,
            }) {
                conn.flush().await?;
                return Ok((conn, info));
            }
        }
    }

    pub fn client(&self) -> &NatsClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut NatsClient {
        &mut self.client
    }

    /// Read whatever the socket has; safe to cancel
    pub async fn read_some(&mut self) -> Result<usize> {
        let n = self.stream.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        Ok(n)
    }

    /// Run buffered bytes through the engine
    pub fn process(&mut self, events: &mut Vec<ClientEvent>) -> Result<()> {
        self.client.on_bytes_readable(&mut self.read_buf, events)
    }

    /// Read once, process, and write any replies
    pub async fn next_events(&mut self, events: &mut Vec<ClientEvent>) -> Result<()> {
        self.read_some().await?;
        self.process(events)?;
        self.flush().await
    }

    /// Write pending engine output
    pub async fn flush(&mut self) -> Result<()> {
        if self.client.has_output() {
            let out = self.client.take_output();
            self.stream.write_all(&out).await?;
            self.stream.flush().await?;
        }
        Ok(())
    }

    pub async fn subscribe(&mut self, subject: &[u8]) -> Result<bool> {
        let added = self.client.subscribe(subject)?;
        self.flush().await?;
        Ok(added)
    }

    pub async fn unsubscribe(&mut self, subject: &[u8]) -> Result<bool> {
        let removed = self.client.unsubscribe(subject)?;
        self.flush().await?;
        Ok(removed)
    }

    pub async fn publish(
        &mut self,
        subject: &[u8],
        reply: Option<&[u8]>,
        payload: Bytes,
    ) -> Result<()> {
        self.client.publish(subject, reply, payload)?;
        if self.client.wants_flush() {
            self.flush().await?;
        }
        Ok(())
    }

    /// Flush, close the engine and shut the stream down
    pub async fn close(&mut self) -> Result<()> {
        let flushed = self.flush().await;
        self.client.close();
        self.stream.shutdown().await?;
        flushed
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::io::Builder;

    use super::*;

    const INFO: &[u8] = b"INFO {\"server_id\":\"S\",\"max_payload\":1024}\r\n";

    fn connect_line(config: &ClientConfig) -> Vec<u8> {
        let mut out = BytesMut::new();
        crate::protocol::encoder::write_connect(&mut out, &config.connect_options()).unwrap();
        out.to_vec()
    }

    #[tokio::test]
    async fn test_handshake_and_publish() {
        let config = ClientConfig::default().name("t");
        let mock = Builder::new()
            .read(INFO)
            .write(&connect_line(&config))
            .write(b"SUB news.> -1\r\n")
            .read(b"MSG news.today -1 3\r\nabc\r\n")
            .write(b"PUB news.today 2\r\nok\r\n")
            .build();

        let (mut conn, info) = NatsConnector::handshake(mock, config).await.unwrap();
        assert_eq!(info.server_id, "S");
        assert_eq!(info.max_payload, 1024);

        assert!(conn.subscribe(b"news.>").await.unwrap());

        let mut events = Vec::new();
        conn.next_events(&mut events).await.unwrap();
        assert_eq!(
            events,
            vec![ClientEvent::Message {
                subject: Bytes::from_static(b"news.today"),
                reply: None,
                payload: Bytes::from_static(b"abc"),
            }]
        );

        conn.publish(b"news.today", None, Bytes::from_static(b"ok"))
            .await
            .unwrap();
        conn.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_before_info() {
        let mock = Builder::new().read(b"PING\r\n").build();
        let result = NatsConnector::handshake(mock, ClientConfig::default()).await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }
}
