//! Per-connection task
//!
//! Pumps socket reads and fabric deliveries through a `NatsService` and
//! writes whatever output it produces.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::route::{Publish, RouteFabric};
use crate::server::config::ServerConfig;
use crate::server::handler::NatsHandler;
use crate::server::service::{NatsService, ServiceEvent};
use crate::session::SessionContext;

/// Fabric deliveries handled per wakeup before output is flushed
const DELIVERY_BATCH: usize = 64;

/// A single client connection
pub struct Connection<S, H: NatsHandler> {
    stream: S,
    service: NatsService,
    deliveries: mpsc::Receiver<Publish>,
    handler: Arc<H>,
    ctx: SessionContext,
    read_buf: BytesMut,
    config: ServerConfig,
}

impl<S, H> Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: NatsHandler,
{
    pub fn new(
        ctx: SessionContext,
        stream: S,
        config: ServerConfig,
        handler: Arc<H>,
        fabric: Arc<dyn RouteFabric>,
        deliveries: mpsc::Receiver<Publish>,
    ) -> Self {
        let service = NatsService::new(ctx.session_id, ctx.peer_addr, &config, fabric);
        Self {
            stream,
            service,
            deliveries,
            handler,
            ctx,
            read_buf: BytesMut::with_capacity(config.read_buffer_size),
            config,
        }
    }

    pub fn service(&self) -> &NatsService {
        &self.service
    }

    /// Run until the peer leaves, the session is closed, or it idles out
    ///
    /// Subscriptions are always released from the fabric before returning.
    pub async fn run(&mut self) -> Result<()> {
        let result = match self.flush().await {
            Ok(()) => self.pump().await,
            Err(e) => Err(e),
        };

        self.service.shutdown();
        self.ctx.stats = self.service.stats();
        self.handler.on_disconnect(&self.ctx).await;

        tracing::debug!(
            session_id = self.ctx.session_id,
            bytes_in = self.ctx.stats.bytes_received,
            bytes_out = self.ctx.stats.bytes_sent,
            msgs_in = self.ctx.stats.msgs_received,
            msgs_out = self.ctx.stats.msgs_sent,
            "Session finished"
        );
        result
    }

    async fn pump(&mut self) -> Result<()> {
        let idle = self.config.idle_timeout;
        let deadline = tokio::time::sleep(idle);
        tokio::pin!(deadline);

        loop {
            if self.service.is_closing() {
                return self.flush().await;
            }

            tokio::select! {
                read = self.stream.read_buf(&mut self.read_buf) => {
                    let n = read?;
                    if n == 0 {
                        tracing::debug!(session_id = self.ctx.session_id, "Peer closed");
                        return Ok(());
                    }
                    deadline.as_mut().reset(Instant::now() + idle);
                    let events = self.service.on_bytes_readable(&mut self.read_buf);
                    self.handle_events(events).await;
                }
                msg = self.deliveries.recv() => {
                    let Some(msg) = msg else {
                        return Err(Error::ConnectionClosed);
                    };
                    self.service.on_publish_from_fabric(&msg);
                    for _ in 1..DELIVERY_BATCH {
                        if self.service.wants_pause() {
                            break;
                        }
                        match self.deliveries.try_recv() {
                            Ok(msg) => {
                                self.service.on_publish_from_fabric(&msg);
                            }
                            Err(_) => break,
                        }
                    }
                }
                _ = &mut deadline, if !idle.is_zero() => {
                    tracing::debug!(session_id = self.ctx.session_id, "Idle timeout");
                    return Err(Error::Timeout);
                }
            }

            let backpressure = self.service.wants_pause();
            self.flush().await?;
            if backpressure {
                // Give receivers a chance to drain their queues
                tokio::task::yield_now().await;
            }
        }
    }

    async fn handle_events(&mut self, events: Vec<ServiceEvent>) {
        for event in events {
            match event {
                ServiceEvent::Connected { opts, implicit } => {
                    self.ctx.with_connect(opts, implicit);
                    if !self.handler.on_connect(&self.ctx).await {
                        tracing::warn!(
                            session_id = self.ctx.session_id,
                            peer = %self.ctx.peer_addr,
                            user = self.ctx.user().unwrap_or(""),
                            "Connection refused by handler"
                        );
                        self.service.reject("Authorization Violation");
                        return;
                    }
                }
                ServiceEvent::Published { subject, delivered } => {
                    if !delivered {
                        tracing::trace!(
                            session_id = self.ctx.session_id,
                            subject = %String::from_utf8_lossy(&subject),
                            "Publish hit a full queue"
                        );
                    }
                }
                ServiceEvent::ProtocolError { .. } => {}
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        if self.service.has_output() {
            let out = self.service.take_output();
            self.stream.write_all(&out).await?;
            self.stream.flush().await?;
        }
        Ok(())
    }
}
