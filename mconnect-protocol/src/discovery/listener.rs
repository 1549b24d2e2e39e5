//! Discovery listener
//!
//! [`Listener::receive`] returns one announcement at a time.
//! [`Listener::wait_for_devices`] runs the receive loop in the background and
//! hands results over a queue of capacity one:
//!
//! ```text
//!   UDP 1716 ─┐
//!             ├─▶ receive loop ──▶ mpsc(1) ──▶ devices()
//!   UDP 1714 ─┘        │
//!                      └─ on Closed, or repeated socket errors: done fires once
//!
//!   cancel watch ──▶ close() ──▶ pending receive returns Closed
//! ```

use super::{Discovery, DISCOVERY_BUFFER_SIZE};
use crate::ports::{DISCOVERY_PORT, LEGACY_DISCOVERY_PORT};
use crate::{unmarshal, Identity, ProtocolError, Result};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn, Instrument, Span};

/// Addresses a [`Listener`] binds to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Primary discovery address, failing to bind it is an error
    pub addr: SocketAddr,

    /// Legacy discovery address, failing to bind it is only logged
    pub legacy_addr: Option<SocketAddr>,
}

impl ListenerConfig {
    /// Listen on `addr` only
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            legacy_addr: None,
        }
    }

    /// Also listen on `addr` for announcements from older peers
    pub fn with_legacy(mut self, addr: SocketAddr) -> Self {
        self.legacy_addr = Some(addr);
        self
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::new((Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT).into())
            .with_legacy((Ipv4Addr::UNSPECIFIED, LEGACY_DISCOVERY_PORT).into())
    }
}

/// Consecutive socket errors after which the receive loop gives up
const MAX_RECEIVE_FAILURES: u32 = 8;

/// Delay after the first socket error, doubled for each one that follows
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Tracks consecutive socket errors in the receive loop
#[derive(Debug, Default)]
struct ReceiveFailures {
    count: u32,
}

impl ReceiveFailures {
    /// Record a socket error, returns how long to wait before receiving
    /// again or `None` once the loop should stop
    fn record(&mut self) -> Option<Duration> {
        self.count += 1;
        if self.count >= MAX_RECEIVE_FAILURES {
            return None;
        }
        Some(RECEIVE_RETRY_DELAY * 2u32.pow(self.count - 1))
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

struct Inner {
    primary: UdpSocket,
    legacy: Option<UdpSocket>,
    closed: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

impl Inner {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("Discovery listener closed");
        }
    }

    /// Resolves once the listener is closed
    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn receive(&self) -> Result<Discovery> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }

        let mut buf = [0u8; DISCOVERY_BUFFER_SIZE];
        let mut legacy_buf = [0u8; DISCOVERY_BUFFER_SIZE];

        let (len, from, legacy) = tokio::select! {
            _ = self.wait_closed() => return Err(ProtocolError::Closed),
            res = self.primary.recv_from(&mut buf) => {
                let (len, from) = res
                    .map_err(|e| ProtocolError::transport("failed to receive datagram", e))?;
                (len, from, false)
            }
            res = recv_optional(self.legacy.as_ref(), &mut legacy_buf) => {
                let (len, from) = res
                    .map_err(|e| ProtocolError::transport("failed to receive datagram", e))?;
                (len, from, true)
            }
        };

        let data = if legacy {
            &legacy_buf[..len]
        } else {
            &buf[..len]
        };
        debug!("Received {} bytes from {}", len, from);

        let packet = unmarshal(data)?;
        let identity = Identity::from_packet(&packet)?;

        Ok(Discovery {
            packet,
            identity,
            from,
        })
    }

    fn mark_done(&self) {
        if self.done.send_if_modified(|done| !std::mem::replace(done, true)) {
            debug!("Discovery receive loop finished");
        }
    }
}

async fn recv_optional(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

/// Receives identity announcements from other devices
pub struct Listener {
    inner: Arc<Inner>,
    devices: Option<mpsc::Receiver<Discovery>>,
    started: bool,
    span: Span,
}

impl Listener {
    /// Bind the discovery sockets
    ///
    /// # Errors
    ///
    /// Fails when the primary address cannot be bound. A legacy address that
    /// cannot be bound is logged and skipped.
    pub async fn bind(config: ListenerConfig) -> Result<Self> {
        let primary = UdpSocket::bind(config.addr)
            .await
            .map_err(|e| ProtocolError::transport("failed to bind discovery socket", e))?;
        info!("Listening for announcements on {}", primary.local_addr()?);

        let legacy = match config.legacy_addr {
            Some(addr) => match UdpSocket::bind(addr).await {
                Ok(socket) => {
                    debug!("Listening on legacy discovery address {}", addr);
                    Some(socket)
                }
                Err(e) => {
                    warn!("Failed to bind legacy discovery address {}: {}", addr, e);
                    None
                }
            },
            None => None,
        };

        let (closed, _) = watch::channel(false);
        let (done, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                primary,
                legacy,
                closed,
                done,
            }),
            devices: None,
            started: false,
            span: Span::current(),
        })
    }

    /// Log inside `span` instead of the span current at construction
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Address of the primary discovery socket
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.primary.local_addr()?)
    }

    /// Address of the legacy socket, if it was bound
    pub fn legacy_addr(&self) -> Option<SocketAddr> {
        self.inner
            .legacy
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    /// Wait for one announcement
    ///
    /// Datagrams that are not complete identity packets are returned as
    /// errors. Returns [`ProtocolError::Closed`] once the listener is closed,
    /// including when the close happens while waiting.
    pub async fn receive(&self) -> Result<Discovery> {
        self.inner.receive().instrument(self.span.clone()).await
    }

    /// Start receiving in the background
    ///
    /// Announcements are queued for [`Listener::devices`]. Undecodable
    /// datagrams are logged and skipped. Socket errors are retried with a
    /// growing delay; once too many happen in a row the listener closes
    /// itself. The listener also closes when `cancel` becomes `true`; that,
    /// or [`Listener::close`], ends the loop and fires [`Listener::done`].
    pub fn wait_for_devices(&mut self, cancel: watch::Receiver<bool>) {
        if self.started {
            warn!("Discovery listener already started");
            return;
        }

        let (tx, rx) = mpsc::channel(1);
        self.devices = Some(rx);
        self.started = true;

        let inner = self.inner.clone();
        tokio::spawn(
            async move {
                let mut failures = ReceiveFailures::default();
                loop {
                    match inner.receive().await {
                        Ok(discovery) => {
                            failures.reset();
                            if inner.is_closed() {
                                break;
                            }
                            debug!(
                                "Discovered {} ({}) at {}",
                                discovery.identity.device_name,
                                discovery.identity.device_id,
                                discovery.from
                            );
                            tokio::select! {
                                res = tx.send(discovery) => {
                                    if res.is_err() {
                                        debug!("Discovery consumer went away");
                                        break;
                                    }
                                }
                                _ = inner.wait_closed() => break,
                            }
                        }
                        Err(e) if e.is_closed() => break,
                        Err(e) if e.is_recoverable() => {
                            failures.reset();
                            warn!("Ignoring discovery datagram: {}", e);
                        }
                        Err(e) => match failures.record() {
                            Some(delay) => {
                                warn!("Discovery receive failed, retrying in {:?}: {}", delay, e);
                                tokio::select! {
                                    _ = tokio::time::sleep(delay) => {}
                                    _ = inner.wait_closed() => break,
                                }
                            }
                            None => {
                                warn!("Discovery receive keeps failing, stopping: {}", e);
                                inner.close();
                                break;
                            }
                        },
                    }
                }
                inner.mark_done();
            }
            .instrument(self.span.clone()),
        );

        let inner = self.inner.clone();
        tokio::spawn(
            async move {
                let mut cancel = cancel;
                let cancelled = async move { cancel.wait_for(|cancel| *cancel).await.is_ok() };
                tokio::select! {
                    true = cancelled => {
                        debug!("Discovery cancelled");
                        inner.close();
                    }
                    _ = inner.wait_closed() => {}
                }
            }
            .instrument(self.span.clone()),
        );
    }

    /// Receiver of queued announcements
    ///
    /// # Panics
    ///
    /// Panics when called before [`Listener::wait_for_devices`] or more than
    /// once.
    pub fn devices(&mut self) -> mpsc::Receiver<Discovery> {
        assert!(self.started, "devices() called before wait_for_devices()");
        self.devices
            .take()
            .expect("devices() receiver already taken")
    }

    /// Wait for the background receive loop to finish
    ///
    /// Returns immediately if [`Listener::wait_for_devices`] was never called.
    pub async fn done(&self) {
        if !self.started {
            return;
        }
        let mut done = self.inner.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Close the listener, idempotent
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.inner.close();
    }
}
