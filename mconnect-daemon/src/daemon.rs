//! Daemon state and the long-running tasks behind each subcommand

use crate::config::Config;
use crate::registry::DeviceRegistry;
use anyhow::{Context, Result};
use mconnect_protocol::{
    Announcer, Connection, ConnectionListener, Connector, DeviceCertificate, DeviceType,
    Discovery, Identity, IncomingConnection, Listener, ListenerConfig, PairingHandler,
    PairingOutcome, ProtocolError,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

/// Main daemon state
pub struct Daemon {
    config: Config,

    /// What we announce and send when dialing
    identity: Identity,

    certificate: DeviceCertificate,
}

impl Daemon {
    /// Create a new daemon, loading or generating the device certificate
    pub fn new(config: Config) -> Result<Self> {
        config
            .ensure_directories()
            .context("Failed to create directories")?;

        let certificate = Self::load_or_generate_certificate(&config)
            .context("Failed to load certificate")?;
        let identity = Self::build_identity(&config);

        info!(
            "Device: {} ({}) type={}",
            identity.device_name, identity.device_id, identity.device_type
        );
        debug!("Certificate fingerprint: {}", certificate.fingerprint);

        Ok(Self {
            config,
            identity,
            certificate,
        })
    }

    /// Load or generate device certificate
    fn load_or_generate_certificate(config: &Config) -> Result<DeviceCertificate> {
        let cert_path = config.certificate_path();
        let key_path = config.private_key_path();

        if cert_path.exists() && key_path.exists() {
            info!("Loading existing certificate from {:?}", cert_path);
            DeviceCertificate::load_from_files(&cert_path, &key_path)
                .context("Failed to load certificate")
        } else {
            info!("Generating new device certificate");
            let cert = DeviceCertificate::generate(config.device_id())
                .context("Failed to generate certificate")?;

            cert.save_to_files(&cert_path, &key_path)
                .context("Failed to save certificate")?;

            info!("Certificate saved to {:?}", cert_path);
            Ok(cert)
        }
    }

    fn build_identity(config: &Config) -> Identity {
        let device_type = DeviceType::parse(&config.device.device_type).unwrap_or_else(|| {
            warn!(
                "Unknown device type '{}', using computer",
                config.device.device_type
            );
            DeviceType::Computer
        });

        Identity::new(
            config.device_id(),
            &config.device.name,
            device_type,
            config.network.tcp_port,
        )
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn certificate(&self) -> &DeviceCertificate {
        &self.certificate
    }

    fn listener_config(&self) -> ListenerConfig {
        let config = ListenerConfig::default();
        if self.config.network.listen_legacy_port {
            config
        } else {
            ListenerConfig::new(config.addr)
        }
    }

    fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.config.network.discovery_interval.max(1))
    }

    /// Announce, track devices and accept connections until `cancel` flips
    pub async fn run(&self, cancel: watch::Receiver<bool>) -> Result<()> {
        let span = info_span!("daemon", device_id = %self.identity.device_id);
        self.run_until_cancelled(cancel).instrument(span).await
    }

    async fn run_until_cancelled(&self, cancel: watch::Receiver<bool>) -> Result<()> {
        let mut listener = Listener::bind(self.listener_config())
            .await
            .context("Failed to start discovery listener")?;
        listener.wait_for_devices(cancel.clone());
        let mut devices = listener.devices();

        let announcer = Announcer::new()
            .await
            .context("Failed to create announcer")?;
        let acceptor = ConnectionListener::bind(
            (Ipv4Addr::UNSPECIFIED, self.config.network.tcp_port),
            &self.certificate,
        )
        .await
        .context("Failed to listen for connections")?;

        let announcing = tokio::spawn(
            announce_loop(
                announcer,
                self.identity.clone(),
                self.announce_interval(),
                cancel.clone(),
            )
            .in_current_span(),
        );
        let accepting = tokio::spawn(
            accept_loop(acceptor, self.config.clone(), cancel.clone()).in_current_span(),
        );

        info!("Daemon running, press Ctrl+C to stop");

        let mut registry = DeviceRegistry::new(&self.identity.device_id);
        while let Some(discovery) = devices.recv().await {
            registry.record(discovery);
        }

        listener.done().await;
        let _ = tokio::join!(announcing, accepting);

        info!("Daemon stopped, {} devices seen", registry.len());
        for discovery in registry.iter() {
            debug!(
                "  - {} ({}) at {}",
                discovery.identity.device_name, discovery.identity.device_id, discovery.from
            );
        }
        Ok(())
    }

    /// Announce and print every newly seen device until `cancel` flips
    pub async fn discover(&self, cancel: watch::Receiver<bool>) -> Result<()> {
        let mut listener = Listener::bind(self.listener_config())
            .await
            .context("Failed to start discovery listener")?;
        listener.wait_for_devices(cancel.clone());
        let mut devices = listener.devices();

        let announcer = Announcer::new()
            .await
            .context("Failed to create announcer")?;
        let announcing = tokio::spawn(announce_loop(
            announcer,
            self.identity.clone(),
            self.announce_interval(),
            cancel,
        ));

        let mut registry = DeviceRegistry::new(&self.identity.device_id);
        while let Some(discovery) = devices.recv().await {
            let line = format_discovery(&discovery);
            if registry.record(discovery) {
                println!("{}", line);
            }
        }

        listener.done().await;
        let _ = announcing.await;
        Ok(())
    }

    /// Dial `address`, optionally request pairing, then serve the connection
    pub async fn connect(
        &self,
        address: &str,
        pair: bool,
        cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        let span = info_span!("connect", address);
        async {
            let connector = Connector::new(self.identity.clone(), &self.certificate)
                .context("Failed to set up TLS")?;
            let connection = connector
                .dial(address)
                .await
                .with_context(|| format!("Failed to connect to {}", address))?;

            info!(
                "Connected to {}, certificate {}",
                connection.remote_addr(),
                connection.peer_fingerprint().unwrap_or("unknown")
            );

            let mut pairing = PairingHandler::new();
            if pair {
                connection
                    .send(&pairing.request_pairing())
                    .await
                    .context("Failed to request pairing")?;
            }

            serve_connection(connection, pairing, cancel).await
        }
        .instrument(span)
        .await
    }
}

/// One line of `discover` output
fn format_discovery(discovery: &Discovery) -> String {
    format!(
        " * {:?} (ID: {}) {}",
        discovery.identity.device_name,
        discovery.identity.device_id,
        discovery.from.ip()
    )
}

/// Resolves once `cancel` reads `true`, never if its sender is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Broadcast our identity every `period`
async fn announce_loop(
    announcer: Announcer,
    identity: Identity,
    period: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancelled(&mut cancel) => break,
            _ = ticker.tick() => {
                if let Err(e) = announcer.announce(&identity).await {
                    warn!("Failed to announce to {}: {}", announcer.target(), e);
                }
            }
        }
    }
    debug!("Announcements stopped");
}

/// Accept connections and hand each one to its own task
///
/// Handshakes run on the per-connection task, so a peer that stalls its
/// handshake does not hold up the next accept.
async fn accept_loop(
    acceptor: ConnectionListener,
    config: Config,
    mut cancel: watch::Receiver<bool>,
) {
    let config = Arc::new(config);
    loop {
        let accepted = tokio::select! {
            _ = cancelled(&mut cancel) => break,
            accepted = acceptor.accept_incoming() => accepted,
        };

        let incoming = match accepted {
            Ok(incoming) => incoming,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };

        let span = info_span!("peer", addr = %incoming.peer_addr());
        tokio::spawn(handle_incoming(incoming, config.clone(), cancel.clone()).instrument(span));
    }
    debug!("Stopped accepting connections");
}

/// Handshake with an accepted peer and serve it if it is allowed
async fn handle_incoming(
    incoming: IncomingConnection,
    config: Arc<Config>,
    mut cancel: watch::Receiver<bool>,
) {
    let peer = incoming.peer_addr();
    let handshake = tokio::select! {
        _ = cancelled(&mut cancel) => return,
        handshake = incoming.handshake() => handshake,
    };

    let (connection, identity) = match handshake {
        Ok(handshake) => handshake,
        Err(e) => {
            warn!("Handshake with {} failed: {}", peer, e);
            return;
        }
    };

    if !config.is_allowed(&identity.device_id) {
        warn!(
            "Refusing connection from {} ({}), not in allowed devices",
            identity.device_name, identity.device_id
        );
        if let Err(e) = connection.close().await {
            debug!("Error closing refused connection: {}", e);
        }
        return;
    }

    let span = info_span!("device", device_id = %identity.device_id);
    if let Err(e) = serve_connection(connection, PairingHandler::new(), cancel)
        .instrument(span)
        .await
    {
        warn!("{:#}", e);
    }
}

/// Feed received packets to `pairing` until the peer closes or `cancel` flips
///
/// Malformed packets are logged and skipped; any other failure ends the
/// connection with an error.
pub async fn serve_connection(
    connection: Connection,
    mut pairing: PairingHandler,
    mut cancel: watch::Receiver<bool>,
) -> Result<()> {
    let peer = connection.remote_addr();

    let result = loop {
        let received = tokio::select! {
            _ = cancelled(&mut cancel) => break Ok(()),
            received = connection.receive() => received,
        };

        let handled = match received {
            Ok(packet) => pairing.handle(&connection, &packet).await,
            Err(e) => Err(e),
        };

        match handled {
            Ok(PairingOutcome::Accepted) => info!("Paired with {}", peer),
            Ok(PairingOutcome::Rejected) => info!("{} declined pairing", peer),
            Ok(PairingOutcome::Ignored) => {}
            Err(ProtocolError::Closed) => {
                info!("Connection to {} closed", peer);
                break Ok(());
            }
            Err(e) if e.is_recoverable() => warn!("Skipping bad packet from {}: {}", peer, e),
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = connection.close().await {
        debug!("Error closing connection to {}: {}", peer, e);
    }
    result.with_context(|| format!("Connection to {} failed", peer))
}

/// Flips to `true` on SIGINT or SIGTERM
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received shutdown signal");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
