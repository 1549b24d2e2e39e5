//! Integration Tests for the mconnect protocol engine
//!
//! These tests run the complete flow over loopback: discovery, dial and
//! accept with the TLS upgrade, packet exchange and pairing.

use mconnect_protocol::{
    Announcer, ConnectionConfig, ConnectionListener, Connector, DeviceCertificate, DeviceType,
    Identity, Listener, ListenerConfig, Packet, PairingHandler, PairingOutcome, ProtocolError,
    TlsRole, PACKET_TYPE_PAIR,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Route engine logs to the test harness, `RUST_LOG=debug` to see them
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Helper to create a device identity and its certificate
fn create_test_device(
    id: &str,
    device_type: DeviceType,
    port: u16,
) -> (Identity, DeviceCertificate) {
    init_tracing();
    let identity = Identity::new(id, format!("Test {}", id), device_type, port);
    let certificate =
        DeviceCertificate::generate(id).expect("Failed to generate test certificate");
    (identity, certificate)
}

/// Helper to bind an acceptor on an ephemeral loopback port
async fn create_acceptor(certificate: &DeviceCertificate) -> ConnectionListener {
    ConnectionListener::bind("127.0.0.1:0", certificate)
        .await
        .expect("Failed to bind connection listener")
}

#[tokio::test]
async fn test_dial_and_accept_handshake() {
    let (dialer_identity, dialer_cert) = create_test_device("dialer", DeviceType::Laptop, 1716);
    let (_, acceptor_cert) = create_test_device("acceptor", DeviceType::Phone, 1716);

    let acceptor = create_acceptor(&acceptor_cert).await;
    let addr = acceptor.local_addr().unwrap();

    let accept_task = tokio::spawn(async move { acceptor.accept().await });

    let connector = Connector::new(dialer_identity.clone(), &dialer_cert).unwrap();
    let dialed = timeout(TEST_TIMEOUT, connector.dial(addr))
        .await
        .unwrap()
        .unwrap();
    let (accepted, peer_identity) = timeout(TEST_TIMEOUT, accept_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // The acceptor saw our plaintext identity before TLS
    assert_eq!(peer_identity, dialer_identity);

    // Each side recorded the other's certificate
    assert_eq!(dialed.peer_fingerprint(), Some(acceptor_cert.fingerprint.as_str()));
    assert_eq!(accepted.peer_fingerprint(), Some(dialer_cert.fingerprint.as_str()));
    assert_eq!(dialed.remote_addr(), addr);

    // Packets flow both ways
    dialed
        .send(&Packet::new("kdeconnect.ping", json!({"message": "hello"})))
        .await
        .unwrap();
    let packet = timeout(TEST_TIMEOUT, accepted.receive()).await.unwrap().unwrap();
    assert_eq!(packet.packet_type, "kdeconnect.ping");
    assert_eq!(packet.body, json!({"message": "hello"}));

    accepted
        .send(&Packet::new("kdeconnect.ping", json!({"message": "hi back"})))
        .await
        .unwrap();
    let packet = timeout(TEST_TIMEOUT, dialed.receive()).await.unwrap().unwrap();
    assert_eq!(packet.body, json!({"message": "hi back"}));

    dialed.close().await.unwrap();
    accepted.close().await.unwrap();
}

#[tokio::test]
async fn test_pairing_over_connection() {
    let (dialer_identity, dialer_cert) = create_test_device("pair-a", DeviceType::Computer, 1716);
    let (_, acceptor_cert) = create_test_device("pair-b", DeviceType::Phone, 1716);

    let acceptor = create_acceptor(&acceptor_cert).await;
    let addr = acceptor.local_addr().unwrap();
    let accept_task = tokio::spawn(async move { acceptor.accept().await });

    let connector = Connector::new(dialer_identity, &dialer_cert).unwrap();
    let dialed = connector.dial(addr).await.unwrap();
    let (accepted, _) = accept_task.await.unwrap().unwrap();

    // Acceptor answers whatever pair requests arrive
    let acceptor_side = tokio::spawn(async move {
        let mut pairing = PairingHandler::new();
        loop {
            let packet = accepted.receive().await?;
            if pairing.handle(&accepted, &packet).await? == PairingOutcome::Accepted {
                return Ok::<_, ProtocolError>(pairing.is_paired());
            }
        }
    });

    let mut pairing = PairingHandler::new();
    dialed.send(&pairing.request_pairing()).await.unwrap();

    let answer = timeout(TEST_TIMEOUT, dialed.receive()).await.unwrap().unwrap();
    assert!(answer.is_type(PACKET_TYPE_PAIR));
    let outcome = pairing.handle(&dialed, &answer).await.unwrap();
    assert_eq!(outcome, PairingOutcome::Accepted);
    assert!(pairing.is_paired());

    let acceptor_paired = timeout(TEST_TIMEOUT, acceptor_side)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(acceptor_paired);

    // Our answer was not echoed back: the next thing we see is the close
    dialed.close().await.unwrap();
}

#[tokio::test]
async fn test_pairing_rejected() {
    let (dialer_identity, dialer_cert) = create_test_device("reject-a", DeviceType::Laptop, 1716);
    let (_, acceptor_cert) = create_test_device("reject-b", DeviceType::Tablet, 1716);

    let acceptor = create_acceptor(&acceptor_cert).await;
    let addr = acceptor.local_addr().unwrap();
    let accept_task = tokio::spawn(async move { acceptor.accept().await });

    let dialed = Connector::new(dialer_identity, &dialer_cert)
        .unwrap()
        .dial(addr)
        .await
        .unwrap();
    let (accepted, _) = accept_task.await.unwrap().unwrap();

    let mut pairing = PairingHandler::new();
    dialed.send(&pairing.request_pairing()).await.unwrap();

    let request = accepted.receive().await.unwrap();
    assert!(request.is_type(PACKET_TYPE_PAIR));
    accepted
        .send(&mconnect_protocol::PairPacket::reject())
        .await
        .unwrap();

    let answer = timeout(TEST_TIMEOUT, dialed.receive()).await.unwrap().unwrap();
    let outcome = pairing.handle(&dialed, &answer).await.unwrap();
    assert_eq!(outcome, PairingOutcome::Rejected);
    assert!(!pairing.is_paired());
}

#[tokio::test]
async fn test_close_aborts_pending_receive() {
    let (dialer_identity, dialer_cert) = create_test_device("close-a", DeviceType::Laptop, 1716);
    let (_, acceptor_cert) = create_test_device("close-b", DeviceType::Phone, 1716);

    let acceptor = create_acceptor(&acceptor_cert).await;
    let addr = acceptor.local_addr().unwrap();
    let accept_task = tokio::spawn(async move { acceptor.accept().await });

    let dialed = Arc::new(
        Connector::new(dialer_identity, &dialer_cert)
            .unwrap()
            .dial(addr)
            .await
            .unwrap(),
    );
    let (accepted, _) = accept_task.await.unwrap().unwrap();

    let pending = {
        let dialed = dialed.clone();
        tokio::spawn(async move { dialed.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    dialed.close().await.unwrap();
    let result = timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(ProtocolError::Closed)));

    // The peer sees the shutdown as a clean close
    let result = timeout(TEST_TIMEOUT, accepted.receive()).await.unwrap();
    assert!(matches!(result, Err(ProtocolError::Closed)));
}

#[tokio::test]
async fn test_matching_roles_fail_handshake() {
    let (dialer_identity, dialer_cert) = create_test_device("role-a", DeviceType::Laptop, 1716);
    let (_, acceptor_cert) = create_test_device("role-b", DeviceType::Phone, 1716);

    let config = ConnectionConfig {
        handshake_timeout: Duration::from_millis(500),
        ..ConnectionConfig::default()
    };

    // Acceptor expects the default dialer role, the dialer plays client too
    let acceptor = create_acceptor(&acceptor_cert)
        .await
        .with_config(config.clone());
    let addr = acceptor.local_addr().unwrap();
    let accept_task = tokio::spawn(async move { acceptor.accept().await });

    let connector = Connector::new(dialer_identity, &dialer_cert)
        .unwrap()
        .with_config(ConnectionConfig {
            tls_role: TlsRole::Client,
            ..config
        });

    assert!(timeout(TEST_TIMEOUT, connector.dial(addr)).await.unwrap().is_err());
    assert!(timeout(TEST_TIMEOUT, accept_task)
        .await
        .unwrap()
        .unwrap()
        .is_err());
}

#[tokio::test]
async fn test_discover_then_connect() {
    let (peer_identity, peer_cert) = create_test_device("discoverable", DeviceType::Phone, 0);
    let (our_identity, our_cert) = create_test_device("seeker", DeviceType::Computer, 1716);

    // Peer accepts connections and advertises the port it got
    let acceptor = create_acceptor(&peer_cert).await;
    let tcp_port = acceptor.local_addr().unwrap().port();
    let peer_identity = Identity {
        tcp_port,
        ..peer_identity
    };
    let accept_task = tokio::spawn(async move { acceptor.accept().await });

    let mut listener = Listener::bind(ListenerConfig::new("127.0.0.1:0".parse().unwrap()))
        .await
        .unwrap();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    listener.wait_for_devices(cancel_rx);
    let mut devices = listener.devices();

    Announcer::bind(listener.local_addr().unwrap())
        .await
        .unwrap()
        .announce(&peer_identity)
        .await
        .unwrap();

    let discovery = timeout(TEST_TIMEOUT, devices.recv()).await.unwrap().unwrap();
    assert_eq!(discovery.identity, peer_identity);

    let target = (discovery.from.ip(), discovery.identity.tcp_port);
    let connection = Connector::new(our_identity.clone(), &our_cert)
        .unwrap()
        .dial(target)
        .await
        .unwrap();
    let (_, seen) = accept_task.await.unwrap().unwrap();
    assert_eq!(seen, our_identity);

    connection.close().await.unwrap();
    cancel_tx.send(true).unwrap();
    timeout(TEST_TIMEOUT, listener.done()).await.unwrap();
}
