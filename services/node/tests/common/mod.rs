//! Shared harness for the node integration suites: boots the full wiring
//! (registry, participant service, command bus, fake pub/sub client,
//! in-memory repositories) behind a real TCP listener, plus a minimal HTTP
//! stub standing in for the account service.
#![allow(dead_code)]

use fabric_protocol::messages::{Device, Identification, Info};
use fabric_protocol::{RequestType, ResponseType};
use fabric_test_utils::{
    mint_token, read_frame, read_frame_of_kind, send_frame, TEST_RSA_PUBLIC_PEM,
};
use node::auth::TokenVerifier;
use node::bus::{CommandBus, LoggingMiddleware};
use node::config::{settings_from_str, Settings};
use node::connection;
use node::participant::ParticipantService;
use node::pubsub::{FakeParticipantClient, ParticipantClient};
use node::registry::ConnectionRegistry;
use node::repo::{
    MemoryMessageRepository, MemoryParticipantRepository, MessageRepository, ParticipantRepository,
};
use prost::Message;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Account-service stub
// ---------------------------------------------------------------------------

/// Serves `GET .../users/details?identifier=…` from an in-memory table.
pub struct AccountStub {
    pub base_url: String,
    accounts: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

impl AccountStub {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        let accounts: Arc<Mutex<HashMap<String, serde_json::Value>>> = Arc::default();
        let table = Arc::clone(&accounts);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(serve_account_request(stream, Arc::clone(&table)));
            }
        });
        AccountStub {
            base_url: format!("http://{addr}"),
            accounts,
        }
    }

    /// Register a resolvable participant with derived nickname/email/photo.
    pub fn add(&self, identifier: &str) {
        self.accounts.lock().expect("accounts").insert(
            identifier.to_owned(),
            serde_json::json!({
                "identifier": identifier,
                "nickname": format!("nick-{identifier}"),
                "email": format!("{identifier}@example.com"),
                "photo_url": format!("https://photos.example/{identifier}.png"),
            }),
        );
    }
}

async fn serve_account_request(
    mut stream: TcpStream,
    table: Arc<Mutex<HashMap<String, serde_json::Value>>>,
) {
    let mut buf = vec![0u8; 4096];
    let mut read = 0;
    loop {
        match stream.read(&mut buf[read..]).await {
            Ok(0) => break,
            Ok(n) => {
                read += n;
                if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") || read == buf.len() {
                    break;
                }
            }
            Err(_) => return,
        }
    }
    let request = String::from_utf8_lossy(&buf[..read]).into_owned();
    let identifier = request
        .split("identifier=")
        .nth(1)
        .and_then(|rest| rest.split([' ', '&']).next())
        .map(str::to_owned);
    let body = identifier.and_then(|id| table.lock().expect("accounts").get(&id).cloned());
    let response = match body {
        Some(json) => {
            let body = json.to_string();
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
        }
        None => {
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_owned()
        }
    };
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

// ---------------------------------------------------------------------------
// Node harness
// ---------------------------------------------------------------------------

pub struct TestNode {
    pub addr: SocketAddr,
    pub registry: Arc<ConnectionRegistry>,
    pub service: Arc<ParticipantService>,
    pub client: Arc<FakeParticipantClient>,
    pub participants: Arc<MemoryParticipantRepository>,
    pub messages: Arc<MemoryMessageRepository>,
    pub accounts: AccountStub,
    shutdown: watch::Sender<bool>,
}

impl TestNode {
    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.expect("connect")
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub async fn start_test_node() -> TestNode {
    let accounts = AccountStub::start().await;
    let yaml = format!(
        r#"
port: 0
node: node-a
account_service_url: "{}"
token_key: "/dev/null"
database: {{ uri: "postgres://unused" }}
nats: {{ servers: ["nats://127.0.0.1:4222"] }}
"#,
        accounts.base_url
    );
    let settings: Arc<Settings> = Arc::new(settings_from_str(&yaml).expect("settings"));

    let verifier =
        Arc::new(TokenVerifier::from_pem(TEST_RSA_PUBLIC_PEM.as_bytes()).expect("test key"));
    let bus = Arc::new(CommandBus::new(vec![Box::new(LoggingMiddleware)]));
    let registry = Arc::new(ConnectionRegistry::new(verifier));
    registry.wire(&bus).expect("wire registry");

    let client = Arc::new(FakeParticipantClient::new());
    let participants = Arc::new(MemoryParticipantRepository::new());
    let messages = Arc::new(MemoryMessageRepository::new());
    let service = ParticipantService::new(
        settings,
        bus,
        Arc::clone(&participants) as Arc<dyn ParticipantRepository>,
        Arc::clone(&messages) as Arc<dyn MessageRepository>,
        Arc::clone(&client) as Arc<dyn ParticipantClient>,
    );
    service.wire();
    client.start_up().await.expect("fake bus start-up");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind node");
    let addr = listener.local_addr().expect("node addr");
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(connection::serve(
        listener,
        Arc::clone(&registry),
        Arc::clone(&service),
        shutdown_rx,
    ));

    TestNode {
        addr,
        registry,
        service,
        client,
        participants,
        messages,
        accounts,
        shutdown,
    }
}

// ---------------------------------------------------------------------------
// Protocol helpers
// ---------------------------------------------------------------------------

pub fn test_device() -> Device {
    Device {
        name: "test-device".to_owned(),
        operating_system: "linux".to_owned(),
        version: "6.1".to_owned(),
        ip_address: "127.0.0.1".to_owned(),
    }
}

pub async fn recv_frame(stream: &mut TcpStream) -> (u16, Vec<u8>) {
    tokio::time::timeout(RECV_TIMEOUT, read_frame(stream))
        .await
        .expect("timed out waiting for a frame")
        .expect("read frame")
}

/// Skip interleaved frames until one of the wanted kind arrives.
pub async fn recv_frame_of_kind(stream: &mut TcpStream, kind: ResponseType) -> Vec<u8> {
    tokio::time::timeout(RECV_TIMEOUT, read_frame_of_kind(stream, kind as u16))
        .await
        .expect("timed out waiting for a frame")
        .expect("read frame")
}

/// Assert that no frame of `kind` arrives within `window`.
pub async fn assert_no_frame_of_kind(stream: &mut TcpStream, kind: ResponseType, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match tokio::time::timeout(remaining, read_frame(stream)).await {
            Err(_) => return,
            Ok(Err(_)) => return,
            Ok(Ok((got, _))) => {
                assert_ne!(got, kind as u16, "unexpected frame of kind {kind:?}");
            }
        }
    }
}

/// Run the identity handshake for `participant_identifier` and assert the
/// acceptance notice.
pub async fn identify(stream: &mut TcpStream, participant_identifier: &str) {
    let (kind, payload) = recv_frame(stream).await;
    assert_eq!(kind, ResponseType::RequestIdentity as u16);
    assert!(payload.is_empty());

    let identification = Identification {
        token: mint_token(participant_identifier, 3600),
        device: Some(test_device()),
    };
    send_frame(
        stream,
        RequestType::Identity as u16,
        &identification.encode_to_vec(),
    )
    .await
    .expect("send identity");

    let payload = recv_frame_of_kind(stream, ResponseType::IdentityAccepted).await;
    let info = Info::decode(&payload[..]).expect("info payload");
    assert_eq!(info.message, "IDENTITY-ACCEPTED");
}

/// Wait for the participant's routing identity to be allocated, cached, and
/// announced on the bus.
pub async fn wait_for_routing(node: &TestNode, participant_identifier: &str) -> String {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(Some(identity)) = node.participants.fetch_identity(participant_identifier).await
        {
            if node
                .client
                .registered_participants()
                .contains(&identity.routing_identifier)
            {
                return identity.routing_identifier;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "routing identity for {participant_identifier} never appeared"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
