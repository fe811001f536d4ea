//! Connection registry: pending/authenticated tables, device collectives
//! and fan-out.
//!
//! The registry strongly owns every live connection handle; per-socket tasks
//! keep only their connection id and a back-reference to the registry.  All
//! operations take a short-lived lock and never await — socket writes go
//! through each connection's outbound channel, so a slow consumer cannot
//! block fan-out to its siblings.

use crate::auth::{TokenError, TokenVerifier};
use crate::bus::{BusError, CommandBus};
use crate::commands::{DeviceBroadcastCommand, MessageDispatchCommand};
use bytes::Bytes;
use chrono::Utc;
use fabric_protocol::messages::{Device, Failure, Identification, Info};
use fabric_protocol::{error_codes, Frame, ResponseType};
use prost::Message;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub(crate) fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Device details captured at identification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDetails {
    pub name: String,
    pub operating_system: String,
    pub version: String,
    pub ip_address: String,
}

impl From<&Device> for DeviceDetails {
    fn from(device: &Device) -> Self {
        DeviceDetails {
            name: device.name.clone(),
            operating_system: device.operating_system.clone(),
            version: device.version.clone(),
            ip_address: device.ip_address.clone(),
        }
    }
}

/// Sender half of a connection's outbound frame channel; the per-socket
/// writer task drains the other half.
pub type OutboundSender = mpsc::UnboundedSender<Frame>;

/// Registry-owned state for one live connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    unique_identifier: Uuid,
    participant_identifier: Option<String>,
    device: Option<DeviceDetails>,
    outbound: OutboundSender,
}

impl ConnectionHandle {
    fn new(unique_identifier: Uuid, outbound: OutboundSender) -> Self {
        ConnectionHandle {
            unique_identifier,
            participant_identifier: None,
            device: None,
            outbound,
        }
    }

    /// Queue a frame for the writer task.  Best-effort: a closed channel
    /// means the connection is already going away.
    fn send(&self, response_type: ResponseType, payload: Bytes) {
        if self
            .outbound
            .send(Frame::response(response_type, payload))
            .is_err()
        {
            debug!(conn = %self.unique_identifier, "outbound channel closed, dropping frame");
        }
    }
}

/// The set of live connections belonging to one participant.
#[derive(Debug, Default)]
struct DeviceCollective {
    connections: HashMap<Uuid, ConnectionHandle>,
}

impl DeviceCollective {
    fn add_connection(&mut self, handle: ConnectionHandle) {
        self.connections.insert(handle.unique_identifier, handle);
    }

    fn remove_connection(&mut self, unique_identifier: &Uuid) -> Option<ConnectionHandle> {
        self.connections.remove(unique_identifier)
    }

    fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// One write per connection, the source included.
    fn dispatch_to_all(&self, response_type: ResponseType, payload: &Bytes) {
        for handle in self.connections.values() {
            handle.send(response_type, payload.clone());
        }
    }

    /// One write per connection except the originating one.
    fn send_to_other_devices(
        &self,
        source_unique_identifier: &Uuid,
        response_type: ResponseType,
        payload: &Bytes,
    ) {
        for (unique_identifier, handle) in &self.connections {
            if unique_identifier != source_unique_identifier {
                handle.send(response_type, payload.clone());
            }
        }
    }
}

/// Outcome of an identification attempt, for the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Accepted {
        participant_identifier: String,
        device: DeviceDetails,
    },
    /// Rejection was reported to the client; the connection stays pending
    /// until the client (or a transport timeout) closes it.
    Rejected,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("decoding identification payload: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("identification carried no device details")]
    MissingDevice,
}

pub struct ConnectionRegistry {
    pending: RwLock<HashMap<Uuid, ConnectionHandle>>,
    collectives: RwLock<HashMap<String, DeviceCollective>>,
    verifier: Arc<TokenVerifier>,
}

impl ConnectionRegistry {
    pub fn new(verifier: Arc<TokenVerifier>) -> Self {
        ConnectionRegistry {
            pending: RwLock::new(HashMap::new()),
            collectives: RwLock::new(HashMap::new()),
            verifier,
        }
    }

    /// Attach the registry's command handlers to the bus.
    pub fn wire(self: &Arc<Self>, bus: &CommandBus) -> Result<(), BusError> {
        let registry = Arc::clone(self);
        bus.register::<MessageDispatchCommand>(move |command| {
            registry.handle_message_dispatch(command);
        })?;
        let registry = Arc::clone(self);
        bus.register::<DeviceBroadcastCommand>(move |command| {
            registry.handle_device_broadcast(command);
        })?;
        Ok(())
    }

    /// Track a fresh connection and ask it to identify itself.
    pub fn on_connect(&self, unique_identifier: Uuid, outbound: OutboundSender) {
        let handle = ConnectionHandle::new(unique_identifier, outbound);
        handle.send(ResponseType::RequestIdentity, Bytes::new());
        self.pending
            .write()
            .expect("pending table poisoned")
            .insert(unique_identifier, handle);
        debug!(conn = %unique_identifier, "connection added to pending identification");
    }

    /// Process an IDENTITY payload for a pending connection.
    ///
    /// Token failures are soft: the client gets an IDENTITY_REJECTION and
    /// the connection leaves the pending table.  Payloads that do not decode
    /// are hard errors and close the connection.
    pub fn register(
        &self,
        unique_identifier: Uuid,
        payload: &[u8],
    ) -> Result<RegisterOutcome, RegistryError> {
        let identification = Identification::decode(payload)?;
        let device = identification
            .device
            .as_ref()
            .map(DeviceDetails::from)
            .ok_or(RegistryError::MissingDevice)?;

        let claims = match self.verifier.verify(&identification.token) {
            Ok(claims) => claims,
            Err(error) => {
                self.reject(unique_identifier, error);
                return Ok(RegisterOutcome::Rejected);
            }
        };
        let Some(participant_identifier) = claims.jti.clone() else {
            warn!(conn = %unique_identifier, "token carried no participant identifier");
            self.reject(unique_identifier, TokenError::Malformed);
            return Ok(RegisterOutcome::Rejected);
        };

        let Some(mut handle) = self
            .pending
            .write()
            .expect("pending table poisoned")
            .remove(&unique_identifier)
        else {
            // Already removed (e.g. the transport closed mid-registration).
            return Ok(RegisterOutcome::Rejected);
        };
        handle.participant_identifier = Some(participant_identifier.clone());
        handle.device = Some(device.clone());

        let welcome = Info {
            message: "IDENTITY-ACCEPTED".to_owned(),
            details: "Your identity has been successfully validated".to_owned(),
            occurred_at: now_millis(),
        };
        handle.send(
            ResponseType::IdentityAccepted,
            Bytes::from(welcome.encode_to_vec()),
        );

        self.collectives
            .write()
            .expect("collective table poisoned")
            .entry(participant_identifier.clone())
            .or_default()
            .add_connection(handle);
        info!(
            conn = %unique_identifier,
            participant = %participant_identifier,
            "identification accepted"
        );
        Ok(RegisterOutcome::Accepted {
            participant_identifier,
            device,
        })
    }

    fn reject(&self, unique_identifier: Uuid, error: TokenError) {
        let failure = Failure {
            error: error_codes::IDENTITY_REJECTED.to_owned(),
            details: error.details().to_owned(),
            occurred_at: now_millis(),
        };
        let mut pending = self.pending.write().expect("pending table poisoned");
        if let Some(handle) = pending.remove(&unique_identifier) {
            handle.send(
                ResponseType::IdentityRejection,
                Bytes::from(failure.encode_to_vec()),
            );
        }
        warn!(conn = %unique_identifier, reason = %error, "identification rejected");
    }

    /// Drop a connection from whichever table holds it.
    ///
    /// Sends DISCONNECTION_ACCEPTED on a best-effort basis first.  Removing
    /// a connection that is already gone is a no-op, so transport close
    /// after an explicit DISCONNECT does no harm.
    pub fn remove(&self, unique_identifier: Uuid, participant_hint: Option<&str>) {
        let farewell = Info {
            message: "CONNECTION ENDED".to_owned(),
            details: "We are initiating a disconnection sequence for your connection".to_owned(),
            occurred_at: now_millis(),
        };
        self.remove_inner(
            unique_identifier,
            participant_hint,
            Some(Bytes::from(farewell.encode_to_vec())),
        );
    }

    /// Removal without the farewell notice.  Protocol violations close the
    /// connection with no response.
    pub fn remove_silently(&self, unique_identifier: Uuid, participant_hint: Option<&str>) {
        self.remove_inner(unique_identifier, participant_hint, None);
    }

    fn remove_inner(
        &self,
        unique_identifier: Uuid,
        participant_hint: Option<&str>,
        farewell: Option<Bytes>,
    ) {
        if let Some(handle) = self
            .pending
            .write()
            .expect("pending table poisoned")
            .remove(&unique_identifier)
        {
            if let Some(payload) = farewell {
                handle.send(ResponseType::DisconnectionAccepted, payload);
            }
            info!(conn = %unique_identifier, "pending connection removed");
            return;
        }

        let mut collectives = self.collectives.write().expect("collective table poisoned");
        let key = match participant_hint {
            Some(participant) => collectives
                .contains_key(participant)
                .then(|| participant.to_owned()),
            None => collectives
                .iter()
                .find(|(_, collective)| collective.connections.contains_key(&unique_identifier))
                .map(|(participant, _)| participant.clone()),
        };
        let Some(participant) = key else {
            debug!(conn = %unique_identifier, "remove for an untracked connection is a no-op");
            return;
        };
        if let Some(collective) = collectives.get_mut(&participant) {
            if let Some(handle) = collective.remove_connection(&unique_identifier) {
                if let Some(payload) = farewell {
                    handle.send(ResponseType::DisconnectionAccepted, payload);
                }
                info!(conn = %unique_identifier, participant = %participant, "connection removed");
            }
            if collective.is_empty() {
                collectives.remove(&participant);
                debug!(participant = %participant, "empty collective deleted");
            }
        }
    }

    fn handle_message_dispatch(&self, command: &MessageDispatchCommand) {
        let collectives = self.collectives.read().expect("collective table poisoned");
        match collectives.get(&command.participant_identifier) {
            Some(collective) => {
                collective.dispatch_to_all(command.response_type, &command.payload);
            }
            None => error!(
                participant = %command.participant_identifier,
                "dispatch for a participant with no local collective; \
                 cross-node routing must happen before dispatch"
            ),
        }
    }

    fn handle_device_broadcast(&self, command: &DeviceBroadcastCommand) {
        let collectives = self.collectives.read().expect("collective table poisoned");
        match collectives.get(&command.participant_identifier) {
            Some(collective) => collective.send_to_other_devices(
                &command.source_unique_identifier,
                command.response_type,
                &command.payload,
            ),
            None => warn!(
                participant = %command.participant_identifier,
                "device broadcast for a participant with no local collective"
            ),
        }
    }

    /// Number of connections awaiting identification.
    pub fn pending_count(&self) -> usize {
        self.pending.read().expect("pending table poisoned").len()
    }

    /// Number of live connections in a participant's collective.
    pub fn collective_size(&self, participant_identifier: &str) -> usize {
        self.collectives
            .read()
            .expect("collective table poisoned")
            .get(participant_identifier)
            .map_or(0, |collective| collective.connections.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_test_utils::{mint_token, TEST_RSA_PUBLIC_PEM};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn registry() -> Arc<ConnectionRegistry> {
        let verifier =
            Arc::new(TokenVerifier::from_pem(TEST_RSA_PUBLIC_PEM.as_bytes()).expect("test key"));
        Arc::new(ConnectionRegistry::new(verifier))
    }

    fn identification(token: &str) -> Vec<u8> {
        Identification {
            token: token.to_owned(),
            device: Some(Device {
                name: "laptop".to_owned(),
                operating_system: "linux".to_owned(),
                version: "6.1".to_owned(),
                ip_address: "10.0.0.1".to_owned(),
            }),
        }
        .encode_to_vec()
    }

    fn connect(registry: &ConnectionRegistry) -> (Uuid, UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let unique_identifier = Uuid::new_v4();
        registry.on_connect(unique_identifier, tx);
        (unique_identifier, rx)
    }

    fn expect_frame(rx: &mut UnboundedReceiver<Frame>, response_type: ResponseType) -> Frame {
        let frame = rx.try_recv().expect("a frame should be queued");
        assert_eq!(frame.kind, response_type as u16);
        frame
    }

    #[test]
    fn connect_requests_identity() {
        let registry = registry();
        let (_, mut rx) = connect(&registry);
        expect_frame(&mut rx, ResponseType::RequestIdentity);
        assert_eq!(registry.pending_count(), 1);
    }

    #[test]
    fn accepted_identity_moves_connection_into_collective() {
        let registry = registry();
        let (conn, mut rx) = connect(&registry);
        expect_frame(&mut rx, ResponseType::RequestIdentity);

        let outcome = registry
            .register(conn, &identification(&mint_token("p-1", 3600)))
            .expect("register");
        assert!(matches!(
            outcome,
            RegisterOutcome::Accepted { ref participant_identifier, .. }
                if participant_identifier == "p-1"
        ));
        expect_frame(&mut rx, ResponseType::IdentityAccepted);
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(registry.collective_size("p-1"), 1);
    }

    #[test]
    fn second_device_joins_the_same_collective() {
        let registry = registry();
        let token = mint_token("p-1", 3600);
        for _ in 0..2 {
            let (conn, _rx) = connect(&registry);
            registry
                .register(conn, &identification(&token))
                .expect("register");
        }
        assert_eq!(registry.collective_size("p-1"), 2);
    }

    #[test]
    fn expired_token_is_rejected_with_details() {
        let registry = registry();
        let (conn, mut rx) = connect(&registry);
        expect_frame(&mut rx, ResponseType::RequestIdentity);

        let outcome = registry
            .register(conn, &identification(&mint_token("p-1", -30)))
            .expect("register");
        assert_eq!(outcome, RegisterOutcome::Rejected);

        let frame = expect_frame(&mut rx, ResponseType::IdentityRejection);
        let failure = Failure::decode(&frame.payload[..]).expect("failure payload");
        assert_eq!(failure.error, error_codes::IDENTITY_REJECTED);
        assert_eq!(failure.details, "This token is already expired");
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(registry.collective_size("p-1"), 0);
    }

    #[test]
    fn garbage_identification_payload_is_a_hard_error() {
        let registry = registry();
        let (conn, _rx) = connect(&registry);
        assert!(registry.register(conn, b"\xFF\xFF\xFF").is_err());
    }

    #[test]
    fn remove_is_idempotent_and_deletes_empty_collectives() {
        let registry = registry();
        let (conn, _rx) = connect(&registry);
        registry
            .register(conn, &identification(&mint_token("p-1", 3600)))
            .expect("register");
        assert_eq!(registry.collective_size("p-1"), 1);

        registry.remove(conn, Some("p-1"));
        assert_eq!(registry.collective_size("p-1"), 0);
        // Second removal (transport close after DISCONNECT) is a no-op.
        registry.remove(conn, Some("p-1"));
        registry.remove(conn, None);
    }

    #[test]
    fn silent_removal_sends_no_farewell() {
        let registry = registry();
        let (conn, mut rx) = connect(&registry);
        registry
            .register(conn, &identification(&mint_token("p-1", 3600)))
            .expect("register");
        expect_frame(&mut rx, ResponseType::RequestIdentity);
        expect_frame(&mut rx, ResponseType::IdentityAccepted);

        registry.remove_silently(conn, Some("p-1"));
        assert_eq!(registry.collective_size("p-1"), 0);
        assert!(rx.try_recv().is_err(), "no response on a protocol-violation close");
    }

    #[test]
    fn message_dispatch_writes_exactly_once_per_connection() {
        let registry = registry();
        let token = mint_token("p-1", 3600);
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (conn, mut rx) = connect(&registry);
            registry
                .register(conn, &identification(&token))
                .expect("register");
            expect_frame(&mut rx, ResponseType::RequestIdentity);
            expect_frame(&mut rx, ResponseType::IdentityAccepted);
            receivers.push(rx);
        }

        registry.handle_message_dispatch(&MessageDispatchCommand {
            participant_identifier: "p-1".to_owned(),
            payload: Bytes::from_static(b"payload"),
            response_type: ResponseType::ReceiveDirectMessage,
            sent_at: 1,
        });
        for rx in &mut receivers {
            expect_frame(rx, ResponseType::ReceiveDirectMessage);
            assert!(rx.try_recv().is_err(), "at most one write per connection");
        }
    }

    #[test]
    fn device_broadcast_skips_the_source_connection() {
        let registry = registry();
        let token = mint_token("p-1", 3600);
        let (source, mut source_rx) = connect(&registry);
        registry
            .register(source, &identification(&token))
            .expect("register");
        let (other, mut other_rx) = connect(&registry);
        registry
            .register(other, &identification(&token))
            .expect("register");
        for rx in [&mut source_rx, &mut other_rx] {
            expect_frame(rx, ResponseType::RequestIdentity);
            expect_frame(rx, ResponseType::IdentityAccepted);
        }

        registry.handle_device_broadcast(&DeviceBroadcastCommand {
            participant_identifier: "p-1".to_owned(),
            source_unique_identifier: source,
            response_type: ResponseType::ReceiveDirectMessage,
            payload: Bytes::from_static(b"echo"),
        });
        expect_frame(&mut other_rx, ResponseType::ReceiveDirectMessage);
        assert!(source_rx.try_recv().is_err(), "source must be excluded");
    }
}
