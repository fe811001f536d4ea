//! Participant resolution, routing-identity pairing, and message relay.
//!
//! The service keeps three caches: online participants by identifier,
//! email -> participant for contact matching, and routing identity ->
//! participant for inbound addressing.  Cache misses resolve through the
//! account service over HTTP, off the connection scheduling path.
//!
//! Direct messages for a locally attached target are dispatched through the
//! command bus; everything else is passed over the bus to the target's last
//! known node, or answered with a failed delivery acknowledgement when no
//! node claims the target.

use crate::bus::{BusError, CommandBus};
use crate::commands::MessageDispatchCommand;
use crate::config::Settings;
use crate::pubsub::{self, BusEvent, ParticipantClient};
use crate::registry::{now_millis, DeviceDetails};
use crate::repo::{MessageRepository, ParticipantRepository, RepoError};
use bytes::Bytes;
use chrono::Utc;
use fabric_protocol::messages::{
    BatchContactMatchRequest, BatchContactMatchResponse, Contact, ContactType, Delivery,
    DeliveryState, DirectMessage, ParticipantPassOver,
};
use fabric_protocol::{error_codes, ResponseType};
use prost::Message;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Account-service lookups slower than this treat the participant as unknown.
const ACCOUNT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// A resolved participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub identifier: String,
    pub routing_identity: String,
    pub nickname: String,
    pub email: String,
    pub photo_url: String,
}

/// Account-service response body.
#[derive(Debug, Deserialize)]
struct AccountDetails {
    identifier: String,
    nickname: String,
    email: String,
    photo_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("decoding payload: {0}")]
    PayloadDecode(#[from] prost::DecodeError),
    #[error("account lookup: {0}")]
    AccountLookup(String),
    #[error("participant '{0}' is unknown")]
    UnknownParticipant(String),
    #[error("persistence: {0}")]
    Persistence(#[from] RepoError),
    #[error("command dispatch: {0}")]
    Dispatch(#[from] BusError),
}

pub struct ParticipantService {
    settings: Arc<Settings>,
    bus: Arc<CommandBus>,
    participants: Arc<dyn ParticipantRepository>,
    messages: Arc<dyn MessageRepository>,
    client: Arc<dyn ParticipantClient>,
    online: RwLock<HashMap<String, Participant>>,
    contact_pairing: RwLock<HashMap<String, String>>,
    route_pairing: RwLock<HashMap<String, String>>,
    http: reqwest::Client,
}

impl ParticipantService {
    pub fn new(
        settings: Arc<Settings>,
        bus: Arc<CommandBus>,
        participants: Arc<dyn ParticipantRepository>,
        messages: Arc<dyn MessageRepository>,
        client: Arc<dyn ParticipantClient>,
    ) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(ACCOUNT_LOOKUP_TIMEOUT)
            .build()
            .expect("building the account-service HTTP client");
        Arc::new(ParticipantService {
            settings,
            bus,
            participants,
            messages,
            client,
            online: RwLock::new(HashMap::new()),
            contact_pairing: RwLock::new(HashMap::new()),
            route_pairing: RwLock::new(HashMap::new()),
            http,
        })
    }

    /// Register the service's bus subscriptions; call once at startup,
    /// before the pub/sub client starts up.
    pub fn wire(self: &Arc<Self>) {
        let service = Arc::clone(self);
        self.client.register_subscription_handler(
            pubsub::passover_subject(&self.settings.node),
            pubsub::decode_pass_over,
            "ParticipantService",
            Arc::new(move |event| {
                let service = Arc::clone(&service);
                Box::pin(async move {
                    if let BusEvent::PassOver(pass_over) = event {
                        service.on_external_participant_event(pass_over).await;
                    }
                })
            }),
        );
        self.client.register_subscription_handler(
            pubsub::NODE_JOINED_SUBJECT.to_owned(),
            pubsub::decode_node_joined,
            "ParticipantService",
            Arc::new(move |event| {
                Box::pin(async move {
                    if let BusEvent::NodeJoined(joined) = event {
                        info!(node = %joined.identifier, "peer node joined the fabric");
                    }
                })
            }),
        );
    }

    /// Resolve a participant, consulting the account service on a cache miss.
    pub async fn fetch(&self, identifier: &str) -> Result<Participant, ServiceError> {
        if let Some(participant) = self.online.read().await.get(identifier).cloned() {
            return Ok(participant);
        }
        self.fetch_details(identifier).await
    }

    async fn fetch_details(&self, identifier: &str) -> Result<Participant, ServiceError> {
        let url = format!(
            "{}/api/v1/account-service/users/details",
            self.settings.account_service_url
        );
        let response = self
            .http
            .get(&url)
            .query(&[("identifier", identifier)])
            .send()
            .await
            .map_err(|e| ServiceError::AccountLookup(e.to_string()))?;
        if !response.status().is_success() {
            warn!(
                participant = %identifier,
                status = %response.status(),
                "account service did not resolve participant"
            );
            return Err(ServiceError::UnknownParticipant(identifier.to_owned()));
        }
        let details: AccountDetails = response
            .json()
            .await
            .map_err(|e| ServiceError::AccountLookup(e.to_string()))?;

        if !self.participants.has_identity(&details.identifier).await? {
            let routing_identifier = Uuid::new_v4().to_string();
            self.participants
                .create_identity(&details.identifier, &routing_identifier)
                .await?;
        }
        let identity = self
            .participants
            .fetch_identity(&details.identifier)
            .await?
            .ok_or_else(|| ServiceError::UnknownParticipant(details.identifier.clone()))?;

        let participant = Participant {
            identifier: details.identifier.clone(),
            routing_identity: identity.routing_identifier.clone(),
            nickname: details.nickname,
            email: details.email,
            photo_url: details.photo_url,
        };
        self.online
            .write()
            .await
            .insert(details.identifier.clone(), participant.clone());
        self.route_pairing
            .write()
            .await
            .insert(identity.routing_identifier.clone(), details.identifier.clone());
        self.contact_pairing
            .write()
            .await
            .insert(participant.email.clone(), details.identifier.clone());
        info!(participant = %details.identifier, "participant entry added");

        if let Err(error) = self
            .client
            .register_participant(&identity.routing_identifier)
            .await
        {
            warn!(%error, "failed to announce participant ownership on the bus");
        }
        Ok(participant)
    }

    /// Post-identification bookkeeping; runs off the connection path.
    pub async fn on_identified(&self, participant_identifier: &str, device: DeviceDetails) {
        if let Err(error) = self.fetch(participant_identifier).await {
            warn!(
                participant = %participant_identifier,
                %error,
                "account lookup failed after identification"
            );
        }
        if let Err(error) = self
            .save_device_information(participant_identifier, &device)
            .await
        {
            warn!(
                participant = %participant_identifier,
                %error,
                "failed to persist device information"
            );
        }
    }

    pub async fn save_device_information(
        &self,
        participant_identifier: &str,
        device: &DeviceDetails,
    ) -> Result<(), ServiceError> {
        self.participants
            .add_device(participant_identifier, device)
            .await
            .map_err(Into::into)
    }

    /// Match a contact batch against the email pairing; unmatched requests
    /// are silently omitted from the response.
    pub async fn resolve_contacts(&self, content: &[u8]) -> Result<Bytes, ServiceError> {
        let request = BatchContactMatchRequest::decode(content)?;
        let contact_pairing = self.contact_pairing.read().await;
        let online = self.online.read().await;
        let mut response = BatchContactMatchResponse::default();
        for contact_request in &request.requests {
            if contact_request.r#type() != ContactType::Email {
                continue;
            }
            let Some(participant_identifier) = contact_pairing.get(&contact_request.value) else {
                continue;
            };
            let Some(participant) = online.get(participant_identifier) else {
                continue;
            };
            response.contacts.push(Contact {
                identifier: participant.routing_identity.clone(),
                nickname: participant.nickname.clone(),
                profile_picture_url: participant.photo_url.clone(),
            });
        }
        Ok(Bytes::from(response.encode_to_vec()))
    }

    /// Route a direct message from a local sender: dispatch locally when the
    /// target routing identity is paired here, otherwise pass over to the
    /// target's last known node.  Every path answers the sender with a
    /// delivery acknowledgement carrying the minted marker.
    pub async fn relay_direct_message(
        &self,
        sender_identifier: &str,
        payload: Bytes,
    ) -> Result<(), ServiceError> {
        let direct = DirectMessage::decode(payload.as_ref())?;
        let marker = Uuid::new_v4().to_string();

        let local_target = self
            .route_pairing
            .read()
            .await
            .get(&direct.target_identifier)
            .cloned();
        if let Some(target_identifier) = local_target {
            self.bus.handle(MessageDispatchCommand {
                participant_identifier: target_identifier.clone(),
                payload: payload.clone(),
                response_type: ResponseType::ReceiveDirectMessage,
                sent_at: direct.sent_at,
            })?;
            self.save_direct_message(sender_identifier, &target_identifier, &payload, &marker)
                .await;
            self.send_delivery_state(
                sender_identifier,
                &direct.target_identifier,
                DeliveryState::Delivered,
                "Successfully delivered message",
                &marker,
                now_millis(),
            );
            return Ok(());
        }

        match self
            .client
            .fetch_last_known_node(&direct.target_identifier)
            .await
        {
            None => {
                warn!(
                    code = error_codes::DELIVERY_FAILED,
                    target = %direct.target_identifier,
                    "no node claims the target routing identity"
                );
                self.send_delivery_state(
                    sender_identifier,
                    &direct.target_identifier,
                    DeliveryState::Failed,
                    "Failed to deliver the message :(",
                    &marker,
                    direct.sent_at,
                );
            }
            Some(node) => {
                let nickname = self
                    .online
                    .read()
                    .await
                    .get(sender_identifier)
                    .map(|participant| participant.nickname.clone())
                    .unwrap_or_default();
                let pass_over = ParticipantPassOver {
                    sender_identifier: sender_identifier.to_owned(),
                    target_identifier: direct.target_identifier.clone(),
                    originating_node: self.settings.node.clone(),
                    payload: payload.to_vec(),
                    marker: marker.clone(),
                    nickname,
                };
                match self.client.passover_direct_message_to(&node, pass_over).await {
                    Ok(()) => {
                        info!(node = %node, marker = %marker, "direct message passed over");
                        self.send_delivery_state(
                            sender_identifier,
                            &direct.target_identifier,
                            DeliveryState::Sent,
                            "Message handed over for delivery",
                            &marker,
                            now_millis(),
                        );
                    }
                    Err(error) => {
                        error!(
                            code = error_codes::BUS_DOWN,
                            %error,
                            node = %node,
                            "pass-over publish failed"
                        );
                        self.send_delivery_state(
                            sender_identifier,
                            &direct.target_identifier,
                            DeliveryState::Failed,
                            "bus unavailable",
                            &marker,
                            direct.sent_at,
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Inbound pass-over from a peer node.
    async fn on_external_participant_event(&self, event: ParticipantPassOver) {
        info!(
            sender = %event.sender_identifier,
            target = %event.target_identifier,
            origin = %event.originating_node,
            marker = %event.marker,
            "pass-over received"
        );
        let target = self
            .route_pairing
            .read()
            .await
            .get(&event.target_identifier)
            .cloned();
        let Some(target_identifier) = target else {
            warn!(
                target = %event.target_identifier,
                "pass-over target is not attached to this node"
            );
            return;
        };
        let payload = Bytes::from(event.payload);
        if let Err(error) = self.bus.handle(MessageDispatchCommand {
            participant_identifier: target_identifier.clone(),
            payload: payload.clone(),
            response_type: ResponseType::ReceiveDirectMessage,
            sent_at: now_millis(),
        }) {
            error!(%error, "failed to dispatch pass-over locally");
            return;
        }
        self.save_direct_message(
            &event.sender_identifier,
            &target_identifier,
            &payload,
            &event.marker,
        )
        .await;
    }

    async fn save_direct_message(
        &self,
        sender_identifier: &str,
        target_identifier: &str,
        payload: &Bytes,
        marker: &str,
    ) {
        if let Err(error) = self
            .messages
            .save(
                sender_identifier,
                target_identifier,
                payload,
                Utc::now(),
                &self.settings.node,
                marker,
            )
            .await
        {
            // Audit trail only; local dispatch has already happened.
            error!(%error, marker = %marker, "failed to persist direct message");
        }
    }

    fn send_delivery_state(
        &self,
        sender_identifier: &str,
        target_identifier: &str,
        state: DeliveryState,
        message: &str,
        marker: &str,
        sent_at: u64,
    ) {
        let delivery = Delivery {
            message: message.to_owned(),
            state: state as i32,
            marker: marker.to_owned(),
            target_identifier: target_identifier.to_owned(),
            sent_at,
        };
        if let Err(error) = self.bus.handle(MessageDispatchCommand {
            participant_identifier: sender_identifier.to_owned(),
            payload: Bytes::from(delivery.encode_to_vec()),
            response_type: ResponseType::DeliveryState,
            sent_at,
        }) {
            error!(%error, "failed to dispatch delivery state");
        }
    }
}
