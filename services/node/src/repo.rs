//! Identity, device, and message persistence.
//!
//! Each repository method scopes its own transaction: begin on entry,
//! commit on normal exit, roll back on drop.  Persistence is an audit
//! trail, not a delivery gate — callers log failures and continue.

use crate::registry::DeviceDetails;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
}

/// A participant's persisted identity pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: i64,
    pub participant_identifier: String,
    pub routing_identifier: String,
}

/// One persisted direct message row.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub sender_id: Option<i64>,
    pub target_id: Option<i64>,
    pub message: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub node: String,
    pub marker: String,
}

#[async_trait]
pub trait ParticipantRepository: Send + Sync {
    async fn has_identity(&self, participant_identifier: &str) -> Result<bool, RepoError>;

    async fn create_identity(
        &self,
        participant_identifier: &str,
        routing_identifier: &str,
    ) -> Result<(), RepoError>;

    async fn fetch_identity(
        &self,
        participant_identifier: &str,
    ) -> Result<Option<Identity>, RepoError>;

    async fn add_device(
        &self,
        participant_identifier: &str,
        device: &DeviceDetails,
    ) -> Result<(), RepoError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn save(
        &self,
        sender: &str,
        target: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
        node: &str,
        marker: &str,
    ) -> Result<(), RepoError>;

    async fn fetch_for_participant(
        &self,
        participant_identifier: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StoredMessage>, RepoError>;
}

fn device_json(device: &DeviceDetails) -> serde_json::Value {
    serde_json::json!({
        "name": device.name,
        "operating_system": device.operating_system,
        "version": device.version,
        "ip_address": device.ip_address,
    })
}

// ---------------------------------------------------------------------------
// SQL implementations
// ---------------------------------------------------------------------------

pub struct SqlParticipantRepository {
    pool: PgPool,
}

impl SqlParticipantRepository {
    pub fn new(pool: PgPool) -> Self {
        SqlParticipantRepository { pool }
    }
}

#[async_trait]
impl ParticipantRepository for SqlParticipantRepository {
    async fn has_identity(&self, participant_identifier: &str) -> Result<bool, RepoError> {
        let mut tx = self.pool.begin().await?;
        let found: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM identity_tb WHERE participant_identifier = $1")
                .bind(participant_identifier)
                .fetch_optional(&mut *tx)
                .await?;
        tx.commit().await?;
        Ok(found.is_some())
    }

    async fn create_identity(
        &self,
        participant_identifier: &str,
        routing_identifier: &str,
    ) -> Result<(), RepoError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO identity_tb(participant_identifier, routing_identifier) \
             VALUES($1, $2) ON CONFLICT (participant_identifier) DO NOTHING",
        )
        .bind(participant_identifier)
        .bind(routing_identifier)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_identity(
        &self,
        participant_identifier: &str,
    ) -> Result<Option<Identity>, RepoError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT id, participant_identifier, routing_identifier \
             FROM identity_tb WHERE participant_identifier = $1",
        )
        .bind(participant_identifier)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row.map(|row| Identity {
            id: row.get("id"),
            participant_identifier: row.get("participant_identifier"),
            routing_identifier: row.get("routing_identifier"),
        }))
    }

    async fn add_device(
        &self,
        participant_identifier: &str,
        device: &DeviceDetails,
    ) -> Result<(), RepoError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO device_information_tb(identity_id, information) \
             VALUES((SELECT id FROM identity_tb WHERE participant_identifier = $1), $2)",
        )
        .bind(participant_identifier)
        .bind(device_json(device))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

pub struct SqlMessageRepository {
    pool: PgPool,
}

impl SqlMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        SqlMessageRepository { pool }
    }
}

#[async_trait]
impl MessageRepository for SqlMessageRepository {
    async fn save(
        &self,
        sender: &str,
        target: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
        node: &str,
        marker: &str,
    ) -> Result<(), RepoError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO direct_message_tb(sender_id, target_id, message, received_at, node, marker) \
             VALUES( \
               (SELECT id FROM identity_tb WHERE participant_identifier = $1), \
               (SELECT id FROM identity_tb WHERE participant_identifier = $2), \
               $3, $4, $5, $6)",
        )
        .bind(sender)
        .bind(target)
        .bind(payload)
        .bind(received_at)
        .bind(node)
        .bind(marker)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_for_participant(
        &self,
        participant_identifier: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StoredMessage>, RepoError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT m.id, m.sender_id, m.target_id, m.message, m.received_at, m.node, m.marker \
             FROM direct_message_tb m \
             JOIN identity_tb i ON i.id = m.target_id \
             WHERE i.participant_identifier = $1 \
             ORDER BY m.received_at DESC \
             LIMIT $2 OFFSET $3",
        )
        .bind(participant_identifier)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rows
            .into_iter()
            .map(|row| StoredMessage {
                id: row.get("id"),
                sender_id: row.get("sender_id"),
                target_id: row.get("target_id"),
                message: row.get("message"),
                received_at: row.get("received_at"),
                node: row.get("node"),
                marker: row.get("marker"),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementations (test mode)
// ---------------------------------------------------------------------------

/// A message recorded by [`MemoryMessageRepository`].
#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub sender: String,
    pub target: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub node: String,
    pub marker: String,
}

#[derive(Default)]
pub struct MemoryParticipantRepository {
    identities: std::sync::Mutex<Vec<Identity>>,
    devices: std::sync::Mutex<Vec<(String, serde_json::Value)>>,
}

impl MemoryParticipantRepository {
    pub fn new() -> Self {
        MemoryParticipantRepository::default()
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().expect("device log poisoned").len()
    }
}

#[async_trait]
impl ParticipantRepository for MemoryParticipantRepository {
    async fn has_identity(&self, participant_identifier: &str) -> Result<bool, RepoError> {
        Ok(self
            .identities
            .lock()
            .expect("identity table poisoned")
            .iter()
            .any(|identity| identity.participant_identifier == participant_identifier))
    }

    async fn create_identity(
        &self,
        participant_identifier: &str,
        routing_identifier: &str,
    ) -> Result<(), RepoError> {
        let mut identities = self.identities.lock().expect("identity table poisoned");
        if identities
            .iter()
            .any(|identity| identity.participant_identifier == participant_identifier)
        {
            return Ok(());
        }
        let id = identities.len() as i64 + 1;
        identities.push(Identity {
            id,
            participant_identifier: participant_identifier.to_owned(),
            routing_identifier: routing_identifier.to_owned(),
        });
        Ok(())
    }

    async fn fetch_identity(
        &self,
        participant_identifier: &str,
    ) -> Result<Option<Identity>, RepoError> {
        Ok(self
            .identities
            .lock()
            .expect("identity table poisoned")
            .iter()
            .find(|identity| identity.participant_identifier == participant_identifier)
            .cloned())
    }

    async fn add_device(
        &self,
        participant_identifier: &str,
        device: &DeviceDetails,
    ) -> Result<(), RepoError> {
        self.devices
            .lock()
            .expect("device log poisoned")
            .push((participant_identifier.to_owned(), device_json(device)));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryMessageRepository {
    saved: std::sync::Mutex<Vec<RecordedMessage>>,
}

impl MemoryMessageRepository {
    pub fn new() -> Self {
        MemoryMessageRepository::default()
    }

    pub fn saved(&self) -> Vec<RecordedMessage> {
        self.saved.lock().expect("message log poisoned").clone()
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn save(
        &self,
        sender: &str,
        target: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
        node: &str,
        marker: &str,
    ) -> Result<(), RepoError> {
        self.saved
            .lock()
            .expect("message log poisoned")
            .push(RecordedMessage {
                sender: sender.to_owned(),
                target: target.to_owned(),
                payload: payload.to_vec(),
                received_at,
                node: node.to_owned(),
                marker: marker.to_owned(),
            });
        Ok(())
    }

    async fn fetch_for_participant(
        &self,
        participant_identifier: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StoredMessage>, RepoError> {
        let saved = self.saved.lock().expect("message log poisoned");
        Ok(saved
            .iter()
            .filter(|message| message.target == participant_identifier)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .enumerate()
            .map(|(index, message)| StoredMessage {
                id: index as i64,
                sender_id: None,
                target_id: None,
                message: message.payload.clone(),
                received_at: message.received_at,
                node: message.node.clone(),
                marker: message.marker.clone(),
            })
            .collect())
    }
}
