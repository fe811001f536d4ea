//! Schema-compiled payload submessages.
//!
//! The frozen wire schema is expressed as hand-derived `prost` messages so
//! the crate carries no protoc build step.  Field numbers are part of the
//! frozen contract; do not renumber.  Timestamps are epoch milliseconds.

use prost::Message;

/// Device details presented during identification.
#[derive(Clone, PartialEq, Message)]
pub struct Device {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub operating_system: String,
    #[prost(string, tag = "3")]
    pub version: String,
    #[prost(string, tag = "4")]
    pub ip_address: String,
}

/// First client frame: encrypted bearer token plus the presenting device.
#[derive(Clone, PartialEq, Message)]
pub struct Identification {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(message, optional, tag = "2")]
    pub device: Option<Device>,
}

/// A direct message addressed to a routing identity.
#[derive(Clone, PartialEq, Message)]
pub struct DirectMessage {
    #[prost(string, tag = "1")]
    pub target_identifier: String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub sent_at: u64,
}

/// Delivery acknowledgement states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DeliveryState {
    Sent = 0,
    Delivered = 1,
    Read = 2,
    Failed = 3,
}

/// Delivery acknowledgement echoed back to a sender.
///
/// `marker` is the per-message UUID minted by the origin node.
#[derive(Clone, PartialEq, Message)]
pub struct Delivery {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(enumeration = "DeliveryState", tag = "2")]
    pub state: i32,
    #[prost(string, tag = "3")]
    pub marker: String,
    #[prost(string, tag = "4")]
    pub target_identifier: String,
    #[prost(uint64, tag = "5")]
    pub sent_at: u64,
}

/// Informational server notice.
#[derive(Clone, PartialEq, Message)]
pub struct Info {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(string, tag = "2")]
    pub details: String,
    #[prost(uint64, tag = "3")]
    pub occurred_at: u64,
}

/// Server failure notice; `error` is one of the frozen machine codes.
#[derive(Clone, PartialEq, Message)]
pub struct Failure {
    #[prost(string, tag = "1")]
    pub error: String,
    #[prost(string, tag = "2")]
    pub details: String,
    #[prost(uint64, tag = "3")]
    pub occurred_at: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ContactType {
    Email = 0,
    Phone = 1,
}

/// One entry in a contact-match request.
#[derive(Clone, PartialEq, Message)]
pub struct ContactRequest {
    #[prost(enumeration = "ContactType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// One resolved contact; `identifier` is the contact's routing identity.
#[derive(Clone, PartialEq, Message)]
pub struct Contact {
    #[prost(string, tag = "1")]
    pub identifier: String,
    #[prost(string, tag = "2")]
    pub nickname: String,
    #[prost(string, tag = "3")]
    pub profile_picture_url: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct BatchContactMatchRequest {
    #[prost(message, repeated, tag = "1")]
    pub requests: Vec<ContactRequest>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BatchContactMatchResponse {
    #[prost(message, repeated, tag = "1")]
    pub contacts: Vec<Contact>,
}

/// A direct message forwarded between nodes over the bus.
#[derive(Clone, PartialEq, Message)]
pub struct ParticipantPassOver {
    #[prost(string, tag = "1")]
    pub sender_identifier: String,
    #[prost(string, tag = "2")]
    pub target_identifier: String,
    #[prost(string, tag = "3")]
    pub originating_node: String,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
    #[prost(string, tag = "5")]
    pub marker: String,
    #[prost(string, tag = "6")]
    pub nickname: String,
}

/// Advisory node-arrival event published on `v1/node/joined`.
#[derive(Clone, PartialEq, Message)]
pub struct NodeJoined {
    #[prost(string, tag = "1")]
    pub identifier: String,
}
