mod common;

use common::{identify, recv_frame_of_kind, start_test_node, wait_for_routing};
use fabric_protocol::messages::{Delivery, DeliveryState, DirectMessage, ParticipantPassOver};
use fabric_protocol::{RequestType, ResponseType};
use fabric_test_utils::send_frame;
use prost::Message;

fn direct_message(target_routing: &str) -> Vec<u8> {
    DirectMessage {
        target_identifier: target_routing.to_owned(),
        payload: b"cross-node body".to_vec(),
        sent_at: 1_700_000_000_000,
    }
    .encode_to_vec()
}

#[tokio::test]
async fn remote_target_is_passed_over_to_its_last_known_node() {
    let node = start_test_node().await;
    node.accounts.add("p-1");
    node.client.seed_last_known_node("r-3", "node-b");

    let mut sender = node.connect().await;
    identify(&mut sender, "p-1").await;
    wait_for_routing(&node, "p-1").await;

    let outbound = direct_message("r-3");
    send_frame(&mut sender, RequestType::DirectMessage as u16, &outbound)
        .await
        .expect("send direct message");

    let payload = recv_frame_of_kind(&mut sender, ResponseType::DeliveryState).await;
    let delivery = Delivery::decode(&payload[..]).expect("delivery payload");
    assert_eq!(delivery.state(), DeliveryState::Sent);
    assert_eq!(delivery.target_identifier, "r-3");

    let published = node.client.published();
    assert_eq!(published.len(), 1);
    let (subject, pass_over) = &published[0];
    assert_eq!(subject, "v1/node/node-b/participants/pass-over");
    assert_eq!(pass_over.sender_identifier, "p-1");
    assert_eq!(pass_over.target_identifier, "r-3");
    assert_eq!(pass_over.originating_node, "node-a");
    assert_eq!(pass_over.nickname, "nick-p-1");
    assert_eq!(pass_over.payload, outbound);
    assert_eq!(pass_over.marker, delivery.marker);
}

#[tokio::test]
async fn unreachable_target_reports_a_failed_delivery() {
    let node = start_test_node().await;
    node.accounts.add("p-1");

    let mut sender = node.connect().await;
    identify(&mut sender, "p-1").await;
    wait_for_routing(&node, "p-1").await;

    send_frame(
        &mut sender,
        RequestType::DirectMessage as u16,
        &direct_message("r-nowhere"),
    )
    .await
    .expect("send direct message");

    let payload = recv_frame_of_kind(&mut sender, ResponseType::DeliveryState).await;
    let delivery = Delivery::decode(&payload[..]).expect("delivery payload");
    assert_eq!(delivery.state(), DeliveryState::Failed);
    assert_eq!(delivery.message, "Failed to deliver the message :(");
    assert_eq!(delivery.target_identifier, "r-nowhere");
    // The failure ack still carries the marker minted for this relay.
    assert!(!delivery.marker.is_empty());
    assert!(node.client.published().is_empty());
    assert!(node.messages.saved().is_empty());
}

#[tokio::test]
async fn bus_outage_reports_bus_unavailable() {
    let node = start_test_node().await;
    node.accounts.add("p-1");
    node.client.seed_last_known_node("r-3", "node-b");
    node.client.set_bus_down(true);

    let mut sender = node.connect().await;
    identify(&mut sender, "p-1").await;
    wait_for_routing(&node, "p-1").await;

    send_frame(
        &mut sender,
        RequestType::DirectMessage as u16,
        &direct_message("r-3"),
    )
    .await
    .expect("send direct message");

    let payload = recv_frame_of_kind(&mut sender, ResponseType::DeliveryState).await;
    let delivery = Delivery::decode(&payload[..]).expect("delivery payload");
    assert_eq!(delivery.state(), DeliveryState::Failed);
    assert_eq!(delivery.message, "bus unavailable");
}

#[tokio::test]
async fn inbound_pass_over_is_dispatched_to_the_local_target_and_persisted() {
    let node = start_test_node().await;
    node.accounts.add("p-2");

    let mut target = node.connect().await;
    identify(&mut target, "p-2").await;
    let target_routing = wait_for_routing(&node, "p-2").await;

    let inner = direct_message(&target_routing);
    let pass_over = ParticipantPassOver {
        sender_identifier: "p-9".to_owned(),
        target_identifier: target_routing.clone(),
        originating_node: "node-b".to_owned(),
        payload: inner.clone(),
        marker: "remote-marker-1".to_owned(),
        nickname: "niner".to_owned(),
    };
    let handled = node
        .client
        .inject(
            "v1/node/node-a/participants/pass-over",
            &pass_over.encode_to_vec(),
        )
        .await;
    assert_eq!(handled, 1);

    let payload = recv_frame_of_kind(&mut target, ResponseType::ReceiveDirectMessage).await;
    assert_eq!(payload, inner);

    let saved = node.messages.saved();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].sender, "p-9");
    assert_eq!(saved[0].target, "p-2");
    assert_eq!(saved[0].marker, "remote-marker-1");
}
