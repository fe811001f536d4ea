//! Per-socket protocol handling.
//!
//! Each accepted socket gets two tasks: a reader driving the state machine
//! (Pending -> Authenticated -> Closed) over framed input, and a writer
//! draining the connection's outbound channel.  The writer owns the write
//! half, so all writes are serialized per connection and two concurrent
//! fan-out events never interleave bytes.  Every write is bounded by a send
//! timeout; a timeout closes the connection.

use crate::participant::ParticipantService;
use crate::registry::{ConnectionRegistry, RegisterOutcome};
use fabric_protocol::{Frame, FrameCodec, RequestType, ResponseType};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Transport send timeout; a write that stalls longer closes the connection.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);

enum ConnectionState {
    Pending,
    Authenticated { participant_identifier: String },
}

impl ConnectionState {
    fn participant(&self) -> Option<&str> {
        match self {
            ConnectionState::Pending => None,
            ConnectionState::Authenticated {
                participant_identifier,
            } => Some(participant_identifier),
        }
    }
}

/// Accept connections until shutdown flips, spawning one handler per socket.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    service: Arc<ParticipantService>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let registry = Arc::clone(&registry);
                    let service = Arc::clone(&service);
                    tokio::spawn(async move {
                        serve_connection(stream, peer, registry, service).await;
                    });
                }
                Err(error) => warn!(%error, "accept failed"),
            }
        }
    }
    info!("listener stopped");
}

/// Drive one client connection to completion.
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    service: Arc<ParticipantService>,
) {
    let unique_identifier = Uuid::new_v4();
    debug!(conn = %unique_identifier, %peer, "connection received");

    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, FrameCodec::new());
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let (writer_stopped_tx, mut writer_stopped) = watch::channel(false);
    tokio::spawn(write_loop(write_half, outbound_rx, writer_stopped_tx));

    registry.on_connect(unique_identifier, outbound_tx.clone());

    let mut state = ConnectionState::Pending;
    // Protocol violations close the connection with no response at all.
    let mut silent_close = false;
    loop {
        tokio::select! {
            _ = writer_stopped.changed() => {
                if *writer_stopped.borrow() {
                    warn!(conn = %unique_identifier, "writer stopped, closing connection");
                    silent_close = true;
                    break;
                }
            }
            next = frames.next() => {
                let frame = match next {
                    None => break,
                    Some(Err(error)) => {
                        warn!(conn = %unique_identifier, %error, "framing error");
                        silent_close = true;
                        break;
                    }
                    Some(Ok(frame)) => frame,
                };
                let Some(request) = RequestType::from_wire(frame.kind) else {
                    warn!(conn = %unique_identifier, kind = frame.kind, "unknown request type");
                    silent_close = true;
                    break;
                };
                if request == RequestType::Disconnect {
                    registry.remove(unique_identifier, state.participant());
                    break;
                }
                match &state {
                    ConnectionState::Pending => {
                        if request != RequestType::Identity {
                            debug!(
                                conn = %unique_identifier,
                                ?request,
                                "dropping frame from unidentified connection"
                            );
                            continue;
                        }
                        match registry.register(unique_identifier, &frame.payload) {
                            Ok(RegisterOutcome::Accepted {
                                participant_identifier,
                                device,
                            }) => {
                                // Account lookup and device persistence run off
                                // the connection scheduling path.
                                let service = Arc::clone(&service);
                                let participant = participant_identifier.clone();
                                tokio::spawn(async move {
                                    service.on_identified(&participant, device).await;
                                });
                                state = ConnectionState::Authenticated {
                                    participant_identifier,
                                };
                            }
                            Ok(RegisterOutcome::Rejected) => {
                                // Client observes the rejection and disconnects.
                            }
                            Err(error) => {
                                warn!(conn = %unique_identifier, %error, "unreadable identification");
                                silent_close = true;
                                break;
                            }
                        }
                    }
                    ConnectionState::Authenticated {
                        participant_identifier,
                    } => match request {
                        RequestType::Identity => {
                            debug!(conn = %unique_identifier, "duplicate identity frame ignored");
                        }
                        RequestType::DirectMessage => {
                            if let Err(error) = service
                                .relay_direct_message(participant_identifier, frame.payload.clone())
                                .await
                            {
                                warn!(conn = %unique_identifier, %error, "direct message rejected");
                                silent_close = true;
                                break;
                            }
                        }
                        RequestType::MatchContacts => {
                            match service.resolve_contacts(&frame.payload).await {
                                Ok(response) => {
                                    let _ = outbound_tx
                                        .send(Frame::response(ResponseType::ContactBatch, response));
                                }
                                Err(error) => {
                                    warn!(conn = %unique_identifier, %error, "contact batch rejected");
                                    silent_close = true;
                                    break;
                                }
                            }
                        }
                        RequestType::JoinGroup
                        | RequestType::LeaveGroup
                        | RequestType::FetchGroups
                        | RequestType::SearchForGroup => {
                            // Group routing is not part of this node.
                            debug!(conn = %unique_identifier, ?request, "group operation ignored");
                        }
                        // Disconnect is handled before the state match.
                        RequestType::Disconnect => {}
                    },
                }
            }
        }
    }

    if silent_close {
        registry.remove_silently(unique_identifier, state.participant());
    } else {
        registry.remove(unique_identifier, state.participant());
    }
    debug!(conn = %unique_identifier, "connection closed");
}

async fn write_loop(
    write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    stopped: watch::Sender<bool>,
) {
    let mut frames = FramedWrite::new(write_half, FrameCodec::new());
    while let Some(frame) = outbound.recv().await {
        match tokio::time::timeout(SEND_TIMEOUT, frames.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                debug!(%error, "socket write failed");
                break;
            }
            Err(_) => {
                warn!("send timed out, closing connection");
                break;
            }
        }
    }
    let _ = stopped.send(true);
}
