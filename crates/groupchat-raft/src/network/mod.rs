//! HTTP peer transport.
//!
//! Peers exchange raw protobuf Raft messages over `POST /raft`, guarded by a
//! fixed cluster ID header so traffic from a foreign cluster is refused
//! instead of stepped into the state machine. Outbound delivery is
//! best-effort: one retry per message, then drop. Raft's own retransmission
//! recovers lost traffic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, HttpRequest, HttpResponse};
use protobuf::Message as PbMessage;
use raft::eraftpb::Message;
use tokio::sync::mpsc;

use crate::node::RaftNode;

/// Fixed cluster identity shared by every node of one deployment.
pub const CLUSTER_ID: u64 = 0x1000;
/// Header carrying the sender's cluster ID.
pub const CLUSTER_ID_HEADER: &str = "x-raft-cluster-id";
/// Header carrying the sender's node ID.
pub const FROM_ID_HEADER: &str = "x-raft-from";

const SEND_TIMEOUT: Duration = Duration::from_secs(3);

struct Peer {
    url: String,
    tx: mpsc::UnboundedSender<Message>,
}

/// Outbound half of the transport: one queue-draining worker per peer.
pub struct PeerTransport {
    peers: HashMap<u64, Peer>,
}

impl PeerTransport {
    /// Spawn a sender worker per remote peer. Must be called on a tokio
    /// runtime; the driver thread only enqueues.
    pub fn new(node_id: u64, remotes: Vec<(u64, String)>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .unwrap_or_default();

        let mut peers = HashMap::new();
        for (id, url) in remotes {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_peer_sender(client.clone(), node_id, id, url.clone(), rx));
            peers.insert(id, Peer { url, tx });
        }
        Self { peers }
    }

    /// Queue outbound messages. Messages addressed to unknown peer IDs are
    /// dropped, not treated as "removed" members.
    pub fn send(&self, messages: Vec<Message>) {
        for message in messages {
            match self.peers.get(&message.to) {
                Some(peer) => {
                    if peer.tx.send(message).is_err() {
                        log::warn!("peer sender worker for {} is gone", peer.url);
                    }
                }
                None => {
                    log::trace!("dropping message to unknown peer {}", message.to);
                }
            }
        }
    }
}

async fn run_peer_sender(
    client: reqwest::Client,
    node_id: u64,
    peer_id: u64,
    url: String,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    let endpoint = format!("{url}/raft");
    while let Some(message) = rx.recv().await {
        let body = match message.write_to_bytes() {
            Ok(body) => body,
            Err(e) => {
                log::error!("failed to encode raft message for peer {peer_id}: {e}");
                continue;
            }
        };
        for attempt in 0..2 {
            let result = client
                .post(&endpoint)
                .header(CLUSTER_ID_HEADER, format!("{CLUSTER_ID:#x}"))
                .header(FROM_ID_HEADER, node_id.to_string())
                .body(body.clone())
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => break,
                Ok(resp) => {
                    log::debug!(
                        "peer {peer_id} rejected raft message with status {}",
                        resp.status()
                    );
                    break;
                }
                Err(e) if attempt == 0 => {
                    log::debug!("retrying raft message to peer {peer_id}: {e}");
                }
                Err(e) => {
                    log::debug!("dropping raft message to peer {peer_id}: {e}");
                }
            }
        }
    }
}

/// Inbound handler: verify the cluster ID, decode, and step the local node.
async fn handle_raft_message(
    req: HttpRequest,
    body: web::Bytes,
    node: web::Data<Arc<RaftNode>>,
) -> HttpResponse {
    let cluster_id = req
        .headers()
        .get(CLUSTER_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    if cluster_id != Some(format!("{CLUSTER_ID:#x}").as_str()) {
        return HttpResponse::PreconditionFailed().body("cluster ID mismatch");
    }

    let message = match Message::parse_from_bytes(&body) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("discarding undecodable raft message: {e}");
            return HttpResponse::BadRequest().finish();
        }
    };

    match node.step(message) {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => {
            log::warn!("failed to step raft message: {e}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

/// Mount the peer endpoint on an actix app serving the raft port.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/raft", web::post().to(handle_raft_message));
}
