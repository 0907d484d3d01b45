//! Cluster metadata, written as the first record of every WAL segment.
//!
//! JSON keeps the record readable and stable across versions; the restart
//! path recovers the node's identity and the full peer set from it.

use serde::{Deserialize, Serialize};

use crate::error::RaftError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: u64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub id: u64,
    pub peers: Vec<PeerInfo>,
}

impl ClusterMetadata {
    /// Build metadata from the sorted peer URL list; ids are 1-based
    /// positions in that list.
    pub fn from_sorted_urls(id: u64, urls: &[String]) -> Self {
        Self {
            id,
            peers: urls
                .iter()
                .enumerate()
                .map(|(i, url)| PeerInfo {
                    id: i as u64 + 1,
                    url: url.clone(),
                })
                .collect(),
        }
    }

    pub fn voter_ids(&self) -> Vec<u64> {
        self.peers.iter().map(|p| p.id).collect()
    }

    /// Peers other than this node, as `(id, url)` pairs for the transport.
    pub fn remote_peers(&self) -> Vec<(u64, String)> {
        self.peers
            .iter()
            .filter(|p| p.id != self.id)
            .map(|p| (p.id, p.url.clone()))
            .collect()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, RaftError> {
        serde_json::to_vec(self).map_err(|e| RaftError::Serialization(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, RaftError> {
        serde_json::from_slice(bytes).map_err(|e| RaftError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip() {
        let md = ClusterMetadata {
            id: 2,
            peers: vec![
                PeerInfo { id: 1, url: "http://127.0.0.1:8081".to_string() },
                PeerInfo { id: 2, url: "http://127.0.0.2:8081".to_string() },
                PeerInfo { id: 3, url: "http://127.0.0.3:8081".to_string() },
            ],
        };
        let bytes = md.to_json().expect("marshal");
        let decoded = ClusterMetadata::from_json(&bytes).expect("unmarshal");
        assert_eq!(decoded, md);
    }

    #[test]
    fn from_sorted_urls_assigns_positional_ids() {
        let urls = vec![
            "http://127.0.0.1:8081".to_string(),
            "http://127.0.0.2:8081".to_string(),
        ];
        let md = ClusterMetadata::from_sorted_urls(1, &urls);
        assert_eq!(md.voter_ids(), vec![1, 2]);
        assert_eq!(md.remote_peers(), vec![(2, "http://127.0.0.2:8081".to_string())]);
    }

    #[test]
    fn rejects_malformed_metadata() {
        assert!(ClusterMetadata::from_json(b"not json").is_err());
    }
}
