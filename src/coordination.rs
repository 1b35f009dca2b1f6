//! Leader coordination
//!
//! Exactly one node may append schema records at a time. Ownership comes
//! from the log's group-membership primitive, surfaced through the narrow
//! [`LeadershipProvider`] capability. Every ownership change bumps a
//! generation number; the generation is the fencing token a writer carries,
//! checked before each append and stamped into each record so that replay
//! ignores appends from a deposed writer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{RegistryError, Result};
use crate::log::{LogError, LogTransport};

/// Network identity of a registry node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

fn default_scheme() -> String {
    "http".to_string()
}

impl NodeIdentity {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            scheme: default_scheme(),
        }
    }

    /// Advertised URL, also the election sort key
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Proof of leadership for one generation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FencingToken {
    pub generation: u64,
    pub node_id: String,
}

/// How the owner is picked among master-eligible members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ElectionStrategy {
    /// Lowest advertised URL wins
    #[default]
    Lowest,
    /// Highest advertised URL wins
    Highest,
}

impl fmt::Display for ElectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectionStrategy::Lowest => f.write_str("lowest"),
            ElectionStrategy::Highest => f.write_str("highest"),
        }
    }
}

impl FromStr for ElectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lowest" => Ok(ElectionStrategy::Lowest),
            "highest" => Ok(ElectionStrategy::Highest),
            _ => Err(format!(
                "Invalid master election strategy: {}, valid values are lowest, highest",
                s
            )),
        }
    }
}

/// Who may write right now
pub trait LeadershipProvider: Send + Sync {
    /// The token for `node_id` if it currently owns the coordination partition.
    fn current_token(&self, node_id: &str) -> Option<FencingToken>;

    /// Whether `token` is still the current one.
    fn is_valid(&self, token: &FencingToken) -> bool;

    /// The current owner, if any.
    fn leader(&self) -> Option<NodeIdentity>;
}

#[derive(Debug, Clone)]
struct Member {
    identity: NodeIdentity,
    master_eligible: bool,
}

#[derive(Debug, Default)]
struct GroupState {
    members: BTreeMap<String, Member>,
    generation: u64,
    owner: Option<String>,
}

/// In-process group coordinator over the coordination partition
pub struct GroupCoordinator {
    strategy: ElectionStrategy,
    state: RwLock<GroupState>,
    changes: watch::Sender<Option<FencingToken>>,
}

impl GroupCoordinator {
    pub fn new(strategy: ElectionStrategy) -> Self {
        let (changes, _) = watch::channel(None);
        Self {
            strategy,
            state: RwLock::new(GroupState::default()),
            changes,
        }
    }

    /// Add or update a member and rebalance. Returns the new generation.
    pub fn join(&self, identity: NodeIdentity, master_eligible: bool) -> u64 {
        let mut state = self.state.write();
        state.members.insert(
            identity.node_id.clone(),
            Member {
                identity,
                master_eligible,
            },
        );
        self.rebalance_locked(&mut state)
    }

    /// Remove a member and rebalance. Returns the new generation.
    pub fn leave(&self, node_id: &str) -> u64 {
        let mut state = self.state.write();
        state.members.remove(node_id);
        self.rebalance_locked(&mut state)
    }

    /// Force a new generation, as a session timeout would.
    pub fn rebalance(&self) -> u64 {
        let mut state = self.state.write();
        self.rebalance_locked(&mut state)
    }

    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Leadership changes, as the current owner's token
    pub fn subscribe(&self) -> watch::Receiver<Option<FencingToken>> {
        self.changes.subscribe()
    }

    fn rebalance_locked(&self, state: &mut GroupState) -> u64 {
        // Fence the previous owner before anyone else can own
        state.generation += 1;
        let eligible = state.members.values().filter(|m| m.master_eligible);
        let elected = match self.strategy {
            ElectionStrategy::Lowest => eligible.min_by_key(|m| m.identity.url()),
            ElectionStrategy::Highest => eligible.max_by_key(|m| m.identity.url()),
        }
        .map(|m| m.identity.node_id.clone());

        if elected != state.owner {
            info!(
                generation = state.generation,
                previous = ?state.owner,
                owner = ?elected,
                "Leadership changed"
            );
        }
        state.owner = elected;
        let token = state.owner.clone().map(|node_id| FencingToken {
            generation: state.generation,
            node_id,
        });
        self.changes.send_replace(token);
        state.generation
    }
}

impl LeadershipProvider for GroupCoordinator {
    fn current_token(&self, node_id: &str) -> Option<FencingToken> {
        let state = self.state.read();
        match &state.owner {
            Some(owner) if owner == node_id => Some(FencingToken {
                generation: state.generation,
                node_id: owner.clone(),
            }),
            _ => None,
        }
    }

    fn is_valid(&self, token: &FencingToken) -> bool {
        let state = self.state.read();
        state.generation == token.generation && state.owner.as_deref() == Some(token.node_id.as_str())
    }

    fn leader(&self) -> Option<NodeIdentity> {
        let state = self.state.read();
        let owner = state.owner.as_ref()?;
        state.members.get(owner).map(|m| m.identity.clone())
    }
}

/// Gate between the write path and the log
pub struct LeaderGate {
    node: NodeIdentity,
    provider: Arc<dyn LeadershipProvider>,
}

impl LeaderGate {
    pub fn new(node: NodeIdentity, provider: Arc<dyn LeadershipProvider>) -> Self {
        Self { node, provider }
    }

    pub fn leader(&self) -> Option<NodeIdentity> {
        self.provider.leader()
    }

    /// The current fencing token, or `NotMaster` naming the known leader.
    pub fn acquire(&self) -> Result<FencingToken> {
        self.provider
            .current_token(&self.node.node_id)
            .ok_or_else(|| RegistryError::NotMaster {
                leader: self.provider.leader(),
            })
    }

    /// Append `payload` if `token` is still current.
    ///
    /// The token is validated before the log is touched. A deposal between
    /// validation and append is caught on replay by the record's generation.
    pub async fn fenced_append(
        &self,
        token: &FencingToken,
        log: &dyn LogTransport,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<u64> {
        if !self.provider.is_valid(token) {
            warn!(
                node = %self.node.node_id,
                generation = token.generation,
                "Rejected append with a stale fencing token"
            );
            return Err(RegistryError::NotMaster {
                leader: self.provider.leader(),
            });
        }
        match tokio::time::timeout(timeout, log.append(payload)).await {
            Ok(offset) => Ok(offset?),
            Err(_) => Err(LogError::Timeout(timeout).into()),
        }
    }
}
