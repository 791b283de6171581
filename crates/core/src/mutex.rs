//! Cluster execution mutex.
//!
//! At most one ticket may run mutating nodes against a cluster at a time. Nodes of the
//! same ticket share the lock, so a ticket's own parallel branches never block each other.
//! The lock table lives in memory; the engine rebuilds it from RUNNING nodes on restart.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ticket::RetryPolicy;

/// Mutex guard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutexConfig {
    /// Delay before an AUTOMATIC ticket re-attempts a conflicting node (milliseconds).
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Conflicts tolerated before the node fails with "max retries exceeded".
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_retry_backoff() -> u64 {
    30_000 // 30 seconds
}

fn default_max_retries() -> u32 {
    10
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: default_retry_backoff(),
            max_retries: default_max_retries(),
        }
    }
}

/// The cluster is held by another ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexConflict {
    pub cluster_id: String,
    pub held_by: String,
}

#[derive(Debug)]
struct Holder {
    ticket_id: String,
    nodes: HashSet<String>,
}

/// In-memory lock table keyed by cluster identity.
#[derive(Debug, Default)]
pub struct ClusterMutex {
    holders: Mutex<HashMap<String, Holder>>,
}

impl ClusterMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every cluster in `clusters` for `node_id`, or none of them.
    pub fn try_acquire(
        &self,
        ticket_id: &str,
        node_id: &str,
        clusters: &[String],
    ) -> Result<(), MutexConflict> {
        let mut holders = self.holders.lock().unwrap();

        for cluster in clusters {
            if let Some(holder) = holders.get(cluster) {
                if holder.ticket_id != ticket_id {
                    return Err(MutexConflict {
                        cluster_id: cluster.clone(),
                        held_by: holder.ticket_id.clone(),
                    });
                }
            }
        }

        for cluster in clusters {
            holders
                .entry(cluster.clone())
                .or_insert_with(|| Holder {
                    ticket_id: ticket_id.to_string(),
                    nodes: HashSet::new(),
                })
                .nodes
                .insert(node_id.to_string());
        }
        Ok(())
    }

    /// Drop `node_id`'s hold; a cluster frees up once its last node releases it.
    pub fn release(&self, node_id: &str, clusters: &[String]) {
        let mut holders = self.holders.lock().unwrap();
        for cluster in clusters {
            let emptied = match holders.get_mut(cluster) {
                Some(holder) => {
                    holder.nodes.remove(node_id);
                    holder.nodes.is_empty()
                }
                None => false,
            };
            if emptied {
                holders.remove(cluster);
            }
        }
    }

    /// Ticket currently holding `cluster_id`.
    pub fn holder(&self, cluster_id: &str) -> Option<String> {
        self.holders
            .lock()
            .unwrap()
            .get(cluster_id)
            .map(|h| h.ticket_id.clone())
    }

    pub fn locked_clusters(&self) -> usize {
        self.holders.lock().unwrap().len()
    }
}

/// What the engine does with a node that hit a held cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutexDecision {
    /// MANUAL policy: fail now, an operator retries.
    FailFast,
    /// AUTOMATIC policy: try again after `delay`. `attempt` is 1-based.
    RetryAfter { attempt: u32, delay: Duration },
    /// AUTOMATIC policy with the retry budget spent.
    GiveUp { attempts: u32 },
}

impl MutexConfig {
    /// Decide how to react to a conflict, given the retries already spent on the node.
    pub fn decide(&self, policy: RetryPolicy, retries_so_far: u32) -> MutexDecision {
        match policy {
            RetryPolicy::Manual => MutexDecision::FailFast,
            RetryPolicy::Automatic => {
                let attempt = retries_so_far + 1;
                if attempt > self.max_retries {
                    MutexDecision::GiveUp {
                        attempts: retries_so_far,
                    }
                } else {
                    MutexDecision::RetryAfter {
                        attempt,
                        delay: Duration::from_millis(self.retry_backoff_ms),
                    }
                }
            }
        }
    }
}
