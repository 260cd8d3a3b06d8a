//! Swarmpost Drain -- how consecutive requests to one swarm pick their node.
//!
//! `AlwaysRandom` picks a fresh random node per request. `LimitedReuse`
//! sticks with one node for up to `count` requests, then rotates, remembering
//! every node it has drained so the next pick prefers a different one.
//!
//! Behaviours are values. Transitions consume `self` and return the next
//! value; whoever holds the current behaviour swaps it in whole.

use rand::Rng;
use std::collections::HashSet;
use swarmpost_protocol::SwarmNode;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DrainBehaviour {
    #[default]
    AlwaysRandom,
    LimitedReuse {
        count: usize,
        target: Option<SwarmNode>,
        /// Always below `count` while `target` is set.
        target_use_count: usize,
        used_nodes: HashSet<SwarmNode>,
    },
}

impl DrainBehaviour {
    /// Reuse each node up to `count` times. `count <= 1` is no reuse at all.
    pub fn limited_reuse(count: usize) -> Self {
        if count <= 1 {
            return DrainBehaviour::AlwaysRandom;
        }
        DrainBehaviour::LimitedReuse {
            count,
            target: None,
            target_use_count: 0,
            used_nodes: HashSet::new(),
        }
    }

    /// Record that a request was sent to `node`.
    pub fn use_node(self, node: &SwarmNode) -> Self {
        match self {
            DrainBehaviour::AlwaysRandom => DrainBehaviour::AlwaysRandom,
            DrainBehaviour::LimitedReuse {
                count,
                target,
                target_use_count,
                mut used_nodes,
            } => {
                let uses = match &target {
                    Some(current) if current == node => target_use_count + 1,
                    _ => {
                        used_nodes.insert(node.clone());
                        1
                    }
                };

                if uses >= count {
                    DrainBehaviour::LimitedReuse {
                        count,
                        target: None,
                        target_use_count: 0,
                        used_nodes,
                    }
                } else {
                    DrainBehaviour::LimitedReuse {
                        count,
                        target: Some(node.clone()),
                        target_use_count: uses,
                        used_nodes,
                    }
                }
            }
        }
    }

    /// Forget the current target (e.g. it just failed). Drained-node memory stays.
    pub fn clear_target(self) -> Self {
        match self {
            DrainBehaviour::AlwaysRandom => DrainBehaviour::AlwaysRandom,
            DrainBehaviour::LimitedReuse {
                count, used_nodes, ..
            } => DrainBehaviour::LimitedReuse {
                count,
                target: None,
                target_use_count: 0,
                used_nodes,
            },
        }
    }

    /// Back to the initial state for the same reuse count.
    pub fn reset(self) -> Self {
        match self {
            DrainBehaviour::AlwaysRandom => DrainBehaviour::AlwaysRandom,
            DrainBehaviour::LimitedReuse { count, .. } => DrainBehaviour::LimitedReuse {
                count,
                target: None,
                target_use_count: 0,
                used_nodes: HashSet::new(),
            },
        }
    }

    pub fn target(&self) -> Option<&SwarmNode> {
        match self {
            DrainBehaviour::AlwaysRandom => None,
            DrainBehaviour::LimitedReuse { target, .. } => target.as_ref(),
        }
    }

    fn used_nodes(&self) -> Option<&HashSet<SwarmNode>> {
        match self {
            DrainBehaviour::AlwaysRandom => None,
            DrainBehaviour::LimitedReuse { used_nodes, .. } => Some(used_nodes),
        }
    }
}

/// Pick the node for the next request to `swarm`.
///
/// Nodes in `exclude` (already failed during this send) are never returned.
/// The current target wins if still eligible; otherwise a uniformly random
/// node not yet drained, falling back to any eligible node once every member
/// has been drained. `None` when nothing is eligible.
pub fn select_node(
    swarm: &HashSet<SwarmNode>,
    behaviour: &DrainBehaviour,
    exclude: &HashSet<SwarmNode>,
) -> Option<SwarmNode> {
    select_node_with(&mut rand::thread_rng(), swarm, behaviour, exclude)
}

pub fn select_node_with<R: Rng + ?Sized>(
    rng: &mut R,
    swarm: &HashSet<SwarmNode>,
    behaviour: &DrainBehaviour,
    exclude: &HashSet<SwarmNode>,
) -> Option<SwarmNode> {
    if let Some(target) = behaviour.target() {
        if swarm.contains(target) && !exclude.contains(target) {
            return Some(target.clone());
        }
    }

    // Sorted so a seeded rng picks reproducibly.
    let mut eligible: Vec<&SwarmNode> = swarm.iter().filter(|n| !exclude.contains(*n)).collect();
    eligible.sort();

    let fresh: Vec<&SwarmNode> = match behaviour.used_nodes() {
        Some(used) => eligible.iter().copied().filter(|n| !used.contains(*n)).collect(),
        None => Vec::new(),
    };
    let pool = if fresh.is_empty() { &eligible } else { &fresh };

    if pool.is_empty() {
        return None;
    }
    let idx = rng.gen_range(0..pool.len());
    Some(pool[idx].clone())
}
