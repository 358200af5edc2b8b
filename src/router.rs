//! # Router
//!
//! Decides, for a set of target names, which direct peer each target should
//! be handed to. Routing is source-agnostic: every node that receives a
//! routed envelope re-plans for the targets it carries.
//!
//! ## Planning
//!
//! Breadth-first search over the mesh snapshot, seeded with the live peer
//! set in name order (minus the peer the envelope arrived from). Each
//! reachable target is assigned the first hop of its shortest path; one
//! envelope per first hop carries exactly the targets assigned to it.
//!
//! ## Loop Prevention
//!
//! | Guard | Effect |
//! |-------|--------|
//! | `(source, id)` seen-target cache | a target is handled at most once per message |
//! | `hops_left` | envelopes die after `max_hops` forwards |

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::identity::NodeName;
use crate::view::Mesh;

/// Number of recent messages whose handled targets are remembered.
pub const DEDUPE_CACHE_SIZE: usize = 4096;

/// Where each target of one envelope goes next.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RoutePlan {
    /// The local node is itself a target.
    pub local: bool,
    /// First hop → targets to forward through it.
    pub hops: BTreeMap<NodeName, Vec<NodeName>>,
    /// Targets with no known path.
    pub unreachable: Vec<NodeName>,
}

/// Plan first hops for `targets`.
///
/// `peers` is the live peer set; an edge to a peer that is in the snapshot
/// but not live is never used as a first hop. `incoming` is the peer the
/// envelope arrived from, excluded as a first hop.
pub fn plan(
    mesh: &Mesh,
    local: &NodeName,
    peers: &BTreeSet<NodeName>,
    incoming: Option<&NodeName>,
    targets: &[NodeName],
) -> RoutePlan {
    let mut first_hop: HashMap<&NodeName, &NodeName> = HashMap::new();
    let mut queue: VecDeque<&NodeName> = VecDeque::new();
    let mut visited: HashSet<&NodeName> = HashSet::from([local]);

    for peer in peers {
        if Some(peer) == incoming || peer == local {
            continue;
        }
        visited.insert(peer);
        first_hop.insert(peer, peer);
        queue.push_back(peer);
    }

    while let Some(node) = queue.pop_front() {
        let Some(hop) = first_hop.get(node).copied() else {
            continue;
        };
        for next in mesh.get(node).into_iter().flatten() {
            if visited.insert(next) {
                first_hop.insert(next, hop);
                queue.push_back(next);
            }
        }
    }

    let mut plan = RoutePlan::default();
    let mut seen: HashSet<&NodeName> = HashSet::new();
    for target in targets {
        if !seen.insert(target) {
            continue;
        }
        if target == local {
            plan.local = true;
        } else if let Some(hop) = first_hop.get(target) {
            plan.hops
                .entry((*hop).clone())
                .or_default()
                .push(target.clone());
        } else {
            plan.unreachable.push(target.clone());
        }
    }
    plan
}

/// Remembers which targets of each `(source, id)` message were already
/// handled here.
pub struct Dedupe {
    seen: LruCache<(NodeName, u64), HashSet<NodeName>>,
}

impl Dedupe {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
        }
    }

    /// Return the targets not handled before, marking them handled.
    pub fn filter(&mut self, source: &NodeName, id: u64, targets: Vec<NodeName>) -> Vec<NodeName> {
        let key = (source.clone(), id);
        if !self.seen.contains(&key) {
            self.seen.put(key.clone(), HashSet::new());
        }
        let Some(handled) = self.seen.get_mut(&key) else {
            return targets;
        };
        targets
            .into_iter()
            .filter(|t| handled.insert(t.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> NodeName {
        s.parse().unwrap()
    }

    fn names(list: &[&str]) -> Vec<NodeName> {
        list.iter().map(|s| name(s)).collect()
    }

    fn mesh(edges: &[(&str, &[&str])]) -> Mesh {
        edges
            .iter()
            .map(|(node, peers)| (name(node), names(peers)))
            .collect()
    }

    /// a - b - c - d, plus b - e
    fn line() -> Mesh {
        mesh(&[
            ("a", &["b"]),
            ("b", &["a", "c", "e"]),
            ("c", &["b", "d"]),
            ("d", &["c"]),
            ("e", &["b"]),
        ])
    }

    #[test]
    fn every_target_goes_through_its_first_hop() {
        let peers = BTreeSet::from([name("b")]);
        let plan = plan(&line(), &name("a"), &peers, None, &names(&["d", "e", "c"]));
        assert!(!plan.local);
        assert_eq!(plan.hops.len(), 1);
        assert_eq!(plan.hops[&name("b")], names(&["d", "e", "c"]));
        assert!(plan.unreachable.is_empty());
    }

    #[test]
    fn splits_targets_per_first_hop() {
        let peers = BTreeSet::from([name("a"), name("c"), name("e")]);
        let plan = plan(&line(), &name("b"), &peers, None, &names(&["a", "d", "e", "b"]));
        assert!(plan.local);
        assert_eq!(plan.hops[&name("a")], names(&["a"]));
        assert_eq!(plan.hops[&name("c")], names(&["d"]));
        assert_eq!(plan.hops[&name("e")], names(&["e"]));
    }

    #[test]
    fn never_routes_back_over_incoming_edge() {
        let peers = BTreeSet::from([name("a"), name("c"), name("e")]);
        let plan = plan(&line(), &name("b"), &peers, Some(&name("a")), &names(&["a", "d"]));
        assert_eq!(plan.unreachable, names(&["a"]));
        assert_eq!(plan.hops[&name("c")], names(&["d"]));
    }

    #[test]
    fn unknown_and_dead_peers_are_unreachable() {
        // Snapshot still lists b, but the link is gone.
        let peers = BTreeSet::new();
        let plan = plan(&line(), &name("a"), &peers, None, &names(&["b", "zz"]));
        assert!(plan.hops.is_empty());
        assert_eq!(plan.unreachable, names(&["b", "zz"]));
    }

    #[test]
    fn duplicate_targets_planned_once() {
        let peers = BTreeSet::from([name("b")]);
        let plan = plan(&line(), &name("a"), &peers, None, &names(&["c", "c", "a", "a"]));
        assert!(plan.local);
        assert_eq!(plan.hops[&name("b")], names(&["c"]));
    }

    #[test]
    fn prefers_shortest_path() {
        // a - b - d and a - c - x - d: d must go through b.
        let m = mesh(&[
            ("a", &["b", "c"]),
            ("b", &["a", "d"]),
            ("c", &["a", "x"]),
            ("x", &["c", "d"]),
            ("d", &["b", "x"]),
        ]);
        let peers = BTreeSet::from([name("b"), name("c")]);
        let plan = plan(&m, &name("a"), &peers, None, &names(&["d", "x"]));
        assert_eq!(plan.hops[&name("b")], names(&["d"]));
        assert_eq!(plan.hops[&name("c")], names(&["x"]));
    }

    #[test]
    fn dedupe_passes_each_target_once() {
        let mut dedupe = Dedupe::new(8);
        let src = name("a");
        assert_eq!(dedupe.filter(&src, 1, names(&["b", "c"])), names(&["b", "c"]));
        assert_eq!(dedupe.filter(&src, 1, names(&["c", "d"])), names(&["d"]));
        assert_eq!(dedupe.filter(&src, 2, names(&["c"])), names(&["c"]));
        assert_eq!(dedupe.filter(&name("z"), 1, names(&["c"])), names(&["c"]));
    }

    #[test]
    fn dedupe_is_bounded() {
        let mut dedupe = Dedupe::new(2);
        let src = name("a");
        dedupe.filter(&src, 1, names(&["b"]));
        dedupe.filter(&src, 2, names(&["b"]));
        dedupe.filter(&src, 3, names(&["b"]));
        // id 1 was evicted.
        assert_eq!(dedupe.filter(&src, 1, names(&["b"])), names(&["b"]));
    }
}
