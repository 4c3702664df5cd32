//! Bond-graph queries: cycle detection and connected components.
//!
//! Entities are nodes and bonds are edges. Edges are identified by bond id so
//! two bonds between the same pair of entities count as a 2-cycle.

use crate::bonding::{Bond, BondId, EntityId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

type Adjacency = BTreeMap<EntityId, Vec<(EntityId, BondId)>>;

fn adjacency<'a>(bonds: impl IntoIterator<Item = &'a Bond>) -> Adjacency {
    let mut adj = Adjacency::new();
    for bond in bonds {
        let (a, b) = (bond.endpoint1.entity_id, bond.endpoint2.entity_id);
        adj.entry(a).or_default().push((b, bond.bond_id));
        adj.entry(b).or_default().push((a, bond.bond_id));
    }
    adj
}

/// Find a ring in the bond graph.
///
/// With `target_size == 0` returns the size of the first cycle found by
/// depth-first search. Otherwise returns `Some(target_size)` if some simple
/// cycle of exactly that many entities exists.
pub fn find_ring<'a>(bonds: impl IntoIterator<Item = &'a Bond>, target_size: usize) -> Option<usize> {
    let adj = adjacency(bonds);
    if target_size == 0 {
        any_cycle(&adj)
    } else if target_size >= 2 {
        adj.keys()
            .any(|&start| {
                let mut on_path = BTreeSet::from([start]);
                cycle_through(&adj, start, start, None, 0, target_size, &mut on_path)
            })
            .then_some(target_size)
    } else {
        None
    }
}

/// Depth-first search with an explicit stack; bond chains can be long.
fn any_cycle(adj: &Adjacency) -> Option<usize> {
    let mut depths: BTreeMap<EntityId, usize> = BTreeMap::new();
    for &start in adj.keys() {
        if depths.contains_key(&start) {
            continue;
        }
        depths.insert(start, 0);
        // (node, bond it was reached by, next neighbour index)
        let mut stack: Vec<(EntityId, Option<BondId>, usize)> = vec![(start, None, 0)];
        while let Some(frame) = stack.last_mut() {
            let (node, via, index) = *frame;
            let Some(&(next, edge)) = adj.get(&node).and_then(|n| n.get(index)) else {
                stack.pop();
                continue;
            };
            frame.2 += 1;
            if Some(edge) == via {
                continue;
            }
            let depth = stack.len() - 1;
            match depths.get(&next) {
                // Back edge to an ancestor closes a cycle
                Some(&d) if d < depth => return Some(depth - d + 1),
                Some(_) => {}
                None => {
                    depths.insert(next, depth + 1);
                    stack.push((next, Some(edge), 0));
                }
            }
        }
    }
    None
}

/// Simple paths from `start` that only visit ids above it, so each cycle is
/// explored from its smallest member.
fn cycle_through(
    adj: &Adjacency,
    start: EntityId,
    node: EntityId,
    via: Option<BondId>,
    length: usize,
    target: usize,
    on_path: &mut BTreeSet<EntityId>,
) -> bool {
    for &(next, edge) in adj.get(&node).into_iter().flatten() {
        if Some(edge) == via {
            continue;
        }
        if next == start {
            if length + 1 == target {
                return true;
            }
            continue;
        }
        if next < start || length + 1 >= target || on_path.contains(&next) {
            continue;
        }
        on_path.insert(next);
        let found = cycle_through(adj, start, next, Some(edge), length + 1, target, on_path);
        on_path.remove(&next);
        if found {
            return true;
        }
    }
    false
}

/// Sizes of connected components, largest first. Entities without bonds
/// form components of size 1.
pub fn connected_components<'a>(
    entity_ids: impl IntoIterator<Item = EntityId>,
    bonds: impl IntoIterator<Item = &'a Bond>,
) -> Vec<usize> {
    let adj = adjacency(bonds);
    let mut visited = BTreeSet::new();
    let mut sizes = Vec::new();

    for start in entity_ids {
        if !visited.insert(start) {
            continue;
        }
        let mut size = 0;
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            size += 1;
            for &(next, _) in adj.get(&current).into_iter().flatten() {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        sizes.push(size);
    }

    sizes.sort_unstable_by(|a, b| b.cmp(a));
    sizes
}
