use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::handle::DeviceRef;
use crate::node::Node;

struct Entry {
    node: Arc<Node>,
    device: DeviceRef,
}

/// The bus's children, ordered by unit number.
///
/// Only the draining thread mutates the registry. Every entry keeps a
/// [`DeviceRef`], so the child device's reference count is raised for as
/// long as the entry exists.
pub(crate) struct NodeRegistry {
    nodes: BTreeMap<u32, Entry>,
}

impl NodeRegistry {
    pub(crate) const fn new() -> Self {
        Self { nodes: BTreeMap::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Smallest unit number not held by any linked node.
    ///
    /// Single forward scan over the ascending keys. The candidate starts at
    /// zero and moves past every key equal to it; the first key above the
    /// candidate marks a gap (at the front when the first key is non-zero).
    /// Without a gap the candidate ends one past the last key.
    pub(crate) fn next_free_unit(&self) -> u32 {
        let mut candidate = 0;
        for &unit in self.nodes.keys() {
            if unit > candidate {
                break;
            }
            candidate += 1;
        }
        candidate
    }

    /// Link `node` at the smallest free unit number and return it.
    pub(crate) fn insert(&mut self, node: Arc<Node>, device: DeviceRef) -> u32 {
        let unit = self.next_free_unit();
        self.nodes.insert(unit, Entry { node, device });
        unit
    }

    /// Unlink `node` if it is the entry at its unit number.
    ///
    /// The returned reference should be dropped outside any lock, as that
    /// calls back into the device.
    pub(crate) fn remove(&mut self, node: &Arc<Node>) -> Option<DeviceRef> {
        let unit = node.unit()?;
        match self.nodes.get(&unit) {
            Some(entry) if Arc::ptr_eq(&entry.node, node) => {
                self.nodes.remove(&unit).map(|entry| entry.device)
            }
            _ => None,
        }
    }

    /// The first node with a unit number above `after`, or the first node
    /// overall when `after` is `None`.
    pub(crate) fn next_after(&self, after: Option<u32>) -> Option<Arc<Node>> {
        let lower = match after {
            Some(unit) => Bound::Excluded(unit),
            None => Bound::Unbounded,
        };
        self.nodes
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(_, entry)| Arc::clone(&entry.node))
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Arc<Node>> {
        core::mem::take(&mut self.nodes).into_values().map(|entry| entry.node)
    }
}
