#![forbid(unsafe_code)]

//! Client state descriptors for optimistic-concurrency checks.
//!
//! A descriptor encodes what the client last observed about a node and its
//! surroundings. The store verifies every claim against the live rows before
//! a mutation is allowed to write; any mismatch is a stale-state conflict.

/// An (id, edition stamp) pair for one observed element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementStamp {
    pub id: i64,
    pub edition_time_ms: i64,
}

impl ElementStamp {
    pub fn new(id: i64, edition_time_ms: i64) -> Self {
        Self {
            id,
            edition_time_ms,
        }
    }
}

/// The client's belief about a node's parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParentState {
    /// The node is a root. Verified as "no parent exists", never as a
    /// comparison against a possibly stale null.
    Root,
    Node(ElementStamp),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateDescriptor {
    /// Skip checking entirely. Reserved for trusted import/bulk paths.
    Bypass,
    /// Only the target node's own stamp.
    Node { edition_time_ms: i64 },
    /// The target node plus any of its parent, children, and links. `None`
    /// for children/links means "not claimed"; `Some` claims the exact set.
    Neighborhood {
        edition_time_ms: i64,
        parent: Option<ParentState>,
        children: Option<Vec<ElementStamp>>,
        links: Option<Vec<ElementStamp>>,
    },
    /// Flat multi-node form for bulk operations.
    Multi(Vec<ElementStamp>),
}

impl StateDescriptor {
    pub fn node(edition_time_ms: i64) -> Self {
        Self::Node { edition_time_ms }
    }

    pub fn is_bypass(&self) -> bool {
        matches!(self, Self::Bypass)
    }

    /// Every node id the descriptor makes a claim about, target included.
    /// These are the rows the store pins for the transaction.
    pub fn implicated_node_ids(&self, target: i64) -> Vec<i64> {
        let mut ids = vec![target];
        match self {
            Self::Bypass | Self::Node { .. } => {}
            Self::Neighborhood {
                parent, children, ..
            } => {
                if let Some(ParentState::Node(stamp)) = parent {
                    ids.push(stamp.id);
                }
                if let Some(children) = children {
                    ids.extend(children.iter().map(|c| c.id));
                }
            }
            Self::Multi(stamps) => ids.extend(stamps.iter().map(|s| s.id)),
        }
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicated_ids_cover_parent_and_children() {
        let descriptor = StateDescriptor::Neighborhood {
            edition_time_ms: 10,
            parent: Some(ParentState::Node(ElementStamp::new(7, 3))),
            children: Some(vec![ElementStamp::new(9, 4), ElementStamp::new(7, 3)]),
            links: None,
        };
        assert_eq!(descriptor.implicated_node_ids(5), vec![5, 7, 9]);
    }

    #[test]
    fn root_parent_implicates_only_target() {
        let descriptor = StateDescriptor::Neighborhood {
            edition_time_ms: 10,
            parent: Some(ParentState::Root),
            children: None,
            links: None,
        };
        assert_eq!(descriptor.implicated_node_ids(5), vec![5]);
    }
}
