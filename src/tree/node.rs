use std::time::SystemTime;

use derive_more::Display;
use snafu::location;
use tracing::error;

/// Stable handle to a node inside a [`NodeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("#{_0}")]
pub(crate) struct NodeId(usize);

/// One mirrored filesystem entry. The parent link is a plain back-reference
/// into the arena, never an owning edge.
#[derive(Debug)]
pub(crate) struct Node<I> {
    pub name: String,
    pub parent: Option<NodeId>,
    pub kind: NodeKind<I>,
}

#[derive(Debug)]
pub(crate) enum NodeKind<I> {
    Directory {
        /// Ordered: directories first, then files, each group sorted
        /// case-insensitively by name.
        children: Vec<NodeId>,
        expanded: bool,
        deferred: Option<DeferredSync<I>>,
    },
    File {
        last_modified: SystemTime,
    },
}

/// One-shot "diff against the filesystem on next expand" continuation,
/// cleared when it fires.
#[derive(Debug)]
pub(crate) struct DeferredSync<I> {
    pub initiator: I,
}

impl<I> Node<I> {
    pub fn directory(name: String, parent: Option<NodeId>) -> Self {
        Self {
            name,
            parent,
            kind: NodeKind::Directory {
                children: Vec::new(),
                expanded: false,
                deferred: None,
            },
        }
    }

    pub fn file(name: String, parent: Option<NodeId>, last_modified: SystemTime) -> Self {
        Self {
            name,
            parent,
            kind: NodeKind::File { last_modified },
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    /// Advances the stored timestamp. Only strictly newer times apply;
    /// returns whether anything changed.
    pub fn update_modification_time(&mut self, time: SystemTime) -> bool {
        match &mut self.kind {
            NodeKind::File { last_modified } if time > *last_modified => {
                *last_modified = time;
                true
            }
            _ => false,
        }
    }
}

/// Slab of mirror nodes addressed by [`NodeId`]. Freed slots are reused.
#[derive(Debug)]
pub(crate) struct NodeArena<I> {
    slots: Vec<Option<Node<I>>>,
    free: Vec<usize>,
}

impl<I> NodeArena<I> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, node: Node<I>) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(node);
                NodeId(index)
            }
            None => {
                self.slots.push(Some(node));
                NodeId(self.slots.len() - 1)
            }
        }
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Node<I>> {
        let node = self.slots.get_mut(id.0)?.take();
        if node.is_some() {
            self.free.push(id.0);
        }
        node
    }

    pub fn get(&self, id: NodeId) -> Option<&Node<I>> {
        self.slots.get(id.0)?.as_ref()
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node<I>> {
        self.slots.get_mut(id.0)?.as_mut()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Index within `children` where a new directory named `name` belongs.
    /// Directories precede files; within the directory group names sort
    /// case-insensitively. The linear scan keeps the policy deterministic
    /// and stable; directory fan-out is small in practice.
    pub fn insertion_index_for_directory(&self, children: &[NodeId], name: &str) -> usize {
        let key = name.to_lowercase();
        let mut index = 0;
        for &child_id in children {
            let Some(child) = self.get(child_id) else {
                error!("Dangling child handle {child_id} in arena {}", location!());
                break;
            };
            if !child.is_directory() || child.name.to_lowercase() > key {
                break;
            }
            index += 1;
        }
        index
    }

    /// Index within `children` where a new file named `name` belongs: after
    /// every directory, before the first case-insensitively greater file.
    pub fn insertion_index_for_file(&self, children: &[NodeId], name: &str) -> usize {
        let key = name.to_lowercase();
        let mut index = 0;
        for &child_id in children {
            let Some(child) = self.get(child_id) else {
                error!("Dangling child handle {child_id} in arena {}", location!());
                break;
            };
            if child.is_directory() {
                index += 1;
                continue;
            }
            if child.name.to_lowercase() > key {
                break;
            }
            index += 1;
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use std::time::Duration;

    fn arena_with(entries: &[(&str, bool)]) -> (NodeArena<()>, Vec<NodeId>) {
        let mut arena = NodeArena::new();
        let children = entries
            .iter()
            .map(|&(name, directory)| {
                if directory {
                    arena.insert(Node::directory(name.to_string(), None))
                } else {
                    arena.insert(Node::file(
                        name.to_string(),
                        None,
                        SystemTime::UNIX_EPOCH,
                    ))
                }
            })
            .collect();
        (arena, children)
    }

    #[rstest]
    #[case::first_of_empty(&[], "new", 0)]
    #[case::before_greater_directory(&[("beta", true), ("delta", true)], "alpha", 0)]
    #[case::between_directories(&[("alpha", true), ("delta", true)], "beta", 1)]
    #[case::case_insensitive(&[("Alpha", true), ("gamma", true)], "BETA", 1)]
    #[case::stops_at_first_file(&[("alpha", true), ("zeta.txt", false)], "beta", 1)]
    fn directory_insertion_index(
        #[case] entries: &[(&str, bool)],
        #[case] name: &str,
        #[case] expected: usize,
    ) {
        let (arena, children) = arena_with(entries);
        assert_eq!(arena.insertion_index_for_directory(&children, name), expected);
    }

    #[rstest]
    #[case::first_of_empty(&[], "new.txt", 0)]
    #[case::after_all_directories(&[("alpha", true), ("beta", true)], "aaa.txt", 2)]
    #[case::between_files(&[("zeta", true), ("a.txt", false), ("c.txt", false)], "b.txt", 2)]
    #[case::case_insensitive(&[("A.txt", false), ("c.txt", false)], "B.TXT", 1)]
    #[case::at_end(&[("a.txt", false)], "b.txt", 1)]
    fn file_insertion_index(
        #[case] entries: &[(&str, bool)],
        #[case] name: &str,
        #[case] expected: usize,
    ) {
        let (arena, children) = arena_with(entries);
        assert_eq!(arena.insertion_index_for_file(&children, name), expected);
    }

    #[test]
    fn update_modification_time_requires_strictly_newer() {
        let epoch = SystemTime::UNIX_EPOCH;
        let later = epoch + Duration::from_secs(5);
        let mut node: Node<()> = Node::file("a.txt".to_string(), None, later);

        assert!(!node.update_modification_time(epoch));
        assert!(!node.update_modification_time(later));
        assert!(node.update_modification_time(later + Duration::from_secs(1)));
    }

    #[test]
    fn update_modification_time_ignores_directories() {
        let mut node: Node<()> = Node::directory("sub".to_string(), None);

        assert!(!node.update_modification_time(SystemTime::now()));
    }

    #[test]
    fn removed_slots_are_reused() {
        let mut arena: NodeArena<()> = NodeArena::new();
        let first = arena.insert(Node::directory("a".to_string(), None));
        let second = arena.insert(Node::directory("b".to_string(), None));
        assert_eq!(arena.len(), 2);

        assert!(arena.remove(first).is_some());
        assert!(arena.remove(first).is_none());
        assert_eq!(arena.len(), 1);

        let third = arena.insert(Node::directory("c".to_string(), None));
        assert_eq!(third, first);
        assert_eq!(arena.len(), 2);
        assert!(arena.get(second).is_some());
        assert_eq!(arena.get(third).map(|node| node.name.as_str()), Some("c"));
    }
}
