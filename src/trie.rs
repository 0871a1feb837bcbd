use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Stable handle to a trie node.
///
/// Handles are indices into the trie's node arena. Nodes are never removed
/// or renumbered — splitting an edge inserts a fresh parent above the
/// existing node — so a handle returned by [`Trie::add`] stays valid across
/// later insertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(u32);

const ROOT: NodeId = NodeId(0);

/// Compressed prefix tree over strings.
///
/// Nodes hold whole string segments (`remainder`) rather than single
/// characters, which keeps storage proportional to branching points — the
/// difference matters for sparse key sets like file trees. Each node also
/// tracks the highest value at or beneath it plus the child edge leading
/// toward it, so the best-valued completion of a prefix is reachable in
/// O(depth of the result).
///
/// `S` is an optional per-node payload (the "store"), unrelated to the
/// comparable value used for max-tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trie<S> {
    nodes: Vec<Node<S>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node<S> {
    children: BTreeMap<char, NodeId>,
    remainder: String,
    value: u64,
    /// Highest value strictly beneath this node.
    max_below: u64,
    /// Edge leading toward the highest-valued descendant.
    max_child: Option<char>,
    store: Option<S>,
}

impl<S> Node<S> {
    fn new(remainder: String, value: u64, store: Option<S>) -> Self {
        Node {
            children: BTreeMap::new(),
            remainder,
            value,
            max_below: 0,
            max_child: None,
            store,
        }
    }

    fn max_at_or_below(&self) -> u64 {
        self.value.max(self.max_below)
    }
}

impl<S> Default for Trie<S> {
    fn default() -> Self {
        Trie {
            nodes: vec![Node::new(String::new(), 0, None)],
        }
    }
}

impl<S> Trie<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, id: NodeId) -> &Node<S> {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<S> {
        &mut self.nodes[id.0 as usize]
    }

    fn alloc(&mut self, node: Node<S>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Insert `key`, overwriting the node's value (or summing when
    /// `add_value`), and return a stable handle to the node spelling
    /// exactly `key`.
    pub fn add(&mut self, key: &str, value: u64, add_value: bool) -> NodeId {
        let chars: Vec<char> = key.chars().collect();
        // Path of (edge char, node) walked below the root.
        let mut path: Vec<(char, NodeId)> = Vec::new();
        let mut cur = ROOT;
        let mut i = 0;

        let target = loop {
            if i >= chars.len() {
                // Key consumed at a node boundary.
                break cur;
            }
            let c = chars[i];
            let Some(&child) = self.node(cur).children.get(&c) else {
                // No matching edge: the rest of the key becomes a new leaf.
                let remainder: String = chars[i + 1..].iter().collect();
                let leaf = self.alloc(Node::new(remainder, value, None));
                self.node_mut(cur).children.insert(c, leaf);
                path.push((c, leaf));
                self.refresh_max(&path);
                return leaf;
            };
            path.push((c, child));
            i += 1;
            // Match the child's compressed remainder.
            let rem: Vec<char> = self.node(child).remainder.chars().collect();
            let mut k = 0;
            while k < rem.len() && i < chars.len() && rem[k] == chars[i] {
                k += 1;
                i += 1;
            }
            if k == rem.len() {
                cur = child;
                continue;
            }
            if i < chars.len() {
                // Diverged inside the remainder: split into a common-prefix
                // parent with the old node and a new leaf as children.
                let split = self.split_node(child, k);
                let (edge, parent) = match path.len() {
                    1 => (path[0].0, ROOT),
                    n => (path[n - 1].0, path[n - 2].1),
                };
                self.node_mut(parent).children.insert(edge, split);
                let branch_c = chars[i];
                let remainder: String = chars[i + 1..].iter().collect();
                let leaf = self.alloc(Node::new(remainder, value, None));
                self.node_mut(split).children.insert(branch_c, leaf);
                *path.last_mut().expect("non-empty path") = (edge, split);
                path.push((branch_c, leaf));
                self.refresh_max(&path);
                return leaf;
            }
            // Key exhausted mid-remainder: the split parent itself spells
            // the key.
            let split = self.split_node(child, k);
            let (edge, parent) = match path.len() {
                1 => (path[0].0, ROOT),
                n => (path[n - 1].0, path[n - 2].1),
            };
            self.node_mut(parent).children.insert(edge, split);
            *path.last_mut().expect("non-empty path") = (edge, split);
            break split;
        };

        let node = self.node_mut(target);
        node.value = if add_value { node.value + value } else { value };
        self.refresh_max(&path);
        target
    }

    /// Cut `node`'s remainder at `at`, returning a new parent holding the
    /// prefix. The original node keeps its identity and the suffix.
    fn split_node(&mut self, node: NodeId, at: usize) -> NodeId {
        let rem: Vec<char> = self.node(node).remainder.chars().collect();
        debug_assert!(at < rem.len());
        let prefix: String = rem[..at].iter().collect();
        let edge = rem[at];
        let suffix: String = rem[at + 1..].iter().collect();
        self.node_mut(node).remainder = suffix;
        let mut parent = Node::new(prefix, 0, None);
        parent.max_below = self.node(node).max_at_or_below();
        parent.max_child = Some(edge);
        parent.children.insert(edge, node);
        self.alloc(parent)
    }

    /// Re-raise max tracking along an insertion path, deepest first.
    /// Stops as soon as a level is already at least as high: anything
    /// above it is too.
    fn refresh_max(&mut self, path: &[(char, NodeId)]) {
        for i in (0..path.len()).rev() {
            let (edge, child) = path[i];
            let parent = if i == 0 { ROOT } else { path[i - 1].1 };
            let child_max = self.node(child).max_at_or_below();
            let p = self.node_mut(parent);
            if p.max_below < child_max {
                p.max_below = child_max;
                p.max_child = Some(edge);
            } else if p.max_child != Some(edge) {
                break;
            }
        }
    }

    /// Walk the matching prefix of `key`, returning the (edge, node) path.
    /// `None` if the key diverges from the tree. The final node may extend
    /// beyond `key` when the key ends inside its remainder.
    pub fn get_path_to(&self, key: &str) -> Option<Vec<(char, NodeId)>> {
        let chars: Vec<char> = key.chars().collect();
        let mut path = Vec::new();
        let mut cur = ROOT;
        let mut i = 0;
        loop {
            if i >= chars.len() {
                return Some(path);
            }
            let c = chars[i];
            let &child = self.node(cur).children.get(&c)?;
            path.push((c, child));
            i += 1;
            for rc in self.node(child).remainder.chars() {
                if i >= chars.len() {
                    return Some(path);
                }
                if chars[i] != rc {
                    return None;
                }
                i += 1;
            }
            cur = child;
        }
    }

    /// Handle of the node spelling exactly `key`, if present.
    pub fn lookup(&self, key: &str) -> Option<NodeId> {
        if key.is_empty() {
            return Some(ROOT);
        }
        let path = self.get_path_to(key)?;
        let &(_, last) = path.last()?;
        let walked: usize = path
            .iter()
            .map(|&(_, id)| 1 + self.node(id).remainder.chars().count())
            .sum();
        (walked == key.chars().count()).then_some(last)
    }

    pub fn get_value_for_string(&self, key: &str) -> u64 {
        self.lookup(key).map(|id| self.node(id).value).unwrap_or(0)
    }

    pub fn value(&self, id: NodeId) -> u64 {
        self.node(id).value
    }

    pub fn store(&self, id: NodeId) -> Option<&S> {
        self.node(id).store.as_ref()
    }

    pub fn store_mut(&mut self, id: NodeId) -> Option<&mut S> {
        self.node_mut(id).store.as_mut()
    }

    pub fn set_store(&mut self, id: NodeId, store: Option<S>) {
        self.node_mut(id).store = store;
    }

    pub fn max_value_beneath_prefix(&self, prefix: &str, default: u64) -> u64 {
        match self.get_path_to(prefix) {
            Some(path) if !path.is_empty() => {
                let (_, last) = path[path.len() - 1];
                self.node(last).max_below
            }
            _ => default,
        }
    }

    /// The highest-valued completion of `prefix`, or `None` when the
    /// prefix is absent. Follows max-child edges only, so the cost is the
    /// depth of the result rather than the size of the trie.
    pub fn get_max(&self, prefix: &str) -> Option<String> {
        let path = self.get_path_to(prefix)?;
        if path.is_empty() {
            return None;
        }
        let mut out = String::new();
        for &(c, id) in &path {
            out.push(c);
            out.push_str(&self.node(id).remainder);
        }
        let mut cur = path[path.len() - 1].1;
        while self.node(cur).max_below > self.node(cur).value {
            let Some(c) = self.node(cur).max_child else {
                break;
            };
            out.push(c);
            cur = self.node(cur).children[&c];
            out.push_str(&self.node(cur).remainder);
        }
        Some(out)
    }

    /// Deepest node on the path to `key` whose full string is a prefix of
    /// `key` (or `key` itself) and which passes `keep`. Used to find which
    /// subtree owner is responsible for a path.
    pub fn most_recent_ancestor_or_actual(
        &self,
        key: &str,
        mut keep: impl FnMut(&Self, NodeId) -> bool,
    ) -> Option<NodeId> {
        let chars: Vec<char> = key.chars().collect();
        let mut cur = ROOT;
        let mut i = 0;
        let mut best = None;
        loop {
            if i >= chars.len() {
                return best;
            }
            let Some(&child) = self.node(cur).children.get(&chars[i]) else {
                return best;
            };
            i += 1;
            for rc in self.node(child).remainder.chars() {
                if i >= chars.len() || chars[i] != rc {
                    return best;
                }
                i += 1;
            }
            if keep(self, child) {
                best = Some(child);
            }
            cur = child;
        }
    }

    /// All stored entries whose key starts with `prefix`, as
    /// (full key, handle) pairs. Only nodes with a store are reported.
    pub fn entries_under(&self, prefix: &str) -> Vec<(String, NodeId)> {
        let Some(path) = self.get_path_to(prefix) else {
            return Vec::new();
        };
        let (start, mut acc) = if path.is_empty() {
            (ROOT, String::new())
        } else {
            let mut acc = String::new();
            for &(c, id) in &path {
                acc.push(c);
                acc.push_str(&self.node(id).remainder);
            }
            (path[path.len() - 1].1, acc)
        };
        // The walked string may extend past the prefix (compressed
        // remainder); it still belongs to the subtree.
        let mut out = Vec::new();
        if !acc.is_empty() && self.node(start).store.is_some() {
            out.push((acc.clone(), start));
        }
        self.collect_entries(start, &mut acc, &mut out);
        out
    }

    fn collect_entries(&self, id: NodeId, acc: &mut String, out: &mut Vec<(String, NodeId)>) {
        for (&c, &child) in &self.node(id).children {
            let before = acc.len();
            acc.push(c);
            acc.push_str(&self.node(child).remainder);
            if self.node(child).store.is_some() {
                out.push((acc.clone(), child));
            }
            self.collect_entries(child, acc, out);
            acc.truncate(before);
        }
    }

    /// Store payloads strictly beneath `id`.
    pub fn stores_below(&self, id: NodeId) -> Vec<&S> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.node(id).children.values().copied().collect();
        while let Some(n) = stack.pop() {
            if let Some(s) = self.node(n).store.as_ref() {
                out.push(s);
            }
            stack.extend(self.node(n).children.values().copied());
        }
        out
    }

    pub fn has_children(&self, id: NodeId) -> bool {
        !self.node(id).children.is_empty()
    }

    pub fn root(&self) -> NodeId {
        ROOT
    }
}

impl<S: Clone> Trie<S> {
    /// Filtered copy keeping only subtrees whose best value meets
    /// `min_value`.
    pub fn copy_with_lower_values_pruned(&self, min_value: u64) -> Trie<S> {
        let mut out = Trie::new();
        self.prune_into(ROOT, ROOT, min_value, &mut out);
        out
    }

    fn prune_into(&self, src: NodeId, dst: NodeId, min_value: u64, out: &mut Trie<S>) {
        let node = self.node(src);
        if node.max_below >= min_value {
            out.node_mut(dst).max_below = node.max_below;
            out.node_mut(dst).max_child = node.max_child;
        }
        for (&c, &child) in &node.children {
            let cn = self.node(child);
            if cn.max_at_or_below() >= min_value {
                let copy = out.alloc(Node {
                    children: BTreeMap::new(),
                    remainder: cn.remainder.clone(),
                    value: cn.value,
                    max_below: 0,
                    max_child: None,
                    store: cn.store.clone(),
                });
                out.node_mut(dst).children.insert(c, copy);
                self.prune_into(child, copy, min_value, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t() -> Trie<()> {
        Trie::new()
    }

    #[test]
    fn test_add_and_get_value() {
        let mut trie = t();
        trie.add("google", 3, false);
        trie.add("goal", 5, false);
        trie.add("gol", 1, false);
        assert_eq!(trie.get_value_for_string("google"), 3);
        assert_eq!(trie.get_value_for_string("goal"), 5);
        assert_eq!(trie.get_value_for_string("gol"), 1);
        assert_eq!(trie.get_value_for_string("go"), 0);
        assert_eq!(trie.get_value_for_string("missing"), 0);
    }

    #[test]
    fn test_remainder_split_preserves_handles() {
        let mut trie = t();
        let google = trie.add("google", 3, false);
        // Splits the "oogle" remainder.
        let goal = trie.add("goal", 5, false);
        assert_eq!(trie.value(google), 3);
        assert_eq!(trie.value(goal), 5);
        // A later insert above both must not invalidate either handle.
        let go = trie.add("go", 9, false);
        assert_eq!(trie.value(google), 3);
        assert_eq!(trie.value(goal), 5);
        assert_eq!(trie.value(go), 9);
        assert_eq!(trie.lookup("google"), Some(google));
        assert_eq!(trie.lookup("goal"), Some(goal));
    }

    #[test]
    fn test_key_ending_inside_remainder() {
        let mut trie = t();
        trie.add("abcdef", 2, false);
        let abc = trie.add("abc", 7, false);
        assert_eq!(trie.get_value_for_string("abc"), 7);
        assert_eq!(trie.get_value_for_string("abcdef"), 2);
        assert_eq!(trie.lookup("abc"), Some(abc));
    }

    #[test]
    fn test_add_value_accumulates() {
        let mut trie = t();
        trie.add("x", 1, false);
        trie.add("x", 2, true);
        assert_eq!(trie.get_value_for_string("x"), 3);
        trie.add("x", 10, false);
        assert_eq!(trie.get_value_for_string("x"), 10);
    }

    #[test]
    fn test_get_max_follows_highest_value() {
        let mut trie = t();
        trie.add("go", 1, false);
        trie.add("google", 3, false);
        trie.add("goal", 5, false);
        assert_eq!(trie.get_max("go").as_deref(), Some("goal"));
        trie.add("google", 50, false);
        assert_eq!(trie.get_max("go").as_deref(), Some("google"));
        assert_eq!(trie.get_max("goo").as_deref(), Some("google"));
        assert!(trie.get_max("z").is_none());
    }

    #[test]
    fn test_max_tracking_invariant() {
        let mut trie = t();
        let keys = [
            ("alpha", 4),
            ("alphabet", 9),
            ("alpine", 2),
            ("beta", 7),
            ("betamax", 1),
            ("al", 3),
        ];
        for (k, v) in keys {
            trie.add(k, v, false);
        }
        // Every node's max_below must equal the max over its children's
        // max_at_or_below.
        for (id, node) in trie.nodes.iter().enumerate() {
            let expect = node
                .children
                .values()
                .map(|&c| trie.node(c).max_at_or_below())
                .max()
                .unwrap_or(0);
            assert_eq!(node.max_below, expect, "node {id} out of sync");
        }
    }

    #[test]
    fn test_most_recent_ancestor_or_actual() {
        let mut trie: Trie<u32> = Trie::new();
        let a = trie.add("/a/", 0, false);
        trie.set_store(a, Some(1));
        let ab = trie.add("/a/b/", 0, false);
        trie.set_store(ab, Some(2));
        let found = trie
            .most_recent_ancestor_or_actual("/a/b/c/d.py", |t, n| t.store(n).is_some())
            .unwrap();
        assert_eq!(trie.store(found), Some(&2));
        let found = trie
            .most_recent_ancestor_or_actual("/a/x/y.py", |t, n| t.store(n).is_some())
            .unwrap();
        assert_eq!(trie.store(found), Some(&1));
        assert!(trie
            .most_recent_ancestor_or_actual("/z/q.py", |t, n| t.store(n).is_some())
            .is_none());
    }

    #[test]
    fn test_entries_under() {
        let mut trie: Trie<u32> = Trie::new();
        for (k, s) in [("/a/x.py", 1), ("/a/b/y.py", 2), ("/c/z.py", 3)] {
            let id = trie.add(k, 0, false);
            trie.set_store(id, Some(s));
        }
        let mut under_a: Vec<String> =
            trie.entries_under("/a/").into_iter().map(|(k, _)| k).collect();
        under_a.sort();
        assert_eq!(under_a, vec!["/a/b/y.py".to_string(), "/a/x.py".to_string()]);
        assert_eq!(trie.entries_under("/c/").len(), 1);
        assert!(trie.entries_under("/nope/").is_empty());
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut trie: Trie<u32> = Trie::new();
        let pairs = [("go", 1), ("google", 3), ("goal", 5), ("team", 2)];
        for (k, v) in pairs {
            trie.add(k, v, false);
        }
        let bytes = bincode::serialize(&trie).unwrap();
        let loaded: Trie<u32> = bincode::deserialize(&bytes).unwrap();
        for (k, v) in pairs {
            assert_eq!(loaded.get_value_for_string(k), v);
        }
        assert_eq!(loaded.get_max("go"), trie.get_max("go"));
        assert_eq!(loaded.get_max("t"), trie.get_max("t"));
    }

    #[test]
    fn test_copy_with_lower_values_pruned() {
        let mut trie = t();
        trie.add("keep", 10, false);
        trie.add("drop", 1, false);
        trie.add("keeper", 3, false);
        let pruned = trie.copy_with_lower_values_pruned(5);
        assert_eq!(pruned.get_value_for_string("keep"), 10);
        assert_eq!(pruned.get_value_for_string("drop"), 0);
        // "keeper" subtree survives only because it shares the "keep" node.
        assert_eq!(pruned.get_value_for_string("keeper"), 0);
    }
}
