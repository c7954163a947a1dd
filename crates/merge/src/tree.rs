//! Structural three-way merge of node trees.
//!
//! For every position the rule is: if upstream did not change it, keep local;
//! if local did not change it, take upstream; otherwise recurse into
//! mappings and associative sequences, and let upstream win everywhere else.

use std::collections::{HashMap, HashSet};

use kpt_yaml::{Node, Value};

/// Keys tried, in order, to decide whether a sequence can be merged by element.
pub const ASSOCIATIVE_KEYS: &[&str] = &["name", "mountPath", "devicePath", "ip", "type", "topologyKey", "containerPort"];

#[derive(Debug, Clone)]
pub struct TreeMerger {
    keys: Vec<String>,
}

impl Default for TreeMerger {
    fn default() -> Self {
        Self { keys: ASSOCIATIVE_KEYS.iter().map(|k| k.to_string()).collect() }
    }
}

impl TreeMerger {
    pub fn with_keys(keys: &[&str]) -> Self {
        Self { keys: keys.iter().map(|k| k.to_string()).collect() }
    }

    /// Merges one position. `None` means absent in that tree, and an absent
    /// result means the position is deleted.
    pub fn merge(&self, o: Option<&Node>, u: Option<&Node>, l: Option<&Node>) -> Option<Node> {
        if u == o {
            return l.cloned();
        }
        if l == o {
            return u.cloned();
        }
        let (u, l) = match (u, l) {
            (Some(u), Some(l)) => (u, l),
            // Deleted on one side and changed on the other: deletion propagates
            // unless the position did not exist before, where the addition stays.
            (Some(u), None) => return if o.is_none() { Some(u.clone()) } else { None },
            (None, Some(l)) => return if o.is_none() { Some(l.clone()) } else { None },
            (None, None) => return None,
        };
        match (&u.value, &l.value) {
            (Value::Mapping(_), Value::Mapping(_)) => {
                let o = o.filter(|n| n.is_mapping());
                Some(self.merge_mapping(o, u, l))
            }
            (Value::Sequence(_), Value::Sequence(_)) => {
                let o = o.filter(|n| n.is_sequence());
                Some(self.merge_sequence(o, u, l))
            }
            _ => Some(u.clone()),
        }
    }

    fn merge_mapping(&self, o: Option<&Node>, u: &Node, l: &Node) -> Node {
        let mut order: Vec<&str> = l.keys();
        for k in u.keys() {
            if !order.contains(&k) {
                order.push(k);
            }
        }
        let mut out = Node { value: Value::Mapping(Vec::new()), meta: l.meta.clone() };
        for k in order {
            let merged = self.merge(o.and_then(|n| n.get(k)), u.get(k), l.get(k));
            if let (Some(node), Some(m)) = (merged, out.as_mapping_mut()) {
                m.push((k.to_string(), node));
            }
        }
        out
    }

    /// First candidate key held, with a scalar value unique within its
    /// sequence, by every element of all three sequences.
    fn associative_key(&self, seqs: &[&Vec<Node>]) -> Option<&str> {
        if seqs.iter().all(|s| s.is_empty()) {
            return None;
        }
        self.keys
            .iter()
            .find(|key| {
                seqs.iter().all(|s| {
                    let mut seen = HashSet::new();
                    s.iter().all(|item| item.get(key).and_then(Node::scalar_string).map(|v| seen.insert(v)).unwrap_or(false))
                })
            })
            .map(String::as_str)
    }

    fn merge_sequence(&self, o: Option<&Node>, u: &Node, l: &Node) -> Node {
        let empty = Vec::new();
        let os = o.and_then(Node::as_sequence).unwrap_or(&empty);
        let us = u.as_sequence().unwrap_or(&empty);
        let ls = l.as_sequence().unwrap_or(&empty);
        let Some(key) = self.associative_key(&[os, us, ls]) else {
            return u.clone();
        };
        let index = |s: &'_ Vec<Node>| -> HashMap<String, usize> {
            s.iter()
                .enumerate()
                .filter_map(|(i, item)| item.get(key).and_then(Node::scalar_string).map(|v| (v, i)))
                .collect()
        };
        let (oi, ui) = (index(os), index(us));
        let id = |item: &Node| item.get(key).and_then(Node::scalar_string).unwrap_or_default();

        let mut items = Vec::new();
        let mut done = HashSet::new();
        // Local order first; upstream additions follow. The order of new
        // elements relative to each other is arbitrary but stable.
        for item in ls {
            let k = id(item);
            let merged = self.merge(oi.get(&k).map(|i| &os[*i]), ui.get(&k).map(|i| &us[*i]), Some(item));
            if let Some(n) = merged {
                items.push(n);
            }
            done.insert(k);
        }
        for item in us {
            let k = id(item);
            if done.contains(&k) {
                continue;
            }
            if let Some(n) = self.merge(oi.get(&k).map(|i| &os[*i]), Some(item), None) {
                items.push(n);
            }
        }
        Node { value: Value::Sequence(items), meta: l.meta.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(src: &str) -> Node {
        let docs = kpt_yaml::parse_stream(src).unwrap();
        docs[0].root().clone()
    }

    fn merge(o: &str, u: &str, l: &str) -> Node {
        TreeMerger::default().merge(Some(&n(o)), Some(&n(u)), Some(&n(l))).unwrap()
    }

    #[test]
    fn upstream_wins_scalar_conflicts() {
        let out = merge("replicas: 3\n", "replicas: 7\n", "replicas: 11\n");
        assert_eq!(out.get("replicas").unwrap().as_i64(), Some(7));
    }

    #[test]
    fn non_conflicting_edits_combine() {
        let out = merge("a: 1\nb: 1\nc: 1\n", "a: 2\nb: 1\nc: 1\nd: 4\n", "a: 1\nb: 9\n");
        assert_eq!(out, n("a: 2\nb: 9\nd: 4\n"));
        assert_eq!(out.keys(), vec!["a", "b", "d"]);
    }

    #[test]
    fn identity_cases() {
        let o = "a: 1\nlist: [x, y]\n";
        let edited = "a: 5\nlist: [y]\nz: true\n";
        assert_eq!(merge(o, o, edited), n(edited));
        assert_eq!(merge(o, edited, o), n(edited));
    }

    #[test]
    fn local_comments_survive_unless_upstream_rewrites() {
        let out = merge("a: 1\nb: 1\n", "a: 2\nb: 1\n", "a: 1 # mine\nb: 1 # also mine\n");
        assert_eq!(out.get("a").unwrap().meta.line, None);
        assert_eq!(out.get("b").unwrap().meta.line.as_deref(), Some("# also mine"));
    }

    #[test]
    fn associative_lists_merge_by_name() {
        let o = "containers:\n- name: app\n  image: a:1\n";
        let u = "containers:\n- name: app\n  image: a:2\n- name: sidecar\n  image: s:1\n";
        let l = "containers:\n- name: debug\n  image: d:1\n- name: app\n  image: a:1\n  args: [--v]\n";
        let out = merge(o, u, l);
        let names: Vec<&str> = out.get("containers").unwrap().as_sequence().unwrap().iter().map(|c| c.get_str("name").unwrap()).collect();
        assert_eq!(names, vec!["debug", "app", "sidecar"]);
        let app = out.path_get("containers[name=app]").unwrap().unwrap();
        assert_eq!(app.get_str("image"), Some("a:2"));
        assert!(app.get("args").is_some());
    }

    #[test]
    fn local_additions_precede_upstream_additions() {
        let out = merge("mutators: []\n", "mutators:\n- name: gen-folders\n", "mutators:\n- name: folder-ref\n");
        let names: Vec<&str> = out.get("mutators").unwrap().as_sequence().unwrap().iter().map(|c| c.get_str("name").unwrap()).collect();
        assert_eq!(names, vec!["folder-ref", "gen-folders"]);
    }

    #[test]
    fn non_associative_lists_take_upstream() {
        let out = merge("args: [a, b]\n", "args: [a, b, c]\n", "args: [a]\n");
        assert_eq!(out, n("args: [a, b, c]\n"));
        let out = merge("ports:\n- port: 80\n", "ports:\n- port: 81\n", "ports:\n- port: 80\n- port: 90\n");
        assert_eq!(out, n("ports:\n- port: 81\n"));
    }

    #[test]
    fn deletions_propagate() {
        let out = merge("a: 1\nb: 2\n", "a: 1\n", "a: 1\nb: 3\n");
        assert!(out.get("b").is_none());
        let out = merge("a: 1\nb: 2\n", "a: 1\nb: 5\n", "a: 1\n");
        assert!(out.get("b").is_none());
    }
}
