//! HRW (Highest Random Weight) / Rendezvous hashing
//!
//! `score(key, node) = xxh64(node, xxh64(key))`; the node with the highest
//! score wins. Removing a node only remaps the keys it owned.

use xxhash_rust::xxh64::xxh64;

/// HRW score of the node for the key
#[must_use]
pub fn hrw_score(key: &str, node: &str) -> u64 {
    xxh64(node.as_bytes(), xxh64(key.as_bytes(), 0))
}

/// Select the owner of the key, `None` if there are no nodes
pub fn hrw_select<'a, S: AsRef<str>>(key: &str, nodes: &'a [S]) -> Option<&'a S> {
    nodes
        .iter()
        .max_by(|a, b| {
            hrw_score(key, a.as_ref())
                .cmp(&hrw_score(key, b.as_ref()))
                // Deterministic on score collision
                .then_with(|| b.as_ref().cmp(a.as_ref()))
        })
}

/// Select up to `count` distinct nodes for the key, best first
pub fn hrw_select_n<'a, S: AsRef<str>>(key: &str, nodes: &'a [S], count: usize) -> Vec<&'a S> {
    let mut scored: Vec<(u64, &S)> = nodes
        .iter()
        .map(|node| (hrw_score(key, node.as_ref()), node))
        .collect();

    // Sort by score descending
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.as_ref().cmp(b.1.as_ref())));

    scored.into_iter().take(count).map(|(_, node)| node).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashMap;

    #[test]
    fn test_hrw_deterministic() {
        let nodes = vec!["node-a", "node-b", "node-c"];
        let first = hrw_select("123/456/source/sink", &nodes);
        for _ in 0..10 {
            assert_eq!(hrw_select("123/456/source/sink", &nodes), first);
        }

        // Order of the node list does not matter
        let reversed: Vec<&str> = nodes.iter().rev().copied().collect();
        assert_eq!(hrw_select("123/456/source/sink", &reversed), first);
    }

    #[test]
    fn test_hrw_empty() {
        let nodes: Vec<String> = Vec::new();
        assert!(hrw_select("key", &nodes).is_none());
        assert!(hrw_select_n("key", &nodes, 3).is_empty());
    }

    #[test]
    fn test_hrw_select_n_distinct() {
        let nodes = vec!["v1", "v2", "v3", "v4"];
        let selected = hrw_select_n("file", &nodes, 2);
        assert_eq!(selected.len(), 2);
        assert_ne!(selected[0], selected[1]);
        assert_eq!(Some(selected[0]), hrw_select("file", &nodes));
        assert_eq!(hrw_select_n("file", &nodes, 10).len(), 4);
    }

    #[test]
    fn test_hrw_minimal_remapping() {
        let all = vec!["n1", "n2", "n3", "n4"];
        let without_n4 = vec!["n1", "n2", "n3"];
        for i in 0..500 {
            let key = format!("key-{i}");
            let before = *hrw_select(&key, &all).unwrap();
            let after = *hrw_select(&key, &without_n4).unwrap();
            if before != "n4" {
                assert_eq!(before, after, "key {key} moved without its owner leaving");
            }
        }
    }

    #[test]
    fn test_hrw_balance() {
        let nodes: Vec<String> = (0..8).map(|i| format!("node-{i}")).collect();
        let mut rng = rand::thread_rng();

        let mut selection_count: HashMap<&String, usize> = HashMap::new();
        for _ in 0..2000 {
            let key = format!("key-{}", rng.r#gen::<u64>());
            *selection_count.entry(hrw_select(&key, &nodes).unwrap()).or_default() += 1;
        }

        // With 8 nodes and 2000 keys, each should get ~250 keys
        for count in selection_count.values() {
            assert!(
                *count > 150 && *count < 350,
                "Unbalanced selection: {count} (expected ~250)"
            );
        }
    }
}
