//! Dependency-ordered dataset serialization
//!
//! Persistent backends write a full dataset item by item, and a concurrent
//! reader may observe the partial write. Ordering segments before flags, and
//! every flag after its prerequisites, guarantees such a reader only sees
//! items whose dependencies already exist.

use std::collections::{HashMap, HashSet};

use crate::store::{DataKind, FullDataSet, ItemDescriptor, KeyedItems, StoreItem};

/// Reorders a full dataset into dependency order: segments first, then flags
/// topologically sorted by prerequisite references. Cyclic prerequisites
/// cannot deadlock the sort; members of a cycle come out in input order.
pub fn sort_all_collections(data: FullDataSet) -> FullDataSet {
    let mut segments = KeyedItems::new();
    let mut flags = KeyedItems::new();
    for (kind, items) in data {
        match kind {
            DataKind::Segments => segments.extend(items),
            DataKind::Features => flags.extend(items),
        }
    }
    vec![
        (DataKind::Segments, segments),
        (DataKind::Features, sort_flags_by_prerequisites(flags)),
    ]
}

fn prerequisite_keys(item: &ItemDescriptor) -> Vec<String> {
    match &item.item {
        Some(StoreItem::Flag(f)) => f.prerequisites.iter().map(|p| p.key.clone()).collect(),
        _ => Vec::new(),
    }
}

fn sort_flags_by_prerequisites(items: KeyedItems) -> KeyedItems {
    let order: Vec<String> = items.iter().map(|(k, _)| k.clone()).collect();
    let mut by_key: HashMap<String, ItemDescriptor> = items.into_iter().collect();
    let mut emitted: HashSet<String> = HashSet::new();
    let mut result = KeyedItems::new();

    // Iterative DFS; `in_progress` breaks prerequisite cycles.
    for root in order {
        let mut stack = vec![(root, false)];
        let mut in_progress: HashSet<String> = HashSet::new();
        while let Some((key, children_done)) = stack.pop() {
            if children_done {
                in_progress.remove(&key);
                if let Some(item) = by_key.remove(&key) {
                    emitted.insert(key.clone());
                    result.push((key, item));
                }
                continue;
            }
            if emitted.contains(&key) || in_progress.contains(&key) {
                continue;
            }
            let Some(item) = by_key.get(&key) else {
                continue;
            };
            in_progress.insert(key.clone());
            let deps = prerequisite_keys(item);
            stack.push((key, true));
            for dep in deps {
                if !emitted.contains(&dep) && !in_progress.contains(&dep) {
                    stack.push((dep, false));
                }
            }
        }
    }
    result
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::flag::FeatureFlag;
    use crate::model::segment::Segment;
    use serde_json::json;

    fn flag_with_prereqs(key: &str, prereqs: &[&str]) -> (String, ItemDescriptor) {
        let prerequisites: Vec<_> = prereqs
            .iter()
            .map(|k| json!({"key": k, "variation": 0}))
            .collect();
        let f: FeatureFlag = serde_json::from_value(json!({
            "key": key, "version": 1, "prerequisites": prerequisites
        }))
        .unwrap();
        (key.to_string(), ItemDescriptor::flag(f))
    }

    fn segment(key: &str) -> (String, ItemDescriptor) {
        let s: Segment =
            serde_json::from_value(json!({"key": key, "version": 1})).unwrap();
        (key.to_string(), ItemDescriptor::segment(s))
    }

    fn position(items: &KeyedItems, key: &str) -> usize {
        items.iter().position(|(k, _)| k == key).unwrap()
    }

    #[test]
    fn test_segments_come_before_flags() {
        let sorted = sort_all_collections(vec![
            (DataKind::Features, vec![flag_with_prereqs("f", &[])]),
            (DataKind::Segments, vec![segment("s")]),
        ]);
        assert_eq!(sorted[0].0, DataKind::Segments);
        assert_eq!(sorted[1].0, DataKind::Features);
    }

    #[test]
    fn test_flags_sorted_after_their_prerequisites() {
        let sorted = sort_all_collections(vec![(
            DataKind::Features,
            vec![
                flag_with_prereqs("a", &["b", "c"]),
                flag_with_prereqs("b", &["c"]),
                flag_with_prereqs("c", &[]),
            ],
        )]);
        let flags = &sorted[1].1;
        assert_eq!(flags.len(), 3);
        assert!(position(flags, "c") < position(flags, "b"));
        assert!(position(flags, "b") < position(flags, "a"));
    }

    #[test]
    fn test_missing_prerequisites_are_ignored() {
        let sorted = sort_all_collections(vec![(
            DataKind::Features,
            vec![flag_with_prereqs("a", &["ghost"])],
        )]);
        assert_eq!(sorted[1].1.len(), 1);
    }

    #[test]
    fn test_prerequisite_cycle_does_not_hang_or_drop_items() {
        let sorted = sort_all_collections(vec![(
            DataKind::Features,
            vec![
                flag_with_prereqs("a", &["b"]),
                flag_with_prereqs("b", &["a"]),
                flag_with_prereqs("c", &[]),
            ],
        )]);
        let flags = &sorted[1].1;
        assert_eq!(flags.len(), 3);
    }
}
