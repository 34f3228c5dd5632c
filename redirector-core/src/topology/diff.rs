//! Stack set differences.

use std::collections::HashSet;

use crate::domain::stack::StackPath;

/// Stacks that appeared and disappeared between two observations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackDiff {
    /// Present now, absent before.
    pub added: HashSet<StackPath>,
    /// Present before, absent now.
    pub removed: HashSet<StackPath>,
}

impl StackDiff {
    /// `added = current - previous`, `removed = previous - current`.
    pub fn between(previous: &HashSet<StackPath>, current: &HashSet<StackPath>) -> Self {
        Self {
            added: current.difference(previous).cloned().collect(),
            removed: previous.difference(current).cloned().collect(),
        }
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn path(dc: u8, zone: u8) -> StackPath {
        StackPath::new(format!("DC{dc}"), "R1", format!("Zone{zone}"), "app").unwrap()
    }

    #[test]
    fn test_added_and_removed() {
        let previous: HashSet<_> = [path(1, 1), path(1, 2)].into_iter().collect();
        let current: HashSet<_> = [path(1, 2), path(2, 1)].into_iter().collect();
        let diff = StackDiff::between(&previous, &current);
        assert_eq!(diff.added, [path(2, 1)].into_iter().collect());
        assert_eq!(diff.removed, [path(1, 1)].into_iter().collect());
    }

    fn arb_paths() -> impl Strategy<Value = HashSet<StackPath>> {
        prop::collection::hash_set((0u8..4, 0u8..4).prop_map(|(dc, z)| path(dc, z)), 0..12)
    }

    proptest! {
        #[test]
        fn prop_diff_is_set_difference(previous in arb_paths(), current in arb_paths()) {
            let diff = StackDiff::between(&previous, &current);
            prop_assert!(diff.added.is_disjoint(&diff.removed));
            for p in &diff.added {
                prop_assert!(current.contains(p) && !previous.contains(p));
            }
            for p in &diff.removed {
                prop_assert!(previous.contains(p) && !current.contains(p));
            }
            let expected_added = current.iter().filter(|p| !previous.contains(*p)).count();
            prop_assert_eq!(diff.added.len(), expected_added);
        }

        #[test]
        fn prop_same_sets_yield_empty_diff(set in arb_paths()) {
            prop_assert!(StackDiff::between(&set, &set).is_empty());
        }
    }
}
