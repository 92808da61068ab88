use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

/// The smallest completable unit of a hierarchy
pub trait Leaf {
    fn leaf_id(&self) -> i64;
    fn points(&self) -> u32;
    fn estimated_minutes(&self) -> u32;
}

/// A bucket of leaves: a curriculum module or a weekday
pub trait Branch {
    type Leaf: Leaf;

    fn branch_id(&self) -> i64;
    fn leaves(&self) -> &[Self::Leaf];
}

/// A two-level tree of leaves: a program or a weekly schedule
pub trait Tree {
    type Branch: Branch;

    fn branches(&self) -> &[Self::Branch];
}

/// Anything that can answer "has this leaf been completed"
pub trait CompletionLookup {
    fn is_completed(&self, leaf_id: i64) -> bool;
}

impl CompletionLookup for HashSet<i64> {
    fn is_completed(&self, leaf_id: i64) -> bool {
        self.contains(&leaf_id)
    }
}

impl CompletionLookup for BTreeSet<i64> {
    fn is_completed(&self, leaf_id: i64) -> bool {
        self.contains(&leaf_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub leaf_total: u32,
    pub leaf_completed: u32,
    pub percent: u8,
    pub points_earned: u64,
    pub points_available: u64,
    pub minutes_total: u64,
    pub minutes_completed: u64,
    pub by_child: BTreeMap<i64, AggregateResult>,
}

impl AggregateResult {
    pub fn is_complete(&self) -> bool {
        self.leaf_total > 0 && self.leaf_completed == self.leaf_total
    }

    fn absorb(&mut self, child_id: i64, child: AggregateResult) {
        self.leaf_total += child.leaf_total;
        self.leaf_completed += child.leaf_completed;
        self.points_earned += child.points_earned;
        self.points_available += child.points_available;
        self.minutes_total += child.minutes_total;
        self.minutes_completed += child.minutes_completed;
        self.by_child.insert(child_id, child);
    }

    fn finish(mut self) -> Self {
        self.percent = percent_of(self.leaf_completed, self.leaf_total);
        self
    }
}

/// Whole-number percentage, truncated. An empty branch reports 0.
pub fn percent_of(completed: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let completed = completed.min(total) as u64;
    ((100 * completed) / total as u64) as u8
}

/// Aggregate completion over a whole tree, bottom-up.
///
/// Completion ids that match no current leaf are ignored, and leaves added after
/// completions were recorded count toward the total.
pub fn aggregate<T, C>(tree: &T, completed: &C) -> AggregateResult
where
    T: Tree,
    C: CompletionLookup + ?Sized,
{
    let mut result = AggregateResult::default();
    for branch in tree.branches() {
        result.absorb(branch.branch_id(), aggregate_branch(branch, completed));
    }
    result.finish()
}

pub fn aggregate_branch<B, C>(branch: &B, completed: &C) -> AggregateResult
where
    B: Branch,
    C: CompletionLookup + ?Sized,
{
    let mut result = AggregateResult::default();
    for leaf in branch.leaves() {
        result.absorb(leaf.leaf_id(), aggregate_leaf(leaf, completed));
    }
    result.finish()
}

fn aggregate_leaf<L, C>(leaf: &L, completed: &C) -> AggregateResult
where
    L: Leaf,
    C: CompletionLookup + ?Sized,
{
    let done = completed.is_completed(leaf.leaf_id());
    let points = leaf.points() as u64;
    let minutes = leaf.estimated_minutes() as u64;

    AggregateResult {
        leaf_total: 1,
        leaf_completed: done as u32,
        percent: if done { 100 } else { 0 },
        points_earned: if done { points } else { 0 },
        points_available: points,
        minutes_total: minutes,
        minutes_completed: if done { minutes } else { 0 },
        by_child: BTreeMap::new(),
    }
}

/// Every leaf id currently reachable from the tree
pub fn leaf_ids<T: Tree>(tree: &T) -> BTreeSet<i64> {
    tree.branches()
        .iter()
        .flat_map(|b| b.leaves().iter().map(|l| l.leaf_id()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    struct TestLeaf(i64, u32);
    struct TestBranch(i64, Vec<TestLeaf>);
    struct TestTree(Vec<TestBranch>);

    impl Leaf for TestLeaf {
        fn leaf_id(&self) -> i64 {
            self.0
        }
        fn points(&self) -> u32 {
            self.1
        }
        fn estimated_minutes(&self) -> u32 {
            10
        }
    }

    impl Branch for TestBranch {
        type Leaf = TestLeaf;
        fn branch_id(&self) -> i64 {
            self.0
        }
        fn leaves(&self) -> &[TestLeaf] {
            &self.1
        }
    }

    impl Tree for TestTree {
        type Branch = TestBranch;
        fn branches(&self) -> &[TestBranch] {
            &self.0
        }
    }

    /// M1: two activities worth 5, M2: one activity worth 10
    fn sample_tree() -> TestTree {
        TestTree(vec![
            TestBranch(1, vec![TestLeaf(11, 5), TestLeaf(12, 5)]),
            TestBranch(2, vec![TestLeaf(21, 10)]),
        ])
    }

    /// Tree from a list of per-branch point lists; leaf ids are sequential
    fn tree_from_shape(shape: &[Vec<u32>]) -> TestTree {
        let mut next_id = 0;
        TestTree(
            shape
                .iter()
                .enumerate()
                .map(|(b, leaves)| {
                    let leaves = leaves
                        .iter()
                        .map(|p| {
                            next_id += 1;
                            TestLeaf(next_id, *p)
                        })
                        .collect();
                    TestBranch(b as i64, leaves)
                })
                .collect(),
        )
    }

    #[test]
    fn test_points_roll_up() {
        let tree = sample_tree();
        let completed: HashSet<i64> = [11, 12].into_iter().collect();
        let result = aggregate(&tree, &completed);

        assert_eq!(result.points_earned, 10);
        assert_eq!(result.points_available, 20);
        assert_eq!(result.leaf_total, 3);
        assert_eq!(result.leaf_completed, 2);
        assert_eq!(result.percent, 66);
        assert_eq!(result.by_child[&1].percent, 100);
        assert_eq!(result.by_child[&2].percent, 0);
        assert_eq!(result.by_child[&1].by_child[&11].percent, 100);
        assert_eq!(result.minutes_completed, 20);
    }

    #[test]
    fn test_empty_branch_reports_zero() {
        let tree = TestTree(vec![TestBranch(1, vec![])]);
        let result = aggregate(&tree, &HashSet::new());
        assert_eq!(result.percent, 0);
        assert_eq!(result.by_child[&1].percent, 0);
        assert!(!result.is_complete());

        let empty = TestTree(vec![]);
        assert_eq!(aggregate(&empty, &HashSet::new()), AggregateResult::default());
    }

    #[test]
    fn test_stale_completion_ids_ignored() {
        let tree = sample_tree();
        let completed: BTreeSet<i64> = [11, 999].into_iter().collect();
        let result = aggregate(&tree, &completed);
        assert_eq!(result.leaf_completed, 1);
        assert_eq!(result.percent, 33);
    }

    #[test]
    fn test_added_leaf_lowers_percent() {
        let completed: HashSet<i64> = [11, 12, 21].into_iter().collect();
        let mut tree = sample_tree();
        assert_eq!(aggregate(&tree, &completed).percent, 100);

        tree.0[1].1.push(TestLeaf(22, 10));
        let result = aggregate(&tree, &completed);
        assert_eq!(result.percent, 75);
        assert_eq!(result.points_available, 30);
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(0, 0), 0);
        assert_eq!(percent_of(2, 3), 66);
        assert_eq!(percent_of(199, 200), 99);
        assert_eq!(percent_of(3, 3), 100);
    }

    #[test]
    fn test_leaf_ids() {
        let ids = leaf_ids(&sample_tree());
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![11, 12, 21]);
    }

    fn shape_strategy() -> impl Strategy<Value = Vec<Vec<u32>>> {
        prop::collection::vec(prop::collection::vec(0u32..50, 0..6), 0..6)
    }

    proptest! {
        #[test]
        fn prop_percent_in_range_and_100_iff_all_done(
            shape in shape_strategy(),
            mask in prop::collection::vec(any::<bool>(), 36),
        ) {
            let tree = tree_from_shape(&shape);
            let ids = leaf_ids(&tree);
            let completed: HashSet<i64> = ids
                .iter()
                .filter(|id| mask[(**id as usize - 1) % mask.len()])
                .copied()
                .collect();
            let result = aggregate(&tree, &completed);

            prop_assert!(result.percent <= 100);
            let all_done = !ids.is_empty() && ids.iter().all(|id| completed.contains(id));
            prop_assert_eq!(result.percent == 100, all_done);
        }

        #[test]
        fn prop_one_more_completion_never_decreases(
            shape in shape_strategy(),
            mask in prop::collection::vec(any::<bool>(), 36),
            pick in any::<prop::sample::Index>(),
        ) {
            let tree = tree_from_shape(&shape);
            let ids: Vec<i64> = leaf_ids(&tree).into_iter().collect();
            prop_assume!(!ids.is_empty());

            let mut completed: HashSet<i64> = ids
                .iter()
                .filter(|id| mask[(**id as usize - 1) % mask.len()])
                .copied()
                .collect();
            let before = aggregate(&tree, &completed);
            completed.insert(ids[pick.index(ids.len())]);
            let after = aggregate(&tree, &completed);

            prop_assert!(after.percent >= before.percent);
            for (branch_id, branch_before) in &before.by_child {
                prop_assert!(after.by_child[branch_id].percent >= branch_before.percent);
            }
        }
    }
}
