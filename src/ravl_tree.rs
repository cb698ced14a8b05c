//! A non-blocking rank-balanced tree: a relaxed weak-AVL discipline over
//! the same LLX/SCX engine as the chromatic tree.
//!
//! Every node carries a non-negative rank; leaves have rank 0 and sentinels
//! pin theirs at `u64::MAX`. Insertions may create a child that shares its
//! parent's rank; the rebalancer repairs such violations with promotions and
//! (double) rotations. Deletions splice the sibling in directly and tolerate
//! the rank slack they leave behind.

use std::fmt;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{pin, unprotected, Atomic, Guard, Owned, Shared};

use crate::concurrent_set::ConcurrentSet;
use crate::llx_scx::{
    has_child, help_scx, make_op, release, sequential_size, subtree_height, weak_llx, Node,
    Observed, Operation,
};

/// Concurrent ordered set over `u64` keys with rank-based rebalancing.
/// `u64::MAX` is reserved for the sentinel keys.
pub struct RavlTree {
    root: Atomic<Node>,
    dummy: Atomic<Operation>,
    violation_bound: usize,
}

fn is_sentinel(node: &Node) -> bool {
    node.key == u64::MAX
}

fn can_promote(pz: Shared<'_, Node>, z: Shared<'_, Node>, zs: Shared<'_, Node>) -> bool {
    if pz.is_null() || z.is_null() || zs.is_null() {
        return false;
    }
    let pz_rank = unsafe { pz.deref() }.balance;
    let z_rank = unsafe { z.deref() }.balance;
    if pz_rank == z_rank {
        return false;
    }
    // promoting z would only move the violation onto its 0-child sibling
    if pz_rank == z_rank + 1 && pz_rank == unsafe { zs.deref() }.balance {
        return false;
    }
    true
}

impl RavlTree {
    /// Creates an empty tree. With `violation_bound == 0` every insertion
    /// eagerly repairs the violations it creates; with a larger bound,
    /// rebalancing runs only once that many violations accumulate on a
    /// traversed path.
    pub fn new(violation_bound: usize) -> Self {
        let guard = unsafe { unprotected() };
        let dummy = Atomic::new(Operation::dummy());
        let dummy_sh = dummy.load(Ordering::Relaxed, guard);
        let sentinel = Owned::new(Node::new(
            u64::MAX,
            u64::MAX,
            Shared::null(),
            Shared::null(),
            dummy_sh,
        ))
        .into_shared(guard);
        let root = Owned::new(Node::new(
            u64::MAX,
            u64::MAX,
            sentinel,
            Shared::null(),
            dummy_sh,
        ))
        .into_shared(guard);
        Self {
            root: Atomic::from(root),
            dummy,
            violation_bound,
        }
    }

    pub fn get(&self, key: u64, guard: &Guard) -> bool {
        assert_ne!(key, u64::MAX, "u64::MAX is reserved for the sentinel keys");
        let root_ref = unsafe { self.root.load(Ordering::Acquire, guard).deref() };
        let top = root_ref.left.load(Ordering::Acquire, guard);
        let mut l = unsafe { top.deref() }.left.load(Ordering::Acquire, guard);
        if l.is_null() {
            return false;
        }
        loop {
            let l_ref = unsafe { l.deref() };
            let left = l_ref.left.load(Ordering::Acquire, guard);
            if left.is_null() {
                return l_ref.key == key;
            }
            l = if key < l_ref.key {
                left
            } else {
                l_ref.right.load(Ordering::Acquire, guard)
            };
        }
    }

    pub fn insert(&self, key: u64, guard: &Guard) -> bool {
        assert_ne!(key, u64::MAX, "u64::MAX is reserved for the sentinel keys");
        loop {
            let mut p = self.root.load(Ordering::Acquire, guard);
            let mut l = unsafe { p.deref() }.left.load(Ordering::Acquire, guard);
            let mut count = 0;
            if !unsafe { l.deref() }.left.load(Ordering::Acquire, guard).is_null() {
                // l has key infinity here, so the first keyed step goes left.
                p = l;
                l = unsafe { l.deref() }.left.load(Ordering::Acquire, guard);
                loop {
                    let l_ref = unsafe { l.deref() };
                    let left = l_ref.left.load(Ordering::Acquire, guard);
                    if left.is_null() {
                        break;
                    }
                    if self.violation_bound > 0
                        && l_ref.balance == unsafe { p.deref() }.balance
                    {
                        count += 1;
                    }
                    p = l;
                    l = if key < l_ref.key {
                        left
                    } else {
                        l_ref.right.load(Ordering::Acquire, guard)
                    };
                }
            }

            let l_ref = unsafe { l.deref() };
            if l_ref.key == key {
                return false;
            }
            let l_rank = l_ref.balance;
            let op = match self.create_insert_op(p, l, key, guard) {
                Some(op) => op,
                None => continue,
            };
            if help_scx(op, 0, guard) {
                if self.violation_bound == 0 {
                    // The replacement parent shares the old leaf's rank 0.
                    if l_rank == 0 {
                        self.fix_to_key(key, guard);
                    }
                } else if count >= self.violation_bound {
                    self.fix_to_key(key, guard);
                }
                return true;
            }
        }
    }

    /// Deletion installs the sibling directly under the grandparent; any
    /// rank slack this leaves is tolerated by the relaxed discipline.
    pub fn remove(&self, key: u64, guard: &Guard) -> bool {
        assert_ne!(key, u64::MAX, "u64::MAX is reserved for the sentinel keys");
        loop {
            let mut gp = self.root.load(Ordering::Acquire, guard);
            let mut p = gp;
            let mut l = unsafe { p.deref() }.left.load(Ordering::Acquire, guard);
            if !unsafe { l.deref() }.left.load(Ordering::Acquire, guard).is_null() {
                gp = p;
                p = l;
                l = unsafe { l.deref() }.left.load(Ordering::Acquire, guard);
                loop {
                    let l_ref = unsafe { l.deref() };
                    let left = l_ref.left.load(Ordering::Acquire, guard);
                    if left.is_null() {
                        break;
                    }
                    gp = p;
                    p = l;
                    l = if key < l_ref.key {
                        left
                    } else {
                        l_ref.right.load(Ordering::Acquire, guard)
                    };
                }
            }

            if unsafe { l.deref() }.key != key {
                return false;
            }
            let op = match self.create_remove_op(gp, p, l, guard) {
                Some(op) => op,
                None => continue,
            };
            if help_scx(op, 0, guard) {
                return true;
            }
        }
    }

    /// Leaf count excluding sentinels. Not linearizable; callers must
    /// quiesce the tree first.
    pub fn size(&self) -> usize {
        let guard = &pin();
        sequential_size(self.root.load(Ordering::Relaxed, guard), guard)
    }

    /// Height of the user-data subtree. Not linearizable; callers must
    /// quiesce the tree first.
    pub fn height(&self) -> usize {
        let guard = &pin();
        let root_ref = unsafe { self.root.load(Ordering::Relaxed, guard).deref() };
        let top = root_ref.left.load(Ordering::Relaxed, guard);
        subtree_height(unsafe { top.deref() }.left.load(Ordering::Relaxed, guard), guard)
    }

    fn make_node<'g>(
        &self,
        key: u64,
        rank: u64,
        left: Shared<'g, Node>,
        right: Shared<'g, Node>,
        guard: &'g Guard,
    ) -> Shared<'g, Node> {
        let dummy = self.dummy.load(Ordering::Relaxed, guard);
        Owned::new(Node::new(key, rank, left, right, dummy)).into_shared(guard)
    }

    fn create_insert_op<'g>(
        &self,
        p: Shared<'g, Node>,
        l: Shared<'g, Node>,
        key: u64,
        guard: &'g Guard,
    ) -> Option<Shared<'g, Operation>> {
        let p_ref = unsafe { p.deref() };
        let op_p = weak_llx(p_ref, guard)?;
        if !has_child(p_ref, l, guard) {
            return None;
        }
        let l_ref = unsafe { l.deref() };
        let op_l = weak_llx(l_ref, guard)?;

        // The copied leaf keeps rank 0 unless it is the sentinel leaf.
        let copied_rank = if is_sentinel(l_ref) { u64::MAX } else { 0 };
        let new_leaf = self.make_node(key, 0, Shared::null(), Shared::null(), guard);
        let new_l = self.make_node(
            l_ref.key,
            copied_rank,
            l_ref.left.load(Ordering::Acquire, guard),
            l_ref.right.load(Ordering::Acquire, guard),
            guard,
        );
        let subtree = if key < l_ref.key {
            self.make_node(l_ref.key, l_ref.balance, new_leaf, new_l, guard)
        } else {
            self.make_node(key, l_ref.balance, new_l, new_leaf, guard)
        };
        Some(make_op(
            vec![(p, op_p).into(), (l, op_l).into()],
            subtree,
            guard,
        ))
    }

    fn create_remove_op<'g>(
        &self,
        gp: Shared<'g, Node>,
        p: Shared<'g, Node>,
        l: Shared<'g, Node>,
        guard: &'g Guard,
    ) -> Option<Shared<'g, Operation>> {
        let gp_ref = unsafe { gp.deref() };
        let op_gp = weak_llx(gp_ref, guard)?;
        if !has_child(gp_ref, p, guard) {
            return None;
        }
        let p_ref = unsafe { p.deref() };
        let op_p = weak_llx(p_ref, guard)?;

        let p_left = p_ref.left.load(Ordering::Acquire, guard);
        let left = l == p_left;
        if !left && l != p_ref.right.load(Ordering::Acquire, guard) {
            return None;
        }
        let l_ref = unsafe { l.deref() };
        let op_l = weak_llx(l_ref, guard)?;

        // The sibling moves up unchanged; no new node is built.
        let subtree = if left {
            p_ref.right.load(Ordering::Acquire, guard)
        } else {
            p_left
        };
        Some(make_op(
            vec![(gp, op_gp).into(), (p, op_p).into(), (l, op_l).into()],
            subtree,
            guard,
        ))
    }

    /// Repeatedly re-descend toward `key`, repairing the first rank
    /// violation on the path, until a clean descent reaches a leaf.
    ///
    /// A violation is a child sharing its parent's rank; it is repaired at
    /// that child, or at its sibling when the sibling is the 0-child of a
    /// parent whose other child is a 1-child.
    fn fix_to_key(&self, key: u64, guard: &Guard) {
        'restart: loop {
            let root = self.root.load(Ordering::Acquire, guard);
            let top = unsafe { root.deref() }.left.load(Ordering::Acquire, guard);
            let mut l = unsafe { top.deref() }.left.load(Ordering::Acquire, guard);
            if l.is_null() {
                return; // only sentinels in the tree
            }
            let mut p = top;
            loop {
                let l_ref = unsafe { l.deref() };
                let left = l_ref.left.load(Ordering::Acquire, guard);
                if left.is_null() {
                    return; // no violation; the search hit a leaf
                }
                let gp = p;
                p = l;
                // The sibling is the child of p on the side not descended.
                let (child, sibling) = if key < l_ref.key {
                    (left, l_ref.right.load(Ordering::Acquire, guard))
                } else {
                    (l_ref.right.load(Ordering::Acquire, guard), left)
                };
                l = child;
                let p_rank = l_ref.balance;
                let l_rank = unsafe { l.deref() }.balance;
                if l_rank == p_rank {
                    if let Some(op) = self.create_balancing_op(gp, p, l, guard) {
                        help_scx(op, 0, guard);
                    }
                    continue 'restart;
                }
                let s_rank = unsafe { sibling.deref() }.balance;
                if l_rank + 1 == p_rank && s_rank == p_rank {
                    if let Some(op) = self.create_balancing_op(gp, p, sibling, guard) {
                        help_scx(op, 0, guard);
                    }
                    continue 'restart;
                }
            }
        }
    }

    /// `x` shares the rank of its parent `z` (child of `pz`). Promote `z`
    /// when `x`'s sibling is close enough in rank, otherwise rotate `x` up,
    /// in one of two rank flavors, or double-rotate on `x`'s inner child.
    fn create_balancing_op<'g>(
        &self,
        pz: Shared<'g, Node>,
        z: Shared<'g, Node>,
        x: Shared<'g, Node>,
        guard: &'g Guard,
    ) -> Option<Shared<'g, Operation>> {
        let pz_ref = unsafe { pz.deref() };
        let op_pz = weak_llx(pz_ref, guard)?;
        let pz_left = pz_ref.left.load(Ordering::Acquire, guard);
        let z_is_left = z == pz_left;
        if !z_is_left && z != pz_ref.right.load(Ordering::Acquire, guard) {
            return None;
        }
        let zs = if z_is_left {
            pz_ref.right.load(Ordering::Acquire, guard)
        } else {
            pz_left
        };

        let z_ref = unsafe { z.deref() };
        let op_z = weak_llx(z_ref, guard)?;
        let z_left = z_ref.left.load(Ordering::Acquire, guard);
        let left = x == z_left;
        if !left && x != z_ref.right.load(Ordering::Acquire, guard) {
            return None;
        }
        let xs = if left {
            z_ref.right.load(Ordering::Acquire, guard)
        } else {
            z_left
        };

        let x_ref = unsafe { x.deref() };
        if z_ref.balance != x_ref.balance {
            return None;
        }

        let xs_rank = unsafe { xs.deref() }.balance;
        if z_ref.balance == xs_rank || z_ref.balance == xs_rank + 1 {
            // z is a 0,0- or 0,1-node: promote it
            if !can_promote(pz, z, zs) {
                return None;
            }
            return Some(self.create_promote_op((pz, op_pz), (z, op_z), guard));
        }

        let op_x = weak_llx(x_ref, guard)?;
        let (y, ys) = if left {
            (
                x_ref.right.load(Ordering::Acquire, guard),
                x_ref.left.load(Ordering::Acquire, guard),
            )
        } else {
            (
                x_ref.left.load(Ordering::Acquire, guard),
                x_ref.right.load(Ordering::Acquire, guard),
            )
        };
        if y.is_null() || x_ref.balance >= unsafe { y.deref() }.balance + 2 {
            return Some(self.create_rotate1_op((pz, op_pz), (z, op_z), (x, op_x), left, guard));
        }
        let y_rank = unsafe { y.deref() }.balance;
        let ys_rank = unsafe { ys.deref() }.balance;
        if x_ref.balance == y_rank + 1 && x_ref.balance == ys_rank + 1 {
            if !can_promote(pz, z, zs) {
                return None;
            }
            return Some(self.create_rotate2_op((pz, op_pz), (z, op_z), (x, op_x), left, guard));
        }
        let op_y = weak_llx(unsafe { y.deref() }, guard)?;
        Some(self.create_double_rotate_op(
            (pz, op_pz),
            (z, op_z),
            (x, op_x),
            (y, op_y),
            left,
            guard,
        ))
    }

    fn create_promote_op<'g>(
        &self,
        pz: Observed<'g>,
        z: Observed<'g>,
        guard: &'g Guard,
    ) -> Shared<'g, Operation> {
        let z_ref = unsafe { z.0.deref() };
        let subtree = self.make_node(
            z_ref.key,
            z_ref.balance + 1,
            z_ref.left.load(Ordering::Acquire, guard),
            z_ref.right.load(Ordering::Acquire, guard),
            guard,
        );
        make_op(vec![pz.into(), z.into()], subtree, guard)
    }

    /// Single rotation that demotes `z` below `x`.
    fn create_rotate1_op<'g>(
        &self,
        pz: Observed<'g>,
        z: Observed<'g>,
        x: Observed<'g>,
        left: bool,
        guard: &'g Guard,
    ) -> Shared<'g, Operation> {
        let z_ref = unsafe { z.0.deref() };
        let x_ref = unsafe { x.0.deref() };
        let subtree = if left {
            let new_z = self.make_node(
                z_ref.key,
                z_ref.balance.saturating_sub(1),
                x_ref.right.load(Ordering::Acquire, guard),
                z_ref.right.load(Ordering::Acquire, guard),
                guard,
            );
            self.make_node(
                x_ref.key,
                x_ref.balance,
                x_ref.left.load(Ordering::Acquire, guard),
                new_z,
                guard,
            )
        } else {
            let new_z = self.make_node(
                z_ref.key,
                z_ref.balance.saturating_sub(1),
                z_ref.left.load(Ordering::Acquire, guard),
                x_ref.left.load(Ordering::Acquire, guard),
                guard,
            );
            self.make_node(
                x_ref.key,
                x_ref.balance,
                new_z,
                x_ref.right.load(Ordering::Acquire, guard),
                guard,
            )
        };
        make_op(vec![pz.into(), z.into(), x.into()], subtree, guard)
    }

    /// Single rotation that promotes `x` instead of demoting `z`.
    fn create_rotate2_op<'g>(
        &self,
        pz: Observed<'g>,
        z: Observed<'g>,
        x: Observed<'g>,
        left: bool,
        guard: &'g Guard,
    ) -> Shared<'g, Operation> {
        let z_ref = unsafe { z.0.deref() };
        let x_ref = unsafe { x.0.deref() };
        let subtree = if left {
            let new_z = self.make_node(
                z_ref.key,
                z_ref.balance,
                x_ref.right.load(Ordering::Acquire, guard),
                z_ref.right.load(Ordering::Acquire, guard),
                guard,
            );
            self.make_node(
                x_ref.key,
                x_ref.balance + 1,
                x_ref.left.load(Ordering::Acquire, guard),
                new_z,
                guard,
            )
        } else {
            let new_z = self.make_node(
                z_ref.key,
                z_ref.balance,
                z_ref.left.load(Ordering::Acquire, guard),
                x_ref.left.load(Ordering::Acquire, guard),
                guard,
            );
            self.make_node(
                x_ref.key,
                x_ref.balance + 1,
                new_z,
                x_ref.right.load(Ordering::Acquire, guard),
                guard,
            )
        };
        make_op(vec![pz.into(), z.into(), x.into()], subtree, guard)
    }

    /// `x`'s inner child `y` rises above both `x` and `z`.
    fn create_double_rotate_op<'g>(
        &self,
        pz: Observed<'g>,
        z: Observed<'g>,
        x: Observed<'g>,
        y: Observed<'g>,
        left: bool,
        guard: &'g Guard,
    ) -> Shared<'g, Operation> {
        let z_ref = unsafe { z.0.deref() };
        let x_ref = unsafe { x.0.deref() };
        let y_ref = unsafe { y.0.deref() };
        let subtree = if left {
            let new_z = self.make_node(
                z_ref.key,
                z_ref.balance.saturating_sub(1),
                y_ref.right.load(Ordering::Acquire, guard),
                z_ref.right.load(Ordering::Acquire, guard),
                guard,
            );
            let new_x = self.make_node(
                x_ref.key,
                x_ref.balance.saturating_sub(1),
                x_ref.left.load(Ordering::Acquire, guard),
                y_ref.left.load(Ordering::Acquire, guard),
                guard,
            );
            self.make_node(y_ref.key, y_ref.balance + 1, new_x, new_z, guard)
        } else {
            let new_z = self.make_node(
                z_ref.key,
                z_ref.balance.saturating_sub(1),
                z_ref.left.load(Ordering::Acquire, guard),
                y_ref.left.load(Ordering::Acquire, guard),
                guard,
            );
            let new_x = self.make_node(
                x_ref.key,
                x_ref.balance.saturating_sub(1),
                y_ref.right.load(Ordering::Acquire, guard),
                x_ref.right.load(Ordering::Acquire, guard),
                guard,
            );
            self.make_node(y_ref.key, y_ref.balance + 1, new_z, new_x, guard)
        };
        make_op(
            vec![pz.into(), z.into(), x.into(), y.into()],
            subtree,
            guard,
        )
    }
}

impl Drop for RavlTree {
    fn drop(&mut self) {
        release(&self.root, &self.dummy);
    }
}

impl fmt::Debug for RavlTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn walk(
            f: &mut fmt::Formatter<'_>,
            node: Shared<'_, Node>,
            depth: usize,
            guard: &Guard,
        ) -> fmt::Result {
            if node.is_null() {
                return Ok(());
            }
            let node_ref = unsafe { node.deref() };
            writeln!(
                f,
                "{:indent$}(key: {}, rank: {})",
                "",
                node_ref.key,
                node_ref.balance,
                indent = depth
            )?;
            walk(f, node_ref.left.load(Ordering::Relaxed, guard), depth + 1, guard)?;
            walk(f, node_ref.right.load(Ordering::Relaxed, guard), depth + 1, guard)
        }
        let guard = &pin();
        walk(f, self.root.load(Ordering::Relaxed, guard), 0, guard)
    }
}

impl ConcurrentSet for RavlTree {
    fn new() -> Self {
        RavlTree::new(0)
    }

    fn get(&self, key: u64, guard: &Guard) -> bool {
        self.get(key, guard)
    }

    fn insert(&self, key: u64, guard: &Guard) -> bool {
        self.insert(key, guard)
    }

    fn remove(&self, key: u64, guard: &Guard) -> bool {
        self.remove(key, guard)
    }
}

#[cfg(test)]
mod tests {
    use super::RavlTree;
    use crate::concurrent_set;
    use crate::llx_scx::Node;
    use crossbeam_epoch::{pin, Guard, Shared};
    use crossbeam_utils::thread;
    use rand::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn smoke_ravl_tree() {
        concurrent_set::tests::smoke::<RavlTree>();
    }

    #[test]
    fn sequential_membership() {
        let tree = RavlTree::new(0);
        let guard = &pin();
        assert!(!tree.get(5, guard));
        assert_eq!(tree.size(), 0);
        assert_eq!(tree.height(), 0);

        assert!(tree.insert(5, guard));
        assert_eq!(tree.height(), 1);
        assert!(tree.insert(3, guard));
        assert!(tree.insert(8, guard));
        assert!(tree.get(3, guard));
        assert!(tree.get(5, guard));
        assert!(tree.get(8, guard));
        assert!(!tree.get(99, guard));
        assert_eq!(tree.size(), 3);
    }

    #[test]
    fn duplicate_insert_and_missing_remove() {
        let tree = RavlTree::new(0);
        let guard = &pin();
        assert!(tree.insert(7, guard));
        assert!(!tree.insert(7, guard));
        assert!(!tree.remove(9, guard));
        assert!(tree.remove(7, guard));
        assert!(!tree.remove(7, guard));
        assert!(!tree.get(7, guard));
        assert_eq!(tree.size(), 0);
    }

    // Walks the user-data subtree checking the search order, that leaves
    // have rank 0 and that every edge has a rank difference of 1 or 2.
    // Returns the subtree root's rank.
    fn audit(node: Shared<'_, Node>, min_incl: u64, max_excl: u64, guard: &Guard) -> u64 {
        let node_ref = unsafe { node.deref() };
        assert!(min_incl <= node_ref.key && node_ref.key < max_excl);
        let left = node_ref.left.load(Ordering::Relaxed, guard);
        if left.is_null() {
            assert_eq!(node_ref.balance, 0, "leaf with non-zero rank");
            return 0;
        }
        let right = node_ref.right.load(Ordering::Relaxed, guard);
        let lr = audit(left, min_incl, node_ref.key, guard);
        let rr = audit(right, node_ref.key, max_excl, guard);
        let rank = node_ref.balance;
        assert!(rank > lr && rank - lr <= 2, "bad left rank difference");
        assert!(rank > rr && rank - rr <= 2, "bad right rank difference");
        assert!(lr.abs_diff(rr) <= 1, "sibling ranks too far apart");
        rank
    }

    fn audit_tree(tree: &RavlTree) {
        let guard = &pin();
        let root_ref = unsafe { tree.root.load(Ordering::Relaxed, guard).deref() };
        let top = root_ref.left.load(Ordering::Relaxed, guard);
        let data = unsafe { top.deref() }.left.load(Ordering::Relaxed, guard);
        if !data.is_null() {
            audit(data, 0, u64::MAX, guard);
        }
    }

    #[test]
    fn eager_rebalancing_keeps_avl_ranks_on_inserts() {
        let tree = RavlTree::new(0);
        let mut rng = rand::thread_rng();
        let mut keys: Vec<u64> = (1..=512).collect();
        keys.shuffle(&mut rng);
        for &k in &keys {
            assert!(tree.insert(k, &pin()));
        }
        assert_eq!(tree.size(), 512);
        audit_tree(&tree);
        assert!(tree.height() <= 15, "height {} too large", tree.height());
        for &k in &keys {
            assert!(tree.get(k, &pin()));
        }
    }

    #[test]
    fn removals_keep_membership_exact() {
        let tree = RavlTree::new(0);
        let mut rng = rand::thread_rng();
        let mut keys: Vec<u64> = (1..=400).collect();
        keys.shuffle(&mut rng);
        for &k in &keys {
            assert!(tree.insert(k, &pin()));
        }
        for &k in keys.iter().step_by(2) {
            assert!(tree.remove(k, &pin()));
        }
        for &k in &keys {
            let removed = keys.iter().step_by(2).any(|&r| r == k);
            assert_eq!(tree.get(k, &pin()), !removed);
        }
        assert_eq!(tree.size(), 200);
    }

    #[test]
    fn concurrent_inserts_preserve_every_key() {
        const THREADS: u64 = 8;
        let tree = &RavlTree::new(0);
        let successes = &AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<u64> = (1..=100).collect();
                    keys.shuffle(&mut rng);
                    for k in keys {
                        if tree.insert(k, &pin()) {
                            successes.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(successes.load(Ordering::Relaxed), 100);
        assert_eq!(tree.size(), 100);
        for k in 1..=100 {
            assert!(tree.get(k, &pin()));
        }
    }

    #[test]
    fn racing_insert_and_remove_agree() {
        for _ in 0..100 {
            let tree = &RavlTree::new(0);
            let removed = thread::scope(|s| {
                s.spawn(|_| assert!(tree.insert(42, &pin())));
                let remover = s.spawn(|_| tree.remove(42, &pin()));
                remover.join().unwrap()
            })
            .unwrap();
            assert_eq!(tree.get(42, &pin()), !removed);
            assert_eq!(tree.size(), usize::from(!removed));
        }
    }

    #[test]
    fn mixed_concurrent_workload_stays_consistent() {
        const THREADS: u64 = 8;
        const RANGE: u64 = 256;
        let tree = &RavlTree::new(0);
        thread::scope(|s| {
            for t in 0..THREADS {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    for _ in 0..2000 {
                        let k = rng.gen_range(1..=RANGE);
                        if t % 2 == 0 {
                            tree.insert(k, &pin());
                        } else {
                            tree.remove(k, &pin());
                        }
                        tree.get(k, &pin());
                    }
                });
            }
        })
        .unwrap();
        let present: usize = (1..=RANGE).filter(|&k| tree.get(k, &pin())).count();
        assert_eq!(tree.size(), present);
    }
}
