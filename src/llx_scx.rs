//! The LLX/SCX synchronization kernel shared by both tree variants.
//!
//! `weak_llx` is a linearizable read of a node together with the operation
//! currently guarding it, and `help_scx` drives a multi-node operation to a
//! terminal state on behalf of any thread. Every structural change to a tree
//! funnels through these two functions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_epoch::{unprotected, Atomic, Guard, Owned, Shared};

pub(crate) const IN_PROGRESS: usize = 0;
pub(crate) const ABORTED: usize = 1;
pub(crate) const COMMITTED: usize = 2;

/// An internal routing node or a leaf (leaves have null children).
///
/// `balance` is the weight in the chromatic tree and the rank in the
/// rank-balanced tree. Once a node is installed it is immutable except for
/// `op` (the guarding operation, a CAS target) and `marked` (monotonic
/// false to true once the node has been superseded).
pub(crate) struct Node {
    pub(crate) key: u64,
    pub(crate) balance: u64,
    pub(crate) left: Atomic<Node>,
    pub(crate) right: Atomic<Node>,
    pub(crate) marked: AtomicBool,
    pub(crate) op: Atomic<Operation>,
}

impl Node {
    pub(crate) fn new(
        key: u64,
        balance: u64,
        left: Shared<'_, Node>,
        right: Shared<'_, Node>,
        op: Shared<'_, Operation>,
    ) -> Self {
        Self {
            key,
            balance,
            left: Atomic::from(left),
            right: Atomic::from(right),
            marked: AtomicBool::new(false),
            op: Atomic::from(op),
        }
    }
}

/// A node together with the guard that `weak_llx` observed on it.
pub(crate) struct Linked {
    pub(crate) node: Atomic<Node>,
    pub(crate) before: Atomic<Operation>,
}

/// The `(node, observed guard)` pair produced by a successful `weak_llx`.
pub(crate) type Observed<'g> = (Shared<'g, Node>, Shared<'g, Operation>);

impl From<Observed<'_>> for Linked {
    fn from((node, before): Observed<'_>) -> Self {
        Self {
            node: Atomic::from(node),
            before: Atomic::from(before),
        }
    }
}

/// A proposed atomic replacement of one child pointer, contingent on every
/// linked node still carrying the guard observed at link time.
///
/// `linked[0]` is the parent whose child pointer will be swung and
/// `linked[1]` the child being replaced by `subtree`. `extra_unlink`
/// optionally names one more node the replacement unlinks without guarding
/// it; it is consumed only when retiring the replaced nodes.
pub(crate) struct Operation {
    pub(crate) linked: Vec<Linked>,
    pub(crate) subtree: Atomic<Node>,
    pub(crate) extra_unlink: Atomic<Node>,
    pub(crate) state: AtomicUsize,
    pub(crate) all_frozen: AtomicBool,
}

impl Operation {
    pub(crate) fn new(linked: Vec<Linked>, subtree: Shared<'_, Node>) -> Self {
        Self {
            linked,
            subtree: Atomic::from(subtree),
            extra_unlink: Atomic::null(),
            state: AtomicUsize::new(IN_PROGRESS),
            all_frozen: AtomicBool::new(false),
        }
    }

    /// The default guard for nodes not under any proposal: permanently
    /// aborted, so `weak_llx` always treats such nodes as stable.
    pub(crate) fn dummy() -> Self {
        Self {
            linked: Vec::new(),
            subtree: Atomic::null(),
            extra_unlink: Atomic::null(),
            state: AtomicUsize::new(ABORTED),
            all_frozen: AtomicBool::new(false),
        }
    }
}

pub(crate) fn make_op<'g>(
    linked: Vec<Linked>,
    subtree: Shared<'g, Node>,
    guard: &'g Guard,
) -> Shared<'g, Operation> {
    Owned::new(Operation::new(linked, subtree)).into_shared(guard)
}

/// Link a node: return its guarding operation if the node is stable (the
/// guard is aborted, or committed while the node is unmarked). Otherwise
/// help the in-progress guard along and report failure so the caller
/// restarts its whole construction.
pub(crate) fn weak_llx<'g>(node: &Node, guard: &'g Guard) -> Option<Shared<'g, Operation>> {
    let info = node.op.load(Ordering::Acquire, guard);
    let info_ref = unsafe { info.deref() };
    let state = info_ref.state.load(Ordering::SeqCst);
    if state == ABORTED || (state == COMMITTED && !node.marked.load(Ordering::SeqCst)) {
        return Some(info);
    }
    if info_ref.state.load(Ordering::SeqCst) == IN_PROGRESS {
        help_scx(info, 1, guard);
    } else {
        let cur = node.op.load(Ordering::Acquire, guard);
        if unsafe { cur.deref() }.state.load(Ordering::SeqCst) == IN_PROGRESS {
            help_scx(cur, 1, guard);
        }
    }
    None
}

/// Drive `op` to a terminal state, idempotently. The creating thread passes
/// `start_index == 0`; helpers that discovered `op` through a frozen node
/// start at 1, since index 0 is necessarily frozen before any later index
/// can carry `op`.
///
/// Freezing claims the linked nodes in order via CAS on their `op` fields.
/// Once every node is claimed, `all_frozen` latches and the operation will
/// commit no matter which helpers finish the remaining steps; the child
/// swing CAS may then fail harmlessly if a racing helper already performed
/// it.
pub(crate) fn help_scx(op: Shared<'_, Operation>, start_index: usize, guard: &Guard) -> bool {
    let op_ref = unsafe { op.deref() };
    if op_ref.state.load(Ordering::SeqCst) != IN_PROGRESS {
        return true;
    }

    // Freeze the linked nodes.
    for link in &op_ref.linked[start_index..] {
        let node_ref = unsafe { link.node.load(Ordering::Relaxed, guard).deref() };
        let before = link.before.load(Ordering::Relaxed, guard);
        match node_ref
            .op
            .compare_exchange(before, op, Ordering::SeqCst, Ordering::SeqCst, guard)
        {
            Ok(_) => {
                // A committed guard's last holder was this node, so it is
                // unreachable from here on; aborted guards may still be held
                // by other nodes and stay alive.
                if unsafe { before.deref() }.state.load(Ordering::SeqCst) == COMMITTED {
                    unsafe { guard.defer_destroy(before) };
                }
            }
            Err(e) if e.current == op => {} // another helper already froze this node
            Err(_) => {
                if op_ref.all_frozen.load(Ordering::SeqCst) {
                    return true;
                }
                op_ref.state.store(ABORTED, Ordering::SeqCst);
                return false;
            }
        }
    }

    // The commit point: from here the operation cannot abort.
    op_ref.all_frozen.store(true, Ordering::SeqCst);
    for link in &op_ref.linked[1..] {
        unsafe { link.node.load(Ordering::Relaxed, guard).deref() }
            .marked
            .store(true, Ordering::SeqCst);
    }

    // Swing the parent's child pointer to the replacement subtree.
    let parent_ref = unsafe { op_ref.linked[0].node.load(Ordering::Relaxed, guard).deref() };
    let old = op_ref.linked[1].node.load(Ordering::Relaxed, guard);
    let subtree = op_ref.subtree.load(Ordering::Relaxed, guard);
    let target = if parent_ref.left.load(Ordering::SeqCst, guard) == old {
        &parent_ref.left
    } else {
        &parent_ref.right
    };
    if target
        .compare_exchange(old, subtree, Ordering::SeqCst, Ordering::SeqCst, guard)
        .is_ok()
    {
        // Exactly one helper wins the swing; it retires the replaced nodes.
        for link in &op_ref.linked[1..] {
            unsafe { guard.defer_destroy(link.node.load(Ordering::Relaxed, guard)) };
        }
        let extra = op_ref.extra_unlink.load(Ordering::Relaxed, guard);
        if !extra.is_null() {
            unsafe { guard.defer_destroy(extra) };
        }
    }
    op_ref.state.store(COMMITTED, Ordering::SeqCst);
    true
}

pub(crate) fn has_child(parent: &Node, child: Shared<'_, Node>, guard: &Guard) -> bool {
    parent.left.load(Ordering::Acquire, guard) == child
        || parent.right.load(Ordering::Acquire, guard) == child
}

/// Leaf count excluding sentinels. Sequential only.
pub(crate) fn sequential_size(node: Shared<'_, Node>, guard: &Guard) -> usize {
    if node.is_null() {
        return 0;
    }
    let node_ref = unsafe { node.deref() };
    let left = node_ref.left.load(Ordering::Relaxed, guard);
    if left.is_null() {
        return usize::from(node_ref.key != u64::MAX);
    }
    sequential_size(left, guard) + sequential_size(node_ref.right.load(Ordering::Relaxed, guard), guard)
}

/// Height of a subtree, counting a leaf as 1. Sequential only.
pub(crate) fn subtree_height(node: Shared<'_, Node>, guard: &Guard) -> usize {
    if node.is_null() {
        return 0;
    }
    let node_ref = unsafe { node.deref() };
    let left = subtree_height(node_ref.left.load(Ordering::Relaxed, guard), guard);
    let right = subtree_height(node_ref.right.load(Ordering::Relaxed, guard), guard);
    1 + left.max(right)
}

/// Free a quiesced tree: every reachable node, the committed guards still
/// held by live nodes (each held by exactly one), and the dummy.
pub(crate) fn release(root: &Atomic<Node>, dummy: &Atomic<Operation>) {
    unsafe {
        let guard = unprotected();
        let mut stack = vec![root.load(Ordering::Relaxed, guard)];
        while let Some(node) = stack.pop() {
            if node.is_null() {
                continue;
            }
            let node_ref = node.deref();
            stack.push(node_ref.left.load(Ordering::Relaxed, guard));
            stack.push(node_ref.right.load(Ordering::Relaxed, guard));
            let op = node_ref.op.load(Ordering::Relaxed, guard);
            if op.deref().state.load(Ordering::Relaxed) == COMMITTED {
                drop(op.into_owned());
            }
            drop(node.into_owned());
        }
        drop(dummy.load(Ordering::Relaxed, guard).into_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch::pin;

    fn alloc_node<'g>(
        key: u64,
        left: Shared<'g, Node>,
        right: Shared<'g, Node>,
        op: Shared<'g, Operation>,
    ) -> Shared<'g, Node> {
        Owned::new(Node::new(key, 1, left, right, op)).into_shared(unsafe { unprotected() })
    }

    #[test]
    fn commit_swings_child_and_is_idempotent() {
        let guard = &pin();
        let dummy = Owned::new(Operation::dummy()).into_shared(unsafe { unprotected() });
        let old_leaf = alloc_node(10, Shared::null(), Shared::null(), dummy);
        let sibling = alloc_node(20, Shared::null(), Shared::null(), dummy);
        let parent = alloc_node(20, old_leaf, sibling, dummy);

        let replacement = alloc_node(10, Shared::null(), Shared::null(), dummy);
        let parent_ref = unsafe { parent.deref() };
        let op_parent = weak_llx(parent_ref, guard).unwrap();
        let op_leaf = weak_llx(unsafe { old_leaf.deref() }, guard).unwrap();
        let op = make_op(
            vec![(parent, op_parent).into(), (old_leaf, op_leaf).into()],
            replacement,
            guard,
        );

        assert!(help_scx(op, 0, guard));
        let op_ref = unsafe { op.deref() };
        assert_eq!(op_ref.state.load(Ordering::SeqCst), COMMITTED);
        assert!(op_ref.all_frozen.load(Ordering::SeqCst));
        assert!(unsafe { old_leaf.deref() }.marked.load(Ordering::SeqCst));
        assert!(!parent_ref.marked.load(Ordering::SeqCst));
        assert_eq!(parent_ref.left.load(Ordering::SeqCst, guard), replacement);

        // Re-helping a resolved operation is a no-op that reports success.
        assert!(help_scx(op, 0, guard));
        assert!(help_scx(op, 1, guard));
        assert_eq!(parent_ref.left.load(Ordering::SeqCst, guard), replacement);
    }

    #[test]
    fn lost_freeze_aborts_exactly_once() {
        let guard = &pin();
        let dummy = Owned::new(Operation::dummy()).into_shared(unsafe { unprotected() });
        let old_leaf = alloc_node(10, Shared::null(), Shared::null(), dummy);
        let sibling = alloc_node(20, Shared::null(), Shared::null(), dummy);
        let parent = alloc_node(20, old_leaf, sibling, dummy);
        let parent_ref = unsafe { parent.deref() };

        // Two proposals link the same nodes against the same observed guards.
        let first = make_op(
            vec![
                (parent, weak_llx(parent_ref, guard).unwrap()).into(),
                (old_leaf, weak_llx(unsafe { old_leaf.deref() }, guard).unwrap()).into(),
            ],
            alloc_node(11, Shared::null(), Shared::null(), dummy),
            guard,
        );
        let second = make_op(
            vec![
                (parent, weak_llx(parent_ref, guard).unwrap()).into(),
                (old_leaf, weak_llx(unsafe { old_leaf.deref() }, guard).unwrap()).into(),
            ],
            alloc_node(12, Shared::null(), Shared::null(), dummy),
            guard,
        );

        assert!(help_scx(first, 0, guard));
        // The loser's freeze CAS finds the winner's guard and aborts.
        assert!(!help_scx(second, 0, guard));
        let second_ref = unsafe { second.deref() };
        assert_eq!(second_ref.state.load(Ordering::SeqCst), ABORTED);
        assert!(!second_ref.all_frozen.load(Ordering::SeqCst));

        // Helping an aborted operation afterwards reports it as resolved.
        assert!(help_scx(second, 0, guard));
        assert_eq!(second_ref.state.load(Ordering::SeqCst), ABORTED);
    }

    #[test]
    fn llx_fails_on_marked_node() {
        let guard = &pin();
        let dummy = Owned::new(Operation::dummy()).into_shared(unsafe { unprotected() });
        let old_leaf = alloc_node(10, Shared::null(), Shared::null(), dummy);
        let sibling = alloc_node(20, Shared::null(), Shared::null(), dummy);
        let parent = alloc_node(20, old_leaf, sibling, dummy);
        let parent_ref = unsafe { parent.deref() };

        let op = make_op(
            vec![
                (parent, weak_llx(parent_ref, guard).unwrap()).into(),
                (old_leaf, weak_llx(unsafe { old_leaf.deref() }, guard).unwrap()).into(),
            ],
            alloc_node(11, Shared::null(), Shared::null(), dummy),
            guard,
        );
        assert!(help_scx(op, 0, guard));

        // The superseded leaf is committed-and-marked: not linkable.
        assert!(weak_llx(unsafe { old_leaf.deref() }, guard).is_none());
        // The parent stays linkable, now guarded by the committed operation.
        assert_eq!(weak_llx(parent_ref, guard), Some(op));
    }
}
