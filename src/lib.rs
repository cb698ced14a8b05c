//! Non-blocking balanced binary search trees built from single-word CAS.
//!
//! The crate provides two linearizable ordered sets over `u64` keys that
//! share one synchronization core: a multi-node load-linked/store-conditional
//! emulation in which every structural change is proposed as an immutable
//! replacement subtree and committed with cooperative helping. The
//! [`ChromaticTree`] repairs weight violations in the style of a relaxed
//! red-black tree; the [`RavlTree`] repairs rank violations in the style of
//! a relaxed weak-AVL tree.

pub mod chromatic_tree;
pub mod concurrent_set;
mod llx_scx;
pub mod ravl_tree;

pub use self::chromatic_tree::ChromaticTree;
pub use self::concurrent_set::ConcurrentSet;
pub use self::ravl_tree::RavlTree;
