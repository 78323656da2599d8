//! Augmented AVL tree ordered by virtual eligible time
//!
//! Nodes live in an arena and refer to each other by index. Every node
//! carries the minimum virtual deadline of its subtree, which lets the
//! fair queue find the eligible node with the smallest deadline in
//! O(log n):
//!
//! ```text
//!                 (ve=4, vd=9, min_vd=3)
//!                /                      \
//!   (ve=2, vd=3, min_vd=3)      (ve=7, vd=8, min_vd=8)
//! ```
//!
//! `min_vd` and the AVL height are recomputed bottom-up on every insert and
//! remove, including the nodes moved by rotations.

use std::cmp::Ordering;

type Link = Option<usize>;

#[derive(Debug, Clone)]
struct Node<K> {
    key: K,
    ve: u64,
    seq: u64,
    vd: u64,
    min_vd: u64,
    height: u32,
    left: Link,
    right: Link,
}

impl<K> Node<K> {
    /// Tree order: virtual eligible time, then insertion sequence
    fn order(&self) -> (u64, u64) {
        (self.ve, self.seq)
    }
}

/// Arena-backed augmented AVL tree
#[derive(Debug)]
pub struct AugmentedFairTree<K> {
    slots: Vec<Option<Node<K>>>,
    free: Vec<usize>,
    root: Link,
    len: usize,
}

impl<K> Default for AugmentedFairTree<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> AugmentedFairTree<K> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: None,
            len: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Key stored at `idx`
    ///
    /// # Panics
    ///
    /// Panics if `idx` is not a live node handle.
    #[must_use]
    pub fn key(&self, idx: usize) -> &K {
        &self.node(idx).key
    }

    /// Virtual eligible time and deadline stored at `idx`
    #[must_use]
    pub fn times(&self, idx: usize) -> (u64, u64) {
        let node = self.node(idx);
        (node.ve, node.vd)
    }

    /// Link a new node and return its handle
    pub fn insert(&mut self, key: K, ve: u64, vd: u64, seq: u64) -> usize {
        let node = Node {
            key,
            ve,
            seq,
            vd,
            min_vd: vd,
            height: 1,
            left: None,
            right: None,
        };
        let idx = if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(node);
            idx
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        };

        let root = self.insert_at(self.root, idx);
        self.root = Some(root);
        self.len += 1;
        idx
    }

    /// Unlink the node at `idx` and return its key
    pub fn remove(&mut self, idx: usize) -> K {
        self.root = self.remove_at(self.root, idx);
        self.len -= 1;
        self.free.push(idx);
        match self.slots[idx].take() {
            Some(node) => node.key,
            None => unreachable!("removed node {idx} twice"),
        }
    }

    /// Node with the smallest virtual eligible time
    #[must_use]
    pub fn leftmost(&self) -> Option<usize> {
        let mut cur = self.root?;
        while let Some(left) = self.node(cur).left {
            cur = left;
        }
        Some(cur)
    }

    /// Find the eligible node (`ve <= vt`) with the smallest virtual deadline
    ///
    /// The walk keeps the best eligible node seen on the search path and the
    /// left subtree of an eligible path node with the smallest `min_vd`.
    /// Only left subtrees can hold further eligible nodes: everything left
    /// of an eligible node has a smaller `ve`, everything right of an
    /// ineligible node a larger one.
    #[must_use]
    pub fn eligible_min_vd(&self, vt: u64) -> Option<usize> {
        let mut path_best: Option<usize> = None;
        let mut subtree: Option<usize> = None;
        let mut cur = self.root;

        while let Some(idx) = cur {
            let node = self.node(idx);
            if node.ve <= vt {
                if path_best.is_none_or(|best| node.vd < self.node(best).vd) {
                    path_best = Some(idx);
                }
                if let Some(left) = node.left
                    && subtree.is_none_or(|s| self.node(left).min_vd < self.node(s).min_vd)
                {
                    subtree = Some(left);
                }
                cur = node.right;
            } else {
                cur = node.left;
            }
        }

        let best = path_best?;
        match subtree {
            Some(s) if self.node(s).min_vd < self.node(best).vd => Some(self.descend_min_vd(s)),
            _ => Some(best),
        }
    }

    /// Follow `min_vd` down to the node that owns it
    fn descend_min_vd(&self, from: usize) -> usize {
        let target = self.node(from).min_vd;
        let mut cur = from;
        loop {
            let node = self.node(cur);
            if node.vd == target {
                return cur;
            }
            cur = match (node.left, node.right) {
                (Some(left), _) if self.node(left).min_vd == target => left,
                (_, Some(right)) => right,
                _ => unreachable!("min_vd {target} not found below node {from}"),
            };
        }
    }

    fn node(&self, idx: usize) -> &Node<K> {
        match &self.slots[idx] {
            Some(node) => node,
            None => panic!("stale tree handle {idx}"),
        }
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<K> {
        match &mut self.slots[idx] {
            Some(node) => node,
            None => panic!("stale tree handle {idx}"),
        }
    }

    fn height(&self, link: Link) -> u32 {
        link.map_or(0, |idx| self.node(idx).height)
    }

    fn min_vd(&self, link: Link) -> u64 {
        link.map_or(u64::MAX, |idx| self.node(idx).min_vd)
    }

    fn compare(&self, a: usize, b: usize) -> Ordering {
        self.node(a).order().cmp(&self.node(b).order())
    }

    /// Recompute height and `min_vd` from the children
    fn update(&mut self, idx: usize) {
        let (left, right, vd) = {
            let node = self.node(idx);
            (node.left, node.right, node.vd)
        };
        let height = 1 + self.height(left).max(self.height(right));
        let min_vd = vd.min(self.min_vd(left)).min(self.min_vd(right));
        let node = self.node_mut(idx);
        node.height = height;
        node.min_vd = min_vd;
    }

    fn rotate_left(&mut self, idx: usize) -> usize {
        let Some(pivot) = self.node(idx).right else {
            return idx;
        };
        self.node_mut(idx).right = self.node(pivot).left;
        self.node_mut(pivot).left = Some(idx);
        self.update(idx);
        self.update(pivot);
        pivot
    }

    fn rotate_right(&mut self, idx: usize) -> usize {
        let Some(pivot) = self.node(idx).left else {
            return idx;
        };
        self.node_mut(idx).left = self.node(pivot).right;
        self.node_mut(pivot).right = Some(idx);
        self.update(idx);
        self.update(pivot);
        pivot
    }

    /// Restore the AVL balance at `idx` and return the new subtree root
    fn rebalance(&mut self, idx: usize) -> usize {
        self.update(idx);
        let (left, right) = {
            let node = self.node(idx);
            (node.left, node.right)
        };
        let (hl, hr) = (self.height(left), self.height(right));

        if hl > hr + 1 {
            if let Some(l) = left
                && self.height(self.node(l).left) < self.height(self.node(l).right)
            {
                let new_left = self.rotate_left(l);
                self.node_mut(idx).left = Some(new_left);
            }
            return self.rotate_right(idx);
        }
        if hr > hl + 1 {
            if let Some(r) = right
                && self.height(self.node(r).right) < self.height(self.node(r).left)
            {
                let new_right = self.rotate_right(r);
                self.node_mut(idx).right = Some(new_right);
            }
            return self.rotate_left(idx);
        }
        idx
    }

    fn insert_at(&mut self, link: Link, idx: usize) -> usize {
        let Some(cur) = link else {
            return idx;
        };
        if self.compare(idx, cur) == Ordering::Less {
            let left = self.insert_at(self.node(cur).left, idx);
            self.node_mut(cur).left = Some(left);
        } else {
            let right = self.insert_at(self.node(cur).right, idx);
            self.node_mut(cur).right = Some(right);
        }
        self.rebalance(cur)
    }

    fn remove_at(&mut self, link: Link, target: usize) -> Link {
        let cur = link?;
        match self.compare(target, cur) {
            Ordering::Less => {
                let left = self.remove_at(self.node(cur).left, target);
                self.node_mut(cur).left = left;
                Some(self.rebalance(cur))
            }
            Ordering::Greater => {
                let right = self.remove_at(self.node(cur).right, target);
                self.node_mut(cur).right = right;
                Some(self.rebalance(cur))
            }
            Ordering::Equal => {
                let (left, right) = {
                    let node = self.node(cur);
                    (node.left, node.right)
                };
                match (left, right) {
                    (None, child) | (child, None) => child,
                    (Some(left), Some(right)) => {
                        let (rest, successor) = self.remove_min(right);
                        let node = self.node_mut(successor);
                        node.left = Some(left);
                        node.right = rest;
                        Some(self.rebalance(successor))
                    }
                }
            }
        }
    }

    /// Detach the minimum of the subtree at `idx`; returns (new subtree, min)
    fn remove_min(&mut self, idx: usize) -> (Link, usize) {
        match self.node(idx).left {
            None => (self.node(idx).right, idx),
            Some(left) => {
                let (rest, min) = self.remove_min(left);
                self.node_mut(idx).left = rest;
                (Some(self.rebalance(idx)), min)
            }
        }
    }
}

#[cfg(test)]
impl<K> AugmentedFairTree<K> {
    /// Walk the whole tree checking order, balance and augmentation
    pub(crate) fn validate(&self) {
        fn walk<K>(tree: &AugmentedFairTree<K>, link: Link, count: &mut usize) -> (u32, u64) {
            let Some(idx) = link else {
                return (0, u64::MAX);
            };
            *count += 1;
            let node = tree.node(idx);
            if let Some(left) = node.left {
                assert!(tree.node(left).order() < node.order(), "left child out of order");
            }
            if let Some(right) = node.right {
                assert!(tree.node(right).order() > node.order(), "right child out of order");
            }
            let (hl, ml) = walk(tree, node.left, count);
            let (hr, mr) = walk(tree, node.right, count);
            assert!(hl.abs_diff(hr) <= 1, "unbalanced at {idx}");
            assert_eq!(node.height, 1 + hl.max(hr), "stale height at {idx}");
            assert_eq!(node.min_vd, node.vd.min(ml).min(mr), "stale min_vd at {idx}");
            (node.height, node.min_vd)
        }

        let mut count = 0;
        walk(self, self.root, &mut count);
        assert_eq!(count, self.len, "len does not match linked nodes");
    }
}
