// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Arena red-black tree used for both the per-object child index (keyed by
//! oid) and namespaces (keyed by name value). Links are slot indices, not
//! pointers, so whole trees can move between owners cheaply. Duplicate keys
//! are allowed; an equal key routes right on insert, which makes in-order
//! traversal yield ties in insertion order.

use std::cmp::Ordering;

/// Key contract. Not `Ord` because `Var` compares through its own coercion
/// rules rather than a total order derive.
pub trait RbKey {
    fn cmp_key(&self, other: &Self) -> Ordering;
}

impl RbKey for i32 {
    fn cmp_key(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

impl RbKey for arbor_var::Var {
    fn cmp_key(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

const NIL: usize = usize::MAX;

struct RbNode<K, V> {
    key: K,
    value: V,
    left: usize,
    right: usize,
    up: usize,
    red: bool,
    in_use: bool,
}

pub struct RbTree<K, V> {
    slots: Vec<RbNode<K, V>>,
    free: Vec<usize>,
    root: usize,
    len: usize,
}

impl<K: RbKey, V: Copy + PartialEq> RbTree<K, V> {
    pub fn new() -> Self {
        RbTree {
            slots: Vec::new(),
            free: Vec::new(),
            root: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn key(&self, slot: usize) -> &K {
        debug_assert!(self.slots[slot].in_use);
        &self.slots[slot].key
    }

    pub fn value(&self, slot: usize) -> V {
        debug_assert!(self.slots[slot].in_use);
        self.slots[slot].value
    }

    fn is_red(&self, n: usize) -> bool {
        n != NIL && self.slots[n].red
    }

    fn left(&self, n: usize) -> usize {
        self.slots[n].left
    }

    fn right(&self, n: usize) -> usize {
        self.slots[n].right
    }

    fn up(&self, n: usize) -> usize {
        self.slots[n].up
    }

    fn sibling(&self, n: usize) -> usize {
        let u = self.up(n);
        if n == self.left(u) {
            self.right(u)
        } else {
            self.left(u)
        }
    }

    fn alloc(&mut self, key: K, value: V) -> usize {
        if let Some(slot) = self.free.pop() {
            self.slots[slot] = RbNode {
                key,
                value,
                left: NIL,
                right: NIL,
                up: NIL,
                red: true,
                in_use: true,
            };
            slot
        } else {
            self.slots.push(RbNode {
                key,
                value,
                left: NIL,
                right: NIL,
                up: NIL,
                red: true,
                in_use: true,
            });
            self.slots.len() - 1
        }
    }

    /// Insert a key/value pair. Returns the slot index, which stays stable
    /// until the entry is removed.
    pub fn insert(&mut self, key: K, value: V) -> usize {
        let slot = self.alloc(key, value);
        if self.root == NIL {
            self.root = slot;
        } else {
            let mut n = self.root;
            loop {
                // Equal keys route right: ties keep insertion order.
                if self.slots[slot].key.cmp_key(&self.slots[n].key) == Ordering::Less {
                    if self.left(n) == NIL {
                        self.slots[n].left = slot;
                        break;
                    }
                    n = self.left(n);
                } else {
                    if self.right(n) == NIL {
                        self.slots[n].right = slot;
                        break;
                    }
                    n = self.right(n);
                }
            }
            self.slots[slot].up = n;
        }
        self.insert_fixup(slot);
        self.len += 1;
        slot
    }

    fn rotate_left(&mut self, n: usize) {
        let r = self.right(n);
        self.replace_in_parent(n, r);
        self.slots[n].right = self.left(r);
        if self.left(r) != NIL {
            let rl = self.left(r);
            self.slots[rl].up = n;
        }
        self.slots[r].left = n;
        self.slots[n].up = r;
    }

    fn rotate_right(&mut self, n: usize) {
        let l = self.left(n);
        self.replace_in_parent(n, l);
        self.slots[n].left = self.right(l);
        if self.right(l) != NIL {
            let lr = self.right(l);
            self.slots[lr].up = n;
        }
        self.slots[l].right = n;
        self.slots[n].up = l;
    }

    fn replace_in_parent(&mut self, oldn: usize, newn: usize) {
        let up = self.up(oldn);
        if up == NIL {
            self.root = newn;
        } else if oldn == self.left(up) {
            self.slots[up].left = newn;
        } else {
            self.slots[up].right = newn;
        }
        if newn != NIL {
            self.slots[newn].up = up;
        }
    }

    fn insert_fixup(&mut self, mut n: usize) {
        loop {
            let up = self.up(n);
            if up == NIL {
                self.slots[n].red = false;
                return;
            }
            if !self.is_red(up) {
                return;
            }
            let grand = self.up(up);
            let uncle = self.sibling(up);
            if self.is_red(uncle) {
                self.slots[up].red = false;
                self.slots[uncle].red = false;
                self.slots[grand].red = true;
                n = grand;
                continue;
            }
            // Uncle black: rotate into shape, then recolor.
            let mut n2 = n;
            let mut up2 = up;
            if n2 == self.right(up2) && up2 == self.left(grand) {
                self.rotate_left(up2);
                n2 = self.left(n2);
                up2 = self.up(n2);
            } else if n2 == self.left(up2) && up2 == self.right(grand) {
                self.rotate_right(up2);
                n2 = self.right(n2);
                up2 = self.up(n2);
            }
            let grand2 = self.up(up2);
            self.slots[up2].red = false;
            self.slots[grand2].red = true;
            if n2 == self.left(up2) {
                self.rotate_right(grand2);
            } else {
                self.rotate_left(grand2);
            }
            return;
        }
    }

    /// Leftmost entry, or None when empty.
    pub fn first(&self) -> Option<usize> {
        if self.root == NIL {
            return None;
        }
        let mut n = self.root;
        while self.left(n) != NIL {
            n = self.left(n);
        }
        Some(n)
    }

    pub fn last(&self) -> Option<usize> {
        if self.root == NIL {
            return None;
        }
        let mut n = self.root;
        while self.right(n) != NIL {
            n = self.right(n);
        }
        Some(n)
    }

    /// In-order successor.
    pub fn next(&self, slot: usize) -> Option<usize> {
        let mut n = slot;
        if self.right(n) != NIL {
            n = self.right(n);
            while self.left(n) != NIL {
                n = self.left(n);
            }
            return Some(n);
        }
        loop {
            let up = self.up(n);
            if up == NIL {
                return None;
            }
            if n == self.left(up) {
                return Some(up);
            }
            n = up;
        }
    }

    /// In-order predecessor.
    pub fn prev(&self, slot: usize) -> Option<usize> {
        let mut n = slot;
        if self.left(n) != NIL {
            n = self.left(n);
            while self.right(n) != NIL {
                n = self.right(n);
            }
            return Some(n);
        }
        loop {
            let up = self.up(n);
            if up == NIL {
                return None;
            }
            if n == self.right(up) {
                return Some(up);
            }
            n = up;
        }
    }

    /// Earliest-inserted entry with this key.
    pub fn find_first(&self, key: &K) -> Option<usize> {
        let mut n = self.root;
        let mut found = None;
        while n != NIL {
            match key.cmp_key(&self.slots[n].key) {
                Ordering::Less => n = self.left(n),
                Ordering::Greater => n = self.right(n),
                Ordering::Equal => {
                    found = Some(n);
                    n = self.left(n);
                }
            }
        }
        found
    }

    /// Remove the entry in `slot`. Other slots keep their indices; only the
    /// removed slot is recycled.
    pub fn remove_at(&mut self, slot: usize) {
        debug_assert!(self.slots[slot].in_use);
        let n = slot;
        if self.left(n) != NIL && self.right(n) != NIL {
            // Two children: trade tree positions with the in-order
            // predecessor so the node to unlink has at most one child.
            let pred = {
                let mut p = self.left(n);
                while self.right(p) != NIL {
                    p = self.right(p);
                }
                p
            };
            self.swap_with_pred(n, pred);
        }

        debug_assert!(self.left(n) == NIL || self.right(n) == NIL);
        let child = if self.right(n) == NIL {
            self.left(n)
        } else {
            self.right(n)
        };
        if self.is_red(n) {
            // Red nodes splice straight out.
            self.replace_in_parent(n, child);
        } else if self.is_red(child) {
            self.replace_in_parent(n, child);
            self.slots[child].red = false;
        } else {
            // Black node with black (nil) child: fix the deficit with the
            // node still in place as the double-black marker, then splice.
            self.delete_fixup(n);
            self.replace_in_parent(n, child);
        }

        self.slots[n].in_use = false;
        self.free.push(n);
        self.len -= 1;
        if self.len == 0 {
            self.root = NIL;
        }
    }

    /// Exchange the tree positions (links and colors) of `n` and its in-order
    /// predecessor `p`. `p` is the rightmost node of `n`'s left subtree and
    /// has no right child. Keys and values stay in their slots.
    fn swap_with_pred(&mut self, n: usize, p: usize) {
        let n_up = self.up(n);
        let n_left = self.left(n);
        let n_right = self.right(n);
        let p_up = self.up(p);
        let p_left = self.left(p);
        let n_red = self.slots[n].red;
        let p_red = self.slots[p].red;

        self.slots[n].red = p_red;
        self.slots[p].red = n_red;

        // p takes n's place under n's parent.
        if n_up == NIL {
            self.root = p;
        } else if self.left(n_up) == n {
            self.slots[n_up].left = p;
        } else {
            self.slots[n_up].right = p;
        }
        self.slots[p].up = n_up;

        // p inherits n's right subtree.
        self.slots[p].right = n_right;
        if n_right != NIL {
            self.slots[n_right].up = p;
        }

        if p == n_left {
            // Adjacent: n becomes p's left child.
            self.slots[p].left = n;
            self.slots[n].up = p;
        } else {
            self.slots[p].left = n_left;
            if n_left != NIL {
                self.slots[n_left].up = p;
            }
            // n drops into p's old position.
            if self.left(p_up) == p {
                self.slots[p_up].left = n;
            } else {
                self.slots[p_up].right = n;
            }
            self.slots[n].up = p_up;
        }

        // n inherits p's old left subtree; p had no right child.
        self.slots[n].left = p_left;
        if p_left != NIL {
            self.slots[p_left].up = n;
        }
        self.slots[n].right = NIL;
    }

    fn delete_fixup(&mut self, mut n: usize) {
        loop {
            let up = self.up(n);
            if up == NIL {
                return;
            }
            let mut s = self.sibling(n);
            if self.is_red(s) {
                self.slots[up].red = true;
                self.slots[s].red = false;
                if n == self.left(up) {
                    self.rotate_left(up);
                } else {
                    self.rotate_right(up);
                }
                s = self.sibling(n);
            }
            let up = self.up(n);
            if !self.is_red(up)
                && !self.is_red(s)
                && !self.is_red(self.left(s))
                && !self.is_red(self.right(s))
            {
                self.slots[s].red = true;
                n = up;
                continue;
            }
            if self.is_red(up)
                && !self.is_red(s)
                && !self.is_red(self.left(s))
                && !self.is_red(self.right(s))
            {
                self.slots[s].red = true;
                self.slots[up].red = false;
                return;
            }
            if n == self.left(up)
                && !self.is_red(s)
                && self.is_red(self.left(s))
                && !self.is_red(self.right(s))
            {
                self.slots[s].red = true;
                let sl = self.left(s);
                self.slots[sl].red = false;
                self.rotate_right(s);
                s = self.sibling(n);
            } else if n == self.right(up)
                && !self.is_red(s)
                && self.is_red(self.right(s))
                && !self.is_red(self.left(s))
            {
                self.slots[s].red = true;
                let sr = self.right(s);
                self.slots[sr].red = false;
                self.rotate_left(s);
                s = self.sibling(n);
            }
            let up = self.up(n);
            self.slots[s].red = self.is_red(up);
            self.slots[up].red = false;
            if n == self.left(up) {
                let sr = self.right(s);
                if sr != NIL {
                    self.slots[sr].red = false;
                }
                self.rotate_left(up);
            } else {
                let sl = self.left(s);
                if sl != NIL {
                    self.slots[sl].red = false;
                }
                self.rotate_right(up);
            }
            return;
        }
    }

    /// Remove the earliest entry matching key and value. Returns whether one
    /// was found.
    pub fn remove_by(&mut self, key: &K, value: V) -> bool {
        let mut n = self.find_first(key);
        while let Some(slot) = n {
            if self.slots[slot].key.cmp_key(key) != Ordering::Equal {
                break;
            }
            if self.slots[slot].value == value {
                self.remove_at(slot);
                return true;
            }
            n = self.next(slot);
        }
        false
    }

    /// Drop everything. No rebalancing, the whole arena goes at once.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.root = NIL;
        self.len = 0;
    }

    pub fn iter(&self) -> RbIter<'_, K, V> {
        RbIter {
            tree: self,
            next: self.first(),
        }
    }

    /// Red-black structural invariants, for tests: root black, no red node
    /// with a red child, equal black height on every path.
    #[cfg(any(test, feature = "check-invariants"))]
    pub fn check_invariants(&self) {
        if self.root == NIL {
            return;
        }
        assert!(!self.is_red(self.root), "root must be black");
        self.check_black_height(self.root);
    }

    #[cfg(any(test, feature = "check-invariants"))]
    fn check_black_height(&self, n: usize) -> usize {
        if n == NIL {
            return 1;
        }
        if self.is_red(n) {
            assert!(!self.is_red(self.left(n)), "red node with red left child");
            assert!(!self.is_red(self.right(n)), "red node with red right child");
        }
        for child in [self.left(n), self.right(n)] {
            if child != NIL {
                assert_eq!(self.up(child), n, "broken parent link");
            }
        }
        let lh = self.check_black_height(self.left(n));
        let rh = self.check_black_height(self.right(n));
        assert_eq!(lh, rh, "unequal black height");
        lh + if self.is_red(n) { 0 } else { 1 }
    }
}

impl<K: RbKey, V: Copy + PartialEq> Default for RbTree<K, V> {
    fn default() -> Self {
        RbTree::new()
    }
}

pub struct RbIter<'a, K, V> {
    tree: &'a RbTree<K, V>,
    next: Option<usize>,
}

impl<'a, K: RbKey, V: Copy + PartialEq> Iterator for RbIter<'a, K, V> {
    type Item = (usize, &'a K, V);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.next?;
        self.next = self.tree.next(slot);
        Some((slot, self.tree.key(slot), self.tree.value(slot)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_iteration() {
        let mut t: RbTree<i32, u32> = RbTree::new();
        for (i, k) in [5, 1, 9, 3, 7, 2, 8, 4, 6, 0].iter().enumerate() {
            t.insert(*k, i as u32);
            t.check_invariants();
        }
        let keys: Vec<i32> = t.iter().map(|(_, k, _)| *k).collect();
        assert_eq!(keys, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut t: RbTree<i32, u32> = RbTree::new();
        for v in 0..20u32 {
            t.insert(7, v);
            t.insert(3, 100 + v);
            t.check_invariants();
        }
        let values: Vec<u32> = t
            .iter()
            .filter(|(_, k, _)| **k == 7)
            .map(|(_, _, v)| v)
            .collect();
        assert_eq!(values, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn removal_keeps_invariants() {
        let mut t: RbTree<i32, u32> = RbTree::new();
        let mut slots = Vec::new();
        for k in 0..100 {
            slots.push(t.insert(k % 10, k as u32));
        }
        // Remove a third in a scrambled order, then drain the rest.
        for (i, slot) in slots.iter().enumerate() {
            if i % 3 == 0 {
                t.remove_at(*slot);
                t.check_invariants();
            }
        }
        while let Some(slot) = t.first() {
            t.remove_at(slot);
            t.check_invariants();
        }
        assert!(t.is_empty());
    }

    #[test]
    fn remove_by_picks_exact_value_among_ties() {
        let mut t: RbTree<i32, u32> = RbTree::new();
        t.insert(1, 10);
        t.insert(1, 11);
        t.insert(1, 12);
        assert!(t.remove_by(&1, 11));
        let values: Vec<u32> = t.iter().map(|(_, _, v)| v).collect();
        assert_eq!(values, vec![10, 12]);
        assert!(!t.remove_by(&1, 11));
    }

    #[test]
    fn find_first_returns_earliest_tie() {
        let mut t: RbTree<i32, u32> = RbTree::new();
        t.insert(5, 0);
        t.insert(5, 1);
        t.insert(4, 2);
        t.insert(6, 3);
        let slot = t.find_first(&5).unwrap();
        assert_eq!(t.value(slot), 0);
    }

    #[test]
    fn next_prev_walk() {
        let mut t: RbTree<i32, u32> = RbTree::new();
        for k in [4, 2, 6, 1, 3, 5, 7] {
            t.insert(k, k as u32);
        }
        let mut forward = Vec::new();
        let mut cur = t.first();
        while let Some(s) = cur {
            forward.push(*t.key(s));
            cur = t.next(s);
        }
        assert_eq!(forward, vec![1, 2, 3, 4, 5, 6, 7]);

        let mut backward = Vec::new();
        let mut cur = t.last();
        while let Some(s) = cur {
            backward.push(*t.key(s));
            cur = t.prev(s);
        }
        assert_eq!(backward, vec![7, 6, 5, 4, 3, 2, 1]);
    }
}
