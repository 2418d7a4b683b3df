//! # Ordered Index Chunk
//!
//! A red-black tree over 64-bit keys, stored as a flat arena of fixed-size node
//! records addressed by index. Two variants share the implementation: a pure
//! key set (`LongTree`) and a key→value map (`LongLongTree`). The store uses
//! them to map times to versions and universes to parents, where the hot query
//! is "greatest key ≤ t".
//!
//! ## Arena Layout
//!
//! ```text
//! header: root │ size │ capacity │ threshold
//!
//! nodes:  [0]                [1]                [2]
//!         ┌────────────────┐ ┌────────────────┐ ┌────────────────┐
//!         │ key            │ │ key            │ │ key            │
//!         │ left   (index) │ │ left   (index) │ │ left   (index) │
//!         │ right  (index) │ │ right  (index) │ │ right  (index) │
//!         │ parent (index) │ │ parent (index) │ │ parent (index) │
//!         │ color          │ │ color          │ │ color          │
//!         │ value          │ │ value          │ │ value          │
//!         └────────────────┘ └────────────────┘ └────────────────┘
//! ```
//!
//! Links hold arena indices; `UNDEFINED` (-1) means "no node". Nodes are
//! appended in insertion order and never move, so rotations only rewrite link
//! fields and the header root. There is no per-node allocation.
//!
//! ## Growth
//!
//! When `size + 1 > threshold` the arena capacity doubles and
//! `threshold = capacity × CACHE_LOAD_FACTOR`. Indices are stable across
//! growth.
//!
//! ## Insertion
//!
//! Textbook red-black insertion: the key is placed as a red leaf at its BST
//! position, then fix-up cases 1-5 restore the invariants by recoloring and
//! rotating. Inserting a key that is already present leaves the tree
//! untouched, including its value.
//!
//! ## Range Walks
//!
//! `range(start, end)` locates the greatest key ≤ `end`, then steps to in-order
//! predecessors until the key falls below `start`. Keys are reported in
//! strictly descending order.
//!
//! ## Serialization
//!
//! ```text
//! empty tree:  0
//! otherwise:   <size>,<root>( <marker><key>,<parent>[,<value>] )*
//! ```
//!
//! Nodes are written in arena order. The parent is omitted for the root. The
//! marker packs color and branch side:
//!
//! | Marker | Color | Side  |
//! |--------|-------|-------|
//! | `{`    | red   | left  |
//! | `}`    | red   | right |
//! | `[`    | black | left  |
//! | `]`    | black | right |
//!
//! Decoding restores each node at its original index and rebuilds child links
//! from parent plus side, so a round trip yields the same arena.
//!
//! ## Thread Safety
//!
//! The arena sits behind a `parking_lot::Mutex`: lookups, walks and inserts
//! each hold it for their whole duration, so one participant at a time is
//! inside the tree. `range` collects keys under the lock and invokes the
//! visitor after releasing it, so a visitor may query the same tree.
//!
//! ## Deletion
//!
//! Removing a key is not supported; [`OrderedIndex::delete`] fails with
//! `StoreError::Unsupported`.

use eyre::{bail, ensure, Result};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::config::{CACHE_LOAD_FACTOR, UNDEFINED};
use crate::encoding::{encode_int, encode_long, Cursor};
use crate::error::StoreError;

const RED_LEFT: u8 = b'{';
const RED_RIGHT: u8 = b'}';
const BLACK_LEFT: u8 = b'[';
const BLACK_RIGHT: u8 = b']';

const EMPTY_PAYLOAD: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Color {
    Red = 0,
    Black = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Node {
    key: i64,
    left: i32,
    right: i32,
    parent: i32,
    color: Color,
    value: i64,
}

impl Node {
    fn leaf(key: i64, value: i64, parent: i32) -> Self {
        Self {
            key,
            left: UNDEFINED,
            right: UNDEFINED,
            parent,
            color: Color::Red,
            value,
        }
    }
}

#[derive(Debug, Clone)]
struct Arena {
    nodes: Vec<Node>,
    root: i32,
    capacity: usize,
    threshold: usize,
}

fn threshold_for(capacity: usize) -> usize {
    (capacity as f64 * CACHE_LOAD_FACTOR) as usize
}

impl Arena {
    fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            root: UNDEFINED,
            capacity: 0,
            threshold: 0,
        }
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            root: UNDEFINED,
            capacity,
            threshold: threshold_for(capacity),
        }
    }

    #[inline]
    fn size(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    fn node(&self, index: i32) -> &Node {
        &self.nodes[index as usize]
    }

    #[inline]
    fn node_mut(&mut self, index: i32) -> &mut Node {
        &mut self.nodes[index as usize]
    }

    #[inline]
    fn left(&self, index: i32) -> i32 {
        self.node(index).left
    }

    #[inline]
    fn right(&self, index: i32) -> i32 {
        self.node(index).right
    }

    #[inline]
    fn parent(&self, index: i32) -> i32 {
        self.node(index).parent
    }

    #[inline]
    fn color(&self, index: i32) -> Color {
        if index == UNDEFINED {
            Color::Black
        } else {
            self.node(index).color
        }
    }

    fn set_color(&mut self, index: i32, color: Color) {
        self.node_mut(index).color = color;
    }

    fn find(&self, key: i64) -> i32 {
        let mut n = self.root;
        while n != UNDEFINED {
            let node = self.node(n);
            if key == node.key {
                return n;
            }
            n = if key < node.key { node.left } else { node.right };
        }
        UNDEFINED
    }

    fn grow(&mut self) {
        let capacity = (self.capacity * 2).max(1);
        self.nodes.reserve_exact(capacity - self.nodes.len());
        self.capacity = capacity;
        self.threshold = threshold_for(capacity);
    }

    fn insert(&mut self, key: i64, value: i64) -> bool {
        if self.find(key) != UNDEFINED {
            return false;
        }
        if self.size() + 1 > self.threshold {
            self.grow();
        }

        let index = self.nodes.len() as i32;
        if self.root == UNDEFINED {
            self.nodes.push(Node::leaf(key, value, UNDEFINED));
            self.root = index;
        } else {
            let mut n = self.root;
            loop {
                if key < self.node(n).key {
                    if self.left(n) == UNDEFINED {
                        self.node_mut(n).left = index;
                        break;
                    }
                    n = self.left(n);
                } else {
                    if self.right(n) == UNDEFINED {
                        self.node_mut(n).right = index;
                        break;
                    }
                    n = self.right(n);
                }
            }
            self.nodes.push(Node::leaf(key, value, n));
        }

        self.rebalance_after_insert(index);
        true
    }

    fn rebalance_after_insert(&mut self, mut n: i32) {
        loop {
            let parent = self.parent(n);
            // case 1: n is the root
            if parent == UNDEFINED {
                self.set_color(n, Color::Black);
                return;
            }
            // case 2: black parent, nothing to fix
            if self.color(parent) == Color::Black {
                return;
            }
            let grandparent = self.parent(parent);
            let uncle = if parent == self.left(grandparent) {
                self.right(grandparent)
            } else {
                self.left(grandparent)
            };
            // case 3: red uncle, push the violation up
            if self.color(uncle) == Color::Red {
                self.set_color(parent, Color::Black);
                self.set_color(uncle, Color::Black);
                self.set_color(grandparent, Color::Red);
                n = grandparent;
                continue;
            }
            break;
        }

        // case 4: rotate the inner grandchild to the outside
        let mut parent = self.parent(n);
        let mut grandparent = self.parent(parent);
        if n == self.right(parent) && parent == self.left(grandparent) {
            self.rotate_left(parent);
            n = self.left(n);
        } else if n == self.left(parent) && parent == self.right(grandparent) {
            self.rotate_right(parent);
            n = self.right(n);
        }

        // case 5
        parent = self.parent(n);
        grandparent = self.parent(parent);
        self.set_color(parent, Color::Black);
        self.set_color(grandparent, Color::Red);
        if n == self.left(parent) && parent == self.left(grandparent) {
            self.rotate_right(grandparent);
        } else {
            self.rotate_left(grandparent);
        }
    }

    fn replace_node(&mut self, old: i32, new: i32) {
        let parent = self.parent(old);
        if parent == UNDEFINED {
            self.root = new;
        } else if old == self.left(parent) {
            self.node_mut(parent).left = new;
        } else {
            self.node_mut(parent).right = new;
        }
        if new != UNDEFINED {
            self.node_mut(new).parent = parent;
        }
    }

    fn rotate_left(&mut self, n: i32) {
        let r = self.right(n);
        self.replace_node(n, r);
        let inner = self.left(r);
        self.node_mut(n).right = inner;
        if inner != UNDEFINED {
            self.node_mut(inner).parent = n;
        }
        self.node_mut(r).left = n;
        self.node_mut(n).parent = r;
    }

    fn rotate_right(&mut self, n: i32) {
        let l = self.left(n);
        self.replace_node(n, l);
        let inner = self.right(l);
        self.node_mut(n).left = inner;
        if inner != UNDEFINED {
            self.node_mut(inner).parent = n;
        }
        self.node_mut(l).right = n;
        self.node_mut(n).parent = l;
    }

    fn previous(&self, n: i32) -> i32 {
        let mut p = self.left(n);
        if p != UNDEFINED {
            while self.right(p) != UNDEFINED {
                p = self.right(p);
            }
            return p;
        }
        let mut child = n;
        let mut parent = self.parent(n);
        while parent != UNDEFINED && child == self.left(parent) {
            child = parent;
            parent = self.parent(parent);
        }
        parent
    }

    fn next(&self, n: i32) -> i32 {
        let mut p = self.right(n);
        if p != UNDEFINED {
            while self.left(p) != UNDEFINED {
                p = self.left(p);
            }
            return p;
        }
        let mut child = n;
        let mut parent = self.parent(n);
        while parent != UNDEFINED && child == self.right(parent) {
            child = parent;
            parent = self.parent(parent);
        }
        parent
    }

    fn first(&self) -> i32 {
        let mut n = self.root;
        if n == UNDEFINED {
            return UNDEFINED;
        }
        while self.left(n) != UNDEFINED {
            n = self.left(n);
        }
        n
    }

    fn previous_or_equal(&self, key: i64) -> i32 {
        let mut p = self.root;
        if p == UNDEFINED {
            return UNDEFINED;
        }
        loop {
            let node = self.node(p);
            if key == node.key {
                return p;
            }
            if key > node.key {
                if node.right == UNDEFINED {
                    return p;
                }
                p = node.right;
            } else {
                if node.left == UNDEFINED {
                    let mut child = p;
                    let mut parent = node.parent;
                    while parent != UNDEFINED && child == self.left(parent) {
                        child = parent;
                        parent = self.parent(parent);
                    }
                    return parent;
                }
                p = node.left;
            }
        }
    }

    fn serialize(&self, with_values: bool) -> String {
        if self.nodes.is_empty() {
            return EMPTY_PAYLOAD.to_string();
        }
        let mut out = String::with_capacity(4 + self.nodes.len() * 8);
        encode_int(self.size() as i32, &mut out);
        out.push(',');
        encode_int(self.root, &mut out);
        for (i, node) in self.nodes.iter().enumerate() {
            let on_left = node.parent != UNDEFINED && self.left(node.parent) == i as i32;
            let marker = match (node.color, on_left) {
                (Color::Red, true) => RED_LEFT,
                (Color::Red, false) => RED_RIGHT,
                (Color::Black, true) => BLACK_LEFT,
                (Color::Black, false) => BLACK_RIGHT,
            };
            out.push(marker as char);
            encode_long(node.key, &mut out);
            out.push(',');
            if node.parent != UNDEFINED {
                encode_int(node.parent, &mut out);
            }
            if with_values {
                out.push(',');
                encode_long(node.value, &mut out);
            }
        }
        out
    }

    fn decode(payload: &str, with_values: bool) -> Result<Self> {
        if payload.is_empty() || payload == EMPTY_PAYLOAD {
            return Ok(Arena::empty());
        }

        let mut cursor = Cursor::new(payload);
        let size = cursor.read_int()?;
        ensure!(size >= 0, "negative tree size {}", size);
        // A node takes at least a marker, a key digit, a comma and a parent digit.
        ensure!(
            size as usize <= payload.len() / 3,
            "tree size {} exceeds payload of {} bytes",
            size,
            payload.len()
        );
        if size == 0 {
            ensure!(cursor.is_at_end(), "trailing data after empty tree");
            return Ok(Arena::empty());
        }
        cursor.expect(b',')?;
        let root = cursor.read_int()?;
        ensure!(
            root >= 0 && root < size,
            "root index {} outside tree of size {}",
            root,
            size
        );

        let mut arena = Arena::with_capacity(size as usize);
        arena.root = root;
        let mut on_left = Vec::with_capacity(size as usize);

        for i in 0..size {
            let (color, left_side) = match cursor.advance() {
                Some(RED_LEFT) => (Color::Red, true),
                Some(RED_RIGHT) => (Color::Red, false),
                Some(BLACK_LEFT) => (Color::Black, true),
                Some(BLACK_RIGHT) => (Color::Black, false),
                Some(other) => bail!("invalid node marker '{}' for node {}", other as char, i),
                None => bail!("tree payload ends after {} of {} nodes", i, size),
            };
            let key = cursor.read_long()?;
            cursor.expect(b',')?;
            let parent = if cursor.peek().is_some_and(crate::encoding::base64::is_digit) {
                cursor.read_int()?
            } else {
                UNDEFINED
            };
            let value = if with_values {
                cursor.expect(b',')?;
                cursor.read_long()?
            } else {
                UNDEFINED as i64
            };

            let mut node = Node::leaf(key, value, parent);
            node.color = color;
            arena.nodes.push(node);
            on_left.push(left_side);
        }
        ensure!(
            cursor.is_at_end(),
            "trailing data at offset {} after {} nodes",
            cursor.position(),
            size
        );

        for i in 0..size {
            let parent = arena.parent(i);
            if parent == UNDEFINED {
                ensure!(i == root, "node {} has no parent but root is {}", i, root);
                continue;
            }
            ensure!(
                parent >= 0 && parent < size && parent != i,
                "node {} has invalid parent {}",
                i,
                parent
            );
            let slot = if on_left[i as usize] {
                &mut arena.node_mut(parent).left
            } else {
                &mut arena.node_mut(parent).right
            };
            ensure!(
                *slot == UNDEFINED,
                "node {} claims an occupied child slot of {}",
                i,
                parent
            );
            *slot = i;
        }
        ensure!(
            arena.parent(root) == UNDEFINED,
            "root {} has a parent",
            root
        );
        ensure!(
            arena.reachable_count() == size as usize,
            "tree links do not reach every node"
        );

        Ok(arena)
    }

    fn reachable_count(&self) -> usize {
        if self.root == UNDEFINED {
            return 0;
        }
        let mut count = 0;
        let mut stack: SmallVec<[i32; 32]> = SmallVec::new();
        stack.push(self.root);
        while let Some(n) = stack.pop() {
            count += 1;
            if count > self.size() {
                break;
            }
            for child in [self.left(n), self.right(n)] {
                if child != UNDEFINED {
                    stack.push(child);
                }
            }
        }
        count
    }

    /// Returns the black height, or a description of the first violation.
    fn check(&self) -> Result<usize> {
        if self.root == UNDEFINED {
            ensure!(self.nodes.is_empty(), "tree without root has nodes");
            return Ok(1);
        }
        ensure!(
            self.color(self.root) == Color::Black,
            "root {} is red",
            self.root
        );
        ensure!(self.parent(self.root) == UNDEFINED, "root has a parent");
        ensure!(
            self.reachable_count() == self.size(),
            "unreachable nodes in arena"
        );
        self.check_subtree(self.root, None, None)
    }

    fn check_subtree(&self, n: i32, low: Option<i64>, high: Option<i64>) -> Result<usize> {
        if n == UNDEFINED {
            return Ok(1);
        }
        let node = self.node(n);
        if let Some(low) = low {
            ensure!(node.key > low, "key {} out of order", node.key);
        }
        if let Some(high) = high {
            ensure!(node.key < high, "key {} out of order", node.key);
        }
        for child in [node.left, node.right] {
            if child != UNDEFINED {
                ensure!(self.parent(child) == n, "broken parent link at {}", child);
                if node.color == Color::Red {
                    ensure!(
                        self.color(child) == Color::Black,
                        "red node {} has red child {}",
                        n,
                        child
                    );
                }
            }
        }
        let left = self.check_subtree(node.left, low, Some(node.key))?;
        let right = self.check_subtree(node.right, Some(node.key), high)?;
        ensure!(left == right, "unequal black height under {}", n);
        Ok(left + usize::from(node.color == Color::Black))
    }
}

/// Red-black tree chunk payload.
#[derive(Debug)]
pub struct OrderedIndex {
    arena: Mutex<Arena>,
    with_values: bool,
}

impl OrderedIndex {
    /// Pure key set.
    pub fn key_set() -> Self {
        Self {
            arena: Mutex::new(Arena::empty()),
            with_values: false,
        }
    }

    /// Key→value map.
    pub fn key_value() -> Self {
        Self {
            arena: Mutex::new(Arena::empty()),
            with_values: true,
        }
    }

    pub fn has_values(&self) -> bool {
        self.with_values
    }

    pub fn size(&self) -> usize {
        self.arena.lock().size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.arena.lock().capacity
    }

    pub fn lookup(&self, key: i64) -> Option<i64> {
        let arena = self.arena.lock();
        let n = arena.find(key);
        (n != UNDEFINED).then(|| arena.node(n).key)
    }

    pub fn lookup_value(&self, key: i64) -> Option<i64> {
        let arena = self.arena.lock();
        let n = arena.find(key);
        (n != UNDEFINED).then(|| arena.node(n).value)
    }

    /// Greatest key that is less than or equal to `key`.
    pub fn previous_or_equal(&self, key: i64) -> Option<i64> {
        let arena = self.arena.lock();
        let n = arena.previous_or_equal(key);
        (n != UNDEFINED).then(|| arena.node(n).key)
    }

    /// Value stored under the greatest key ≤ `key`.
    pub fn previous_or_equal_value(&self, key: i64) -> Option<i64> {
        let arena = self.arena.lock();
        let n = arena.previous_or_equal(key);
        (n != UNDEFINED).then(|| arena.node(n).value)
    }

    /// Returns `true` when a node was added. `value` is ignored by key sets.
    pub fn insert(&self, key: i64, value: i64) -> bool {
        let value = if self.with_values {
            value
        } else {
            UNDEFINED as i64
        };
        self.arena.lock().insert(key, value)
    }

    /// Visits every key in `[start, end]` from largest to smallest.
    pub fn range<F>(&self, start: i64, end: i64, mut visitor: F)
    where
        F: FnMut(i64),
    {
        let keys: SmallVec<[i64; 16]> = {
            let arena = self.arena.lock();
            let mut keys = SmallVec::new();
            let mut n = arena.previous_or_equal(end);
            while n != UNDEFINED {
                let key = arena.node(n).key;
                if key < start {
                    break;
                }
                keys.push(key);
                n = arena.previous(n);
            }
            keys
        };
        for key in keys {
            visitor(key);
        }
    }

    /// Ascending snapshot of all keys.
    pub fn keys(&self) -> Vec<i64> {
        self.entries().into_iter().map(|(k, _)| k).collect()
    }

    /// Ascending snapshot of all `(key, value)` pairs.
    pub fn entries(&self) -> Vec<(i64, i64)> {
        let arena = self.arena.lock();
        let mut out = Vec::with_capacity(arena.size());
        let mut n = arena.first();
        while n != UNDEFINED {
            let node = arena.node(n);
            out.push((node.key, node.value));
            n = arena.next(n);
        }
        out
    }

    pub fn delete(&self, _key: i64) -> Result<()> {
        bail!(StoreError::Unsupported {
            operation: "ordered index delete"
        })
    }

    pub fn serialize(&self) -> String {
        self.arena.lock().serialize(self.with_values)
    }

    /// Replaces the whole tree with the decoded `payload`. On error the
    /// current content is left untouched.
    pub fn init(&self, payload: &str) -> Result<()> {
        let decoded = Arena::decode(payload, self.with_values)?;
        *self.arena.lock() = decoded;
        Ok(())
    }

    /// Releases the arena.
    pub fn clear(&self) {
        *self.arena.lock() = Arena::empty();
    }

    pub fn duplicate(&self) -> Self {
        Self {
            arena: Mutex::new(self.arena.lock().clone()),
            with_values: self.with_values,
        }
    }

    /// Verifies ordering, parent links and the red-black properties.
    /// Returns the black height of the tree.
    pub fn check_invariants(&self) -> Result<usize> {
        self.arena.lock().check()
    }
}
