//! Persistent, immutable sorted map backed by a left-leaning red-black tree.
//!
//! Every mutating operation returns a new map. Untouched subtrees are shared
//! between the old and new versions through `Arc`, so capturing a snapshot of a
//! cache or a view is a pointer copy.

use std::cmp::Ordering;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use super::assert::fail;

/// Ordering function used by [`SortedMap`] and [`SortedSet`](super::SortedSet).
pub type Comparator<K> = Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

impl Color {
    fn flip(self) -> Self {
        match self {
            Color::Red => Color::Black,
            Color::Black => Color::Red,
        }
    }
}

type Link<K, V> = Option<Arc<Node<K, V>>>;

struct Node<K, V> {
    key: K,
    value: V,
    color: Color,
    left: Link<K, V>,
    right: Link<K, V>,
    size: usize,
}

fn size<K, V>(link: &Link<K, V>) -> usize {
    link.as_ref().map(|node| node.size).unwrap_or(0)
}

fn is_red<K, V>(link: &Link<K, V>) -> bool {
    matches!(link, Some(node) if node.color == Color::Red)
}

fn left_of<K, V>(link: &Link<K, V>) -> &Link<K, V> {
    match link {
        Some(node) => &node.left,
        None => &None,
    }
}

fn build<K, V>(key: K, value: V, color: Color, left: Link<K, V>, right: Link<K, V>) -> Arc<Node<K, V>> {
    let size = size(&left) + size(&right) + 1;
    Arc::new(Node {
        key,
        value,
        color,
        left,
        right,
        size,
    })
}

/// Copies `node` with a new color and children. Key and value are cloned; the
/// original node is left untouched.
fn copy_with<K: Clone, V: Clone>(
    node: &Node<K, V>,
    color: Color,
    left: Link<K, V>,
    right: Link<K, V>,
) -> Arc<Node<K, V>> {
    build(node.key.clone(), node.value.clone(), color, left, right)
}

fn rotate_left<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let right = node
        .right
        .as_ref()
        .unwrap_or_else(|| fail(0x5a01, "rotate_left requires a right child"));
    let new_left = copy_with(node, Color::Red, node.left.clone(), right.left.clone());
    copy_with(right, node.color, Some(new_left), right.right.clone())
}

fn rotate_right<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let left = node
        .left
        .as_ref()
        .unwrap_or_else(|| fail(0x5a02, "rotate_right requires a left child"));
    let new_right = copy_with(node, Color::Red, left.right.clone(), node.right.clone());
    copy_with(left, node.color, left.left.clone(), Some(new_right))
}

fn color_flip<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let left = node
        .left
        .as_ref()
        .map(|child| copy_with(child, child.color.flip(), child.left.clone(), child.right.clone()));
    let right = node
        .right
        .as_ref()
        .map(|child| copy_with(child, child.color.flip(), child.left.clone(), child.right.clone()));
    copy_with(node, node.color.flip(), left, right)
}

fn balance<K: Clone, V: Clone>(node: Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let mut node = node;
    if is_red(&node.right) && !is_red(&node.left) {
        node = rotate_left(&node);
    }
    if is_red(&node.left) && is_red(left_of(&node.left)) {
        node = rotate_right(&node);
    }
    if is_red(&node.left) && is_red(&node.right) {
        node = color_flip(&node);
    }
    node
}

fn move_red_left<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let mut node = color_flip(node);
    if is_red(left_of(&node.right)) {
        let right = node
            .right
            .as_ref()
            .map(rotate_right)
            .unwrap_or_else(|| fail(0x5a03, "move_red_left requires a right child"));
        node = copy_with(&node, node.color, node.left.clone(), Some(right));
        node = rotate_left(&node);
        node = color_flip(&node);
    }
    node
}

fn move_red_right<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let mut node = color_flip(node);
    if is_red(left_of(&node.left)) {
        node = rotate_right(&node);
        node = color_flip(&node);
    }
    node
}

fn insert_node<K: Clone, V: Clone>(
    link: &Link<K, V>,
    key: K,
    value: V,
    comparator: &(dyn Fn(&K, &K) -> Ordering + Send + Sync),
) -> Arc<Node<K, V>> {
    let node = match link {
        None => return build(key, value, Color::Red, None, None),
        Some(node) => node,
    };
    let updated = match comparator(&key, &node.key) {
        Ordering::Less => {
            let left = insert_node(&node.left, key, value, comparator);
            copy_with(node, node.color, Some(left), node.right.clone())
        }
        Ordering::Equal => build(
            node.key.clone(),
            value,
            node.color,
            node.left.clone(),
            node.right.clone(),
        ),
        Ordering::Greater => {
            let right = insert_node(&node.right, key, value, comparator);
            copy_with(node, node.color, node.left.clone(), Some(right))
        }
    };
    balance(updated)
}

fn min_node<K, V>(node: &Arc<Node<K, V>>) -> &Arc<Node<K, V>> {
    let mut current = node;
    while let Some(left) = &current.left {
        current = left;
    }
    current
}

fn max_node<K, V>(node: &Arc<Node<K, V>>) -> &Arc<Node<K, V>> {
    let mut current = node;
    while let Some(right) = &current.right {
        current = right;
    }
    current
}

fn remove_min<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Link<K, V> {
    if node.left.is_none() {
        return None;
    }
    let mut node = node.clone();
    if !is_red(&node.left) && !is_red(left_of(&node.left)) {
        node = move_red_left(&node);
    }
    let left = node.left.as_ref().and_then(remove_min);
    let node = copy_with(&node, node.color, left, node.right.clone());
    Some(balance(node))
}

/// Removes `key`, which must be present in the subtree rooted at `node`.
fn remove_node<K: Clone, V: Clone>(
    node: &Arc<Node<K, V>>,
    key: &K,
    comparator: &(dyn Fn(&K, &K) -> Ordering + Send + Sync),
) -> Link<K, V> {
    let mut node = node.clone();
    if comparator(key, &node.key) == Ordering::Less {
        if !is_red(&node.left) && !is_red(left_of(&node.left)) {
            node = move_red_left(&node);
        }
        let left = node
            .left
            .as_ref()
            .and_then(|left| remove_node(left, key, comparator));
        node = copy_with(&node, node.color, left, node.right.clone());
    } else {
        if is_red(&node.left) {
            node = rotate_right(&node);
        }
        if comparator(key, &node.key) == Ordering::Equal && node.right.is_none() {
            return None;
        }
        if !is_red(&node.right) && !is_red(left_of(&node.right)) {
            node = move_red_right(&node);
        }
        if comparator(key, &node.key) == Ordering::Equal {
            let right = node
                .right
                .as_ref()
                .unwrap_or_else(|| fail(0x5a04, "matched node without a right subtree"));
            let successor = min_node(right);
            node = build(
                successor.key.clone(),
                successor.value.clone(),
                node.color,
                node.left.clone(),
                remove_min(right),
            );
        } else {
            let right = node
                .right
                .as_ref()
                .and_then(|right| remove_node(right, key, comparator));
            node = copy_with(&node, node.color, node.left.clone(), right);
        }
    }
    Some(balance(node))
}

/// An immutable sorted map with structural sharing.
pub struct SortedMap<K, V> {
    comparator: Comparator<K>,
    root: Link<K, V>,
}

impl<K, V> Clone for SortedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            comparator: Arc::clone(&self.comparator),
            root: self.root.clone(),
        }
    }
}

impl<K: Ord + 'static, V> SortedMap<K, V> {
    /// Creates an empty map ordered by `K`'s `Ord` implementation.
    pub fn new() -> Self {
        Self::with_comparator(Arc::new(|left: &K, right: &K| left.cmp(right)))
    }
}

impl<K: Ord + 'static, V> Default for SortedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone + 'static, V: Clone> FromIterator<(K, V)> for SortedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(SortedMap::new(), |map, (key, value)| map.insert(key, value))
    }
}

impl<K, V> SortedMap<K, V> {
    /// Creates an empty map ordered by `comparator`.
    pub fn with_comparator(comparator: Comparator<K>) -> Self {
        Self {
            comparator,
            root: None,
        }
    }

    pub fn comparator(&self) -> &Comparator<K> {
        &self.comparator
    }

    pub fn len(&self) -> usize {
        size(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let mut current = &self.root;
        while let Some(node) = current {
            match (self.comparator)(key, &node.key) {
                Ordering::Equal => return Some(&node.value),
                Ordering::Less => current = &node.left,
                Ordering::Greater => current = &node.right,
            }
        }
        None
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Returns the in-order position of `key`, or `None` when absent.
    pub fn index_of(&self, key: &K) -> Option<usize> {
        let mut pruned = 0;
        let mut current = &self.root;
        while let Some(node) = current {
            match (self.comparator)(key, &node.key) {
                Ordering::Equal => return Some(pruned + size(&node.left)),
                Ordering::Less => current = &node.left,
                Ordering::Greater => {
                    pruned += size(&node.left) + 1;
                    current = &node.right;
                }
            }
        }
        None
    }

    /// Returns the largest key strictly smaller than `key`. `key` must be present.
    pub fn predecessor_key(&self, key: &K) -> Option<&K> {
        let mut current = &self.root;
        let mut right_parent: Option<&Arc<Node<K, V>>> = None;
        while let Some(node) = current {
            match (self.comparator)(key, &node.key) {
                Ordering::Equal => {
                    return match &node.left {
                        Some(left) => Some(&max_node(left).key),
                        None => right_parent.map(|parent| &parent.key),
                    };
                }
                Ordering::Less => current = &node.left,
                Ordering::Greater => {
                    right_parent = Some(node);
                    current = &node.right;
                }
            }
        }
        None
    }

    pub fn min_key(&self) -> Option<&K> {
        self.root.as_ref().map(|root| &min_node(root).key)
    }

    pub fn max_key(&self) -> Option<&K> {
        self.root.as_ref().map(|root| &max_node(root).key)
    }

    pub fn first(&self) -> Option<(&K, &V)> {
        self.root.as_ref().map(|root| {
            let node = min_node(root);
            (&node.key, &node.value)
        })
    }

    pub fn last(&self) -> Option<(&K, &V)> {
        self.root.as_ref().map(|root| {
            let node = max_node(root);
            (&node.key, &node.value)
        })
    }

    pub fn iter(&self) -> SortedMapIter<'_, K, V> {
        SortedMapIter::new(&self.root, None, &*self.comparator, false)
    }

    /// Iterates entries with keys greater than or equal to `start`.
    pub fn iter_from<'a>(&'a self, start: &K) -> SortedMapIter<'a, K, V> {
        SortedMapIter::new(&self.root, Some(start), &*self.comparator, false)
    }

    pub fn reverse_iter(&self) -> SortedMapIter<'_, K, V> {
        SortedMapIter::new(&self.root, None, &*self.comparator, true)
    }

    /// Iterates entries with keys less than or equal to `start`, largest first.
    pub fn reverse_iter_from<'a>(&'a self, start: &K) -> SortedMapIter<'a, K, V> {
        SortedMapIter::new(&self.root, Some(start), &*self.comparator, true)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }

    /// Validates the red-black invariants and returns the black height.
    ///
    /// Checks that no red node has a red child, that red links lean left and
    /// that every root-to-leaf path crosses the same number of black nodes.
    pub fn check_invariants(&self) -> Result<usize, String> {
        if is_red(&self.root) {
            return Err("root must be black".to_string());
        }
        check_node(&self.root, &*self.comparator)
    }
}

fn check_node<K, V>(
    link: &Link<K, V>,
    comparator: &(dyn Fn(&K, &K) -> Ordering + Send + Sync),
) -> Result<usize, String> {
    let node = match link {
        None => return Ok(1),
        Some(node) => node,
    };
    if node.color == Color::Red && (is_red(&node.left) || is_red(&node.right)) {
        return Err("red node has a red child".to_string());
    }
    if is_red(&node.right) {
        return Err("right-leaning red link".to_string());
    }
    if let Some(left) = &node.left {
        if comparator(&left.key, &node.key) != Ordering::Less {
            return Err("left child out of order".to_string());
        }
    }
    if let Some(right) = &node.right {
        if comparator(&right.key, &node.key) != Ordering::Greater {
            return Err("right child out of order".to_string());
        }
    }
    if node.size != size(&node.left) + size(&node.right) + 1 {
        return Err("subtree size is stale".to_string());
    }
    let left_height = check_node(&node.left, comparator)?;
    let right_height = check_node(&node.right, comparator)?;
    if left_height != right_height {
        return Err("black height mismatch".to_string());
    }
    Ok(left_height + usize::from(node.color == Color::Black))
}

impl<K: Clone, V: Clone> SortedMap<K, V> {
    /// Returns a copy of this map with `key` mapped to `value`.
    pub fn insert(&self, key: K, value: V) -> Self {
        let root = insert_node(&self.root, key, value, &*self.comparator);
        Self {
            comparator: Arc::clone(&self.comparator),
            root: Some(copy_with(&root, Color::Black, root.left.clone(), root.right.clone())),
        }
    }

    /// Returns a copy of this map without `key`.
    pub fn remove(&self, key: &K) -> Self {
        if !self.contains_key(key) {
            return self.clone();
        }
        let root = self.root.as_ref().unwrap_or_else(|| fail(0x5a05, "non-empty map has no root"));
        let root = if !is_red(&root.left) && !is_red(&root.right) {
            copy_with(root, Color::Red, root.left.clone(), root.right.clone())
        } else {
            root.clone()
        };
        let root = remove_node(&root, key, &*self.comparator)
            .map(|root| copy_with(&root, Color::Black, root.left.clone(), root.right.clone()));
        Self {
            comparator: Arc::clone(&self.comparator),
            root,
        }
    }
}

impl<K: Debug, V: Debug> Debug for SortedMap<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<'a, K, V> IntoIterator for &'a SortedMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = SortedMapIter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// In-order (or reverse-order) iterator over a [`SortedMap`].
pub struct SortedMapIter<'a, K, V> {
    stack: Vec<&'a Arc<Node<K, V>>>,
    reverse: bool,
}

impl<'a, K, V> SortedMapIter<'a, K, V> {
    fn new(
        root: &'a Link<K, V>,
        start: Option<&K>,
        comparator: &(dyn Fn(&K, &K) -> Ordering + Send + Sync),
        reverse: bool,
    ) -> Self {
        let mut stack = Vec::new();
        let mut current = root;
        while let Some(node) = current {
            // Without a start key every node on the spine is pushed.
            let ordering = match start {
                Some(start) if reverse => comparator(&node.key, start).reverse(),
                Some(start) => comparator(&node.key, start),
                None => Ordering::Greater,
            };
            match ordering {
                Ordering::Less => {
                    current = if reverse { &node.left } else { &node.right };
                }
                Ordering::Equal => {
                    stack.push(node);
                    break;
                }
                Ordering::Greater => {
                    stack.push(node);
                    current = if reverse { &node.right } else { &node.left };
                }
            }
        }
        Self { stack, reverse }
    }
}

impl<'a, K, V> Iterator for SortedMapIter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        let mut current = if self.reverse { &node.left } else { &node.right };
        while let Some(child) = current {
            self.stack.push(child);
            current = if self.reverse { &child.right } else { &child.left };
        }
        Some((&node.key, &node.value))
    }
}
