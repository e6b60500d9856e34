/// Union-Find (Disjoint Sets) over interned tokens for connected components
///
/// Tokens of any hashable type are interned to dense ids starting at 1. Id 0
/// is reserved and stands for a token that was never interned, so lookups
/// of unknown tokens return 0 instead of failing.
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

/// Id (and component id) reported for tokens that were never interned
pub const UNKNOWN: usize = 0;

/// One forest slot per interned token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Root of a tree holding `size` tokens
    Root { size: usize },
    /// Non-root slot pointing at the 1-based id of its parent
    Child { parent: usize },
}

/// Connected components over tokens of type `T`
///
/// Tokens are stored as owned copies, so callers may hand in borrowed
/// buffers (`&str`, `&[u8]`) they reuse afterwards.
#[derive(Debug, Clone)]
pub struct Components<T> {
    /// Slot of id `i` lives at `slots[i - 1]`
    slots: Vec<Slot>,
    token_to_id: HashMap<T, usize>,
    id_to_token: Vec<T>,
}

pub type IntComponents = Components<i64>;
pub type StringComponents = Components<String>;
pub type ByteComponents = Components<Vec<u8>>;

impl<T> Default for Components<T> {
    fn default() -> Self {
        Components {
            slots: Vec::new(),
            token_to_id: HashMap::new(),
            id_to_token: Vec::new(),
        }
    }
}

impl<T: Hash + Eq + Clone> Components<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or assign the id of a token
    pub fn intern<Q>(&mut self, token: &Q) -> usize
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = T> + ?Sized,
    {
        if let Some(&id) = self.token_to_id.get(token) {
            return id;
        }

        let owned = token.to_owned();
        self.id_to_token.push(owned.clone());
        let id = self.id_to_token.len();
        self.token_to_id.insert(owned, id);
        self.slots.push(Slot::Root { size: 1 });
        id
    }

    /// Join the components of `a` and `b`, interning both first
    ///
    /// Returns true if the tokens were in different components before.
    pub fn union<Q>(&mut self, a: &Q, b: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = T> + ?Sized,
    {
        let mut first = self.intern(a);
        let mut second = self.intern(b);
        if first > second {
            std::mem::swap(&mut first, &mut second);
        }
        if first == second {
            return false;
        }

        let i = self.root_of(first);
        let j = self.root_of(second);
        if i == j {
            return false;
        }

        let size_i = self.size_of_root(i);
        let size_j = self.size_of_root(j);

        // Union by size; on ties the root reached from the older token wins
        if size_j > size_i {
            self.slots[i - 1] = Slot::Child { parent: j };
            self.slots[j - 1] = Slot::Root { size: size_i + size_j };
        } else {
            self.slots[j - 1] = Slot::Child { parent: i };
            self.slots[i - 1] = Slot::Root { size: size_i + size_j };
        }
        true
    }

    /// Id of a token, or [`UNKNOWN`] if it was never interned
    pub fn index_of<Q>(&self, token: &Q) -> usize
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.token_to_id.get(token).copied().unwrap_or(UNKNOWN)
    }

    /// Component id of a token, or [`UNKNOWN`] if it was never interned
    pub fn find<Q>(&mut self, token: &Q) -> usize
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let id = self.index_of(token);
        self.component(id)
    }

    /// Component id of an id returned by [`Components::intern`]
    ///
    /// # Panics
    /// Panics if `id` was never handed out by this registry.
    pub fn component(&mut self, id: usize) -> usize {
        assert!(id <= self.len(), "id {id} out of range (size {})", self.len());
        if id == UNKNOWN {
            return UNKNOWN;
        }
        self.root_of(id)
    }

    /// Check if two tokens are known and in the same component
    pub fn connected<Q>(&mut self, a: &Q, b: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let ca = self.find(a);
        ca != UNKNOWN && ca == self.find(b)
    }

    /// Token for an id
    ///
    /// # Panics
    /// Panics if `id` is 0 or was never handed out by this registry.
    pub fn token(&self, id: usize) -> &T {
        assert!(
            id > UNKNOWN && id <= self.len(),
            "id {id} out of range (size {})",
            self.len()
        );
        &self.id_to_token[id - 1]
    }

    /// Number of interned tokens
    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    /// Drop all tokens and components, including the owned token copies
    pub fn reset(&mut self) {
        self.slots = Vec::new();
        self.token_to_id = HashMap::new();
        self.id_to_token = Vec::new();
    }

    /// Ids grouped by component, each group ascending, groups ordered by
    /// their smallest id
    pub fn components(&mut self) -> Vec<Vec<usize>> {
        let mut root_to_group: HashMap<usize, Vec<usize>> = HashMap::new();
        for id in 1..=self.len() {
            let root = self.root_of(id);
            root_to_group.entry(root).or_default().push(id);
        }

        let mut groups: Vec<Vec<usize>> = root_to_group.into_values().collect();
        groups.sort_unstable_by_key(|group| group[0]);
        groups
    }

    /// Find the root of `id` and point every slot on the way directly at it
    fn root_of(&mut self, id: usize) -> usize {
        let mut root = id;
        while let Slot::Child { parent } = self.slots[root - 1] {
            root = parent;
        }

        let mut current = id;
        while let Slot::Child { parent } = self.slots[current - 1] {
            if parent != root {
                self.slots[current - 1] = Slot::Child { parent: root };
            }
            current = parent;
        }
        root
    }

    fn size_of_root(&self, root: usize) -> usize {
        match self.slots[root - 1] {
            Slot::Root { size } => size,
            Slot::Child { .. } => unreachable!("slot {root} is not a root"),
        }
    }
}
