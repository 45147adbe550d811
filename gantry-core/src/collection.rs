//! Ordered, id-indexed entity collections
//!
//! The coordinator keeps missions and slaves in small ordered collections
//! looked up by string id. [`Collection`] replaces ad-hoc maps with one
//! container that preserves insertion order, rejects duplicate ids, and
//! allocates the lowest-numbered free `prefix<N>` id.

use thiserror::Error;

/// Capability interface for entities that live in a [`Collection`].
pub trait Identifiable {
    fn id(&self) -> &str;
}

/// Raised when inserting an entity whose id is already present.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("duplicate id: {0}")]
pub struct DuplicateId(pub String);

/// An ordered collection of entities indexed by their string id.
#[derive(Debug, Clone)]
pub struct Collection<T> {
    items: Vec<T>,
}

impl<T: Identifiable> Collection<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|item| item.id() == id)
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.iter().find(|item| item.id() == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.items.iter_mut().find(|item| item.id() == id)
    }

    /// Append an entity, rejecting ids that are already present.
    pub fn insert(&mut self, item: T) -> Result<(), DuplicateId> {
        if self.contains(item.id()) {
            return Err(DuplicateId(item.id().to_string()));
        }
        self.items.push(item);
        Ok(())
    }

    /// Remove and return the entity with the given id.
    pub fn remove(&mut self, id: &str) -> Option<T> {
        let index = self.items.iter().position(|item| item.id() == id)?;
        Some(self.items.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }

    /// Allocate the lowest-numbered `prefix<N>` id not currently in use.
    pub fn next_id(&self, prefix: &str) -> String {
        next_numbered_id(prefix, self.items.iter().map(|item| item.id()))
    }
}

impl<T: Identifiable> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Identifiable> FromIterator<T> for Collection<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut collection = Collection::new();
        for item in iter {
            // Later duplicates lose; load paths warn about them separately.
            let _ = collection.insert(item);
        }
        collection
    }
}

/// Lowest-numbered `prefix<N>` id not present in `existing`.
///
/// Ids that do not parse as `prefix<N>` are ignored, so foreign ids never
/// block allocation. Numbering starts at 0.
pub fn next_numbered_id<'a>(prefix: &str, existing: impl Iterator<Item = &'a str>) -> String {
    let used: std::collections::HashSet<u64> = existing
        .filter_map(|id| id.strip_prefix(prefix))
        .filter_map(|n| n.parse().ok())
        .collect();

    let mut candidate = 0;
    while used.contains(&candidate) {
        candidate += 1;
    }
    format!("{prefix}{candidate}")
}
