//! Id-keyed resource state and its reducer
//!
//! Items form a set keyed by id. Applying the same upsert twice leaves the
//! state unchanged, and deleting an unknown id is a no-op, so increments can
//! arrive duplicated or out of order relative to a snapshot.

use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// A row that can live in a [`ResourceState`].
pub trait Record: Clone + PartialEq + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Display ordering key (usually a timestamp); ties fall back to the id.
    fn sort_key(&self) -> &str;
}

/// Reducer actions.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceAction<T> {
    /// Replace everything with an authoritative snapshot
    Set(Vec<T>),
    Upsert(T),
    Delete(String),
    Clear,
}

/// Local copy of one resource for one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState<T> {
    items: HashMap<String, T>,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl<T> Default for ResourceState<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            is_loading: false,
            error: None,
        }
    }
}

impl<T: Record> ResourceState<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one action. Returns whether the items changed.
    pub fn apply(&mut self, action: ResourceAction<T>) -> bool {
        match action {
            ResourceAction::Set(items) => self.set(items),
            ResourceAction::Upsert(item) => self.upsert(item),
            ResourceAction::Delete(id) => self.remove(&id),
            ResourceAction::Clear => self.clear(),
        }
    }

    pub fn upsert(&mut self, item: T) -> bool {
        match self.items.get(item.id()) {
            Some(existing) if *existing == item => false,
            _ => {
                self.items.insert(item.id().to_string(), item);
                true
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.items.remove(id).is_some()
    }

    pub fn set(&mut self, items: Vec<T>) -> bool {
        let next: HashMap<String, T> = items
            .into_iter()
            .map(|item| (item.id().to_string(), item))
            .collect();
        if next == self.items {
            return false;
        }
        self.items = next;
        true
    }

    pub fn clear(&mut self) -> bool {
        let changed = !self.items.is_empty();
        self.items.clear();
        changed
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.get(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in display order.
    pub fn data(&self) -> Vec<T> {
        let mut data: Vec<T> = self.items.values().cloned().collect();
        data.sort_by(|a, b| {
            a.sort_key()
                .cmp(b.sort_key())
                .then_with(|| a.id().cmp(b.id()))
        });
        data
    }
}
