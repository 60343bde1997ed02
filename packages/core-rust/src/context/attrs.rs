use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;

/// Typed key for a context attribute.
///
/// Two keys are equal when both their name and value type match.
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AttributeKey").field(&self.name).finish()
    }
}

type Slot = (&'static str, TypeId);
type Value = Arc<dyn Any + Send + Sync>;

/// Key-typed attribute map owned by one context.
#[derive(Default)]
pub struct Attributes {
    map: DashMap<Slot, Value>,
}

impl Attributes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot<T: 'static>(key: &AttributeKey<T>) -> Slot {
        (key.name, TypeId::of::<T>())
    }

    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self, key: &AttributeKey<T>) -> Option<Arc<T>> {
        let value = Arc::clone(self.map.get(&Self::slot(key))?.value());
        value.downcast::<T>().ok()
    }

    /// Sets `value`, returning the previous one.
    pub fn set<T: Send + Sync + 'static>(&self, key: &AttributeKey<T>, value: T) -> Option<Arc<T>> {
        self.map
            .insert(Self::slot(key), Arc::new(value))
            .and_then(|old| old.downcast::<T>().ok())
    }

    /// Sets `value` unless the key is already present. Returns the value in effect.
    pub fn set_if_absent<T: Send + Sync + 'static>(&self, key: &AttributeKey<T>, value: T) -> Arc<T> {
        let fresh = Arc::new(value);
        let current = {
            let entry = self
                .map
                .entry(Self::slot(key))
                .or_insert_with(|| Arc::clone(&fresh) as Value);
            Arc::clone(entry.value())
        };
        // The slot's TypeId guarantees the stored value has type T.
        current.downcast::<T>().unwrap_or(fresh)
    }

    pub fn remove<T: Send + Sync + 'static>(&self, key: &AttributeKey<T>) -> Option<Arc<T>> {
        self.map
            .remove(&Self::slot(key))
            .and_then(|(_, old)| old.downcast::<T>().ok())
    }

    #[must_use]
    pub fn contains<T: 'static>(&self, key: &AttributeKey<T>) -> bool {
        self.map.contains_key(&Self::slot(key))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// An independent copy of the current key set.
    ///
    /// Values are shared immutably; setting a key on either map afterwards is
    /// not observed by the other.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.map.iter().map(|e| e.key().0))
            .finish()
    }
}
