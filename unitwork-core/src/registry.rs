//! Name-keyed singleton registry.
//!
//! A [`Registry`] hands out exactly one instance per component name, building
//! it lazily on first access. Construction is guarded by two lock layers: a
//! global lock protects the table of per-name locks, and each per-name lock
//! guards the construction of that one component. Unrelated components never
//! serialise behind each other, and a component's constructor runs at most
//! once even when many callers race on first access.
//!
//! Entries live as long as the registry. There is no eviction or refresh.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use unitwork_core::registry::Registry;
//!
//! let registry = Registry::new();
//! let first: Arc<String> = registry.load_or_store("greeting", || "hello".to_string());
//! let second: Arc<String> = registry.load_or_store("greeting", || "ignored".to_string());
//! assert!(Arc::ptr_eq(&first, &second));
//! ```

use std::{
    any::{Any, type_name},
    borrow::Cow,
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
};

use parking_lot::{Mutex, RwLock};

type Entry = Arc<dyn Any + Send + Sync>;

/// A self-describing component.
///
/// Services, repositories and factories that are meant to be process-wide
/// singletons implement this to supply their registry name explicitly.
pub trait Component {
    fn name(&self) -> Cow<'static, str>;
}

/// The name a component is registered under.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ComponentKey(String);

impl ComponentKey {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Key derived from the runtime type descriptor of `T`.
    ///
    /// Module paths are stripped from every path segment, so
    /// `my_app::orders::Manager<my_app::orders::Order>` becomes
    /// `Manager<Order>`.
    #[must_use]
    pub fn of<T: ?Sized>() -> Self {
        Self(strip_type_path(type_name::<T>()))
    }

    /// Key supplied by a self-describing component.
    #[must_use]
    pub fn component<C: Component + ?Sized>(component: &C) -> Self {
        Self(component.name().into_owned())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentKey {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

impl From<String> for ComponentKey {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&String> for ComponentKey {
    fn from(name: &String) -> Self {
        Self(name.clone())
    }
}

/// Strip module prefixes from each segment of a type path.
fn strip_type_path(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();
    for ch in full.chars() {
        if ch.is_alphanumeric() || ch == '_' || ch == ':' {
            segment.push(ch);
        } else {
            out.push_str(last_segment(&segment));
            segment.clear();
            out.push(ch);
        }
    }
    out.push_str(last_segment(&segment));
    out
}

fn last_segment(path: &str) -> &str {
    path.rsplit("::").next().unwrap_or(path)
}

/// Name-keyed singleton store.
///
/// Applications normally use [`Registry::global`]. Tests construct
/// independent registries with [`Registry::new`] so singletons do not leak
/// between cases.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<ComponentKey, Entry>>,
    locks: RwLock<HashMap<ComponentKey, Arc<Mutex<()>>>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        let mut names: Vec<&str> = entries.keys().map(ComponentKey::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Registry").field("entries", &names).finish()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Return the unique instance for `key`, constructing it on first access.
    ///
    /// `construct` runs at most once per key for the lifetime of the
    /// registry, even under concurrent first access.
    ///
    /// # Panics
    ///
    /// Panics if an entry already registered under `key` is not a `T`. That
    /// is an integration bug (two components sharing a name), not a
    /// recoverable condition.
    pub fn load_or_store<T, F>(&self, key: impl Into<ComponentKey>, construct: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let key = key.into();
        if let Some(entry) = self.entries.read().get(&key).cloned() {
            tracing::trace!(component = %key, "registry hit");
            return downcast(&key, entry);
        }

        let lock = self.lock_for(&key);
        let _guard = lock.lock();

        if let Some(entry) = self.entries.read().get(&key).cloned() {
            return downcast(&key, entry);
        }

        let component: Arc<T> = Arc::new(construct());
        self.entries
            .write()
            .insert(key.clone(), Arc::clone(&component) as Entry);
        tracing::debug!(component = %key, "component constructed");
        component
    }

    /// Return the instance registered under `key`, if any, without
    /// constructing it.
    ///
    /// # Panics
    ///
    /// Panics if the entry exists but is not a `T`.
    pub fn load<T>(&self, key: impl Into<ComponentKey>) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let key = key.into();
        let entry = self.entries.read().get(&key).cloned()?;
        Some(downcast(&key, entry))
    }

    /// Return the instance registered under `key`.
    ///
    /// # Panics
    ///
    /// Panics if nothing is registered under `key`, or if the entry is not a
    /// `T`.
    pub fn must_load<T>(&self, key: impl Into<ComponentKey>) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        let key = key.into();
        match self.load(key.clone()) {
            Some(component) => component,
            None => panic!("component `{key}` not found"),
        }
    }

    #[must_use]
    pub fn contains(&self, key: impl Into<ComponentKey>) -> bool {
        self.entries.read().contains_key(&key.into())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Fetch the per-name construction lock, creating it on first use.
    ///
    /// Existing locks are found under the shared read lock; the write lock is
    /// only taken to insert, and the entry is re-checked there.
    fn lock_for(&self, key: &ComponentKey) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().get(key) {
            return Arc::clone(lock);
        }
        let mut locks = self.locks.write();
        Arc::clone(locks.entry(key.clone()).or_default())
    }
}

fn downcast<T>(key: &ComponentKey, entry: Entry) -> Arc<T>
where
    T: Any + Send + Sync,
{
    match entry.downcast::<T>() {
        Ok(component) => component,
        Err(_) => panic!(
            "component `{key}` is registered with a different type than `{}`",
            type_name::<T>()
        ),
    }
}
