//! Aggregate diff records.
//!
//! An [`AggregateDiff`] says what changed on an aggregate root since its
//! snapshot was taken:
//!
//! - a *self-changed* flag covering every untagged field as one unit,
//! - a changed/unchanged [`Diff`] per field group,
//! - a [`ListDiff`] per reconciled collection group.
//!
//! Diffs are write-once: they are assembled through [`AggregateDiffBuilder`]
//! and frozen by [`AggregateDiffBuilder::build`]. Lookups for groups that were
//! never recorded return unchanged/empty values rather than failing.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::{Arc, LazyLock},
};

/// Opaque collection element carried by a [`ListDiff`].
pub trait DiffElement: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T> DiffElement for T
where
    T: Any + fmt::Debug + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Shared handle to a diffed element.
pub type Element = Arc<dyn DiffElement>;

/// Whether a field group changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Diff(bool);

impl Diff {
    pub const UNCHANGED: Self = Self(false);
    pub const CHANGED: Self = Self(true);

    #[must_use]
    pub const fn new(changed: bool) -> Self {
        Self(changed)
    }

    #[must_use]
    pub const fn is_changed(self) -> bool {
        self.0
    }
}

/// Element-level changes of one collection group.
#[derive(Clone, Debug, Default)]
pub struct ListDiff {
    added: Vec<Element>,
    removed: Vec<Element>,
    modified: Vec<Element>,
}

static EMPTY_LIST_DIFF: LazyLock<ListDiff> = LazyLock::new(ListDiff::default);

impl ListDiff {
    /// The shared empty list diff.
    #[must_use]
    pub fn empty() -> &'static Self {
        &EMPTY_LIST_DIFF
    }

    #[must_use]
    pub fn builder() -> ListDiffBuilder {
        ListDiffBuilder::default()
    }

    #[must_use]
    pub fn is_changed(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty())
    }

    #[must_use]
    pub fn added_elements(&self) -> &[Element] {
        &self.added
    }

    #[must_use]
    pub fn removed_elements(&self) -> &[Element] {
        &self.removed
    }

    #[must_use]
    pub fn modified_elements(&self) -> &[Element] {
        &self.modified
    }

    /// Added elements of type `T`. Elements of other types are skipped.
    #[must_use]
    pub fn added<T: Any>(&self) -> Vec<&T> {
        typed(&self.added)
    }

    /// Removed elements of type `T`. Elements of other types are skipped.
    #[must_use]
    pub fn removed<T: Any>(&self) -> Vec<&T> {
        typed(&self.removed)
    }

    /// Modified elements of type `T`. Elements of other types are skipped.
    #[must_use]
    pub fn modified<T: Any>(&self) -> Vec<&T> {
        typed(&self.modified)
    }
}

fn typed<T: Any>(elements: &[Element]) -> Vec<&T> {
    elements
        .iter()
        .filter_map(|e| e.as_ref().as_any().downcast_ref::<T>())
        .collect()
}

/// Builder for [`ListDiff`].
#[derive(Debug, Default)]
pub struct ListDiffBuilder {
    inner: ListDiff,
}

impl ListDiffBuilder {
    pub fn append_added(&mut self, element: impl DiffElement) -> &mut Self {
        self.inner.added.push(Arc::new(element));
        self
    }

    pub fn append_removed(&mut self, element: impl DiffElement) -> &mut Self {
        self.inner.removed.push(Arc::new(element));
        self
    }

    pub fn append_modified(&mut self, element: impl DiffElement) -> &mut Self {
        self.inner.modified.push(Arc::new(element));
        self
    }

    #[must_use]
    pub fn build(self) -> ListDiff {
        self.inner
    }
}

/// Immutable record of what changed on an aggregate root.
#[derive(Clone, Debug, Default)]
pub struct AggregateDiff {
    self_changed: bool,
    diffs: HashMap<String, Diff>,
    list_diffs: HashMap<String, ListDiff>,
}

impl AggregateDiff {
    /// The diff handed to non-root saves: nothing changed, no groups.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> AggregateDiffBuilder {
        AggregateDiffBuilder::default()
    }

    /// A diff that only says "everything may have changed".
    #[must_use]
    pub fn self_changed() -> Self {
        let mut builder = Self::builder();
        builder.set_self_changed(true);
        builder.build()
    }

    /// `true` when neither the aggregate itself nor any group changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.self_changed
            && !self.diffs.values().any(|d| d.is_changed())
            && !self.list_diffs.values().any(ListDiff::is_changed)
    }

    #[must_use]
    pub const fn is_self_changed(&self) -> bool {
        self.self_changed
    }

    #[must_use]
    pub fn diff(&self, group: &str) -> Diff {
        self.diffs.get(group).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn list_diff(&self, group: &str) -> &ListDiff {
        self.list_diffs.get(group).unwrap_or_else(|| ListDiff::empty())
    }

    /// Names of every group with a recorded diff or list diff.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.diffs
            .keys()
            .chain(self.list_diffs.keys())
            .map(String::as_str)
    }
}

/// Mutable view used while a diff is being computed.
#[derive(Debug, Default)]
pub struct AggregateDiffBuilder {
    inner: AggregateDiff,
}

impl AggregateDiffBuilder {
    pub fn set_self_changed(&mut self, changed: bool) -> &mut Self {
        self.inner.self_changed = changed;
        self
    }

    pub fn put_diff(&mut self, group: impl Into<String>, diff: Diff) -> &mut Self {
        self.inner.diffs.insert(group.into(), diff);
        self
    }

    pub fn put_list_diff(&mut self, group: impl Into<String>, diff: ListDiff) -> &mut Self {
        self.inner.list_diffs.insert(group.into(), diff);
        self
    }

    #[must_use]
    pub const fn is_self_changed(&self) -> bool {
        self.inner.self_changed
    }

    #[must_use]
    pub fn diff(&self, group: &str) -> Diff {
        self.inner.diff(group)
    }

    #[must_use]
    pub fn list_diff(&self, group: &str) -> &ListDiff {
        self.inner.list_diff(group)
    }

    #[must_use]
    pub fn build(self) -> AggregateDiff {
        self.inner
    }
}
