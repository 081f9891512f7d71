//! Structural diff engine.
//!
//! [`trace`] compares an aggregate with its snapshot and produces an
//! [`AggregateDiff`]. The comparison is driven by a [`Descriptor`]: an
//! explicit, per-type list of fields built once and reused for every diff of
//! that type. `#[derive(AggregateRoot)]` generates the descriptor; it can also
//! be written by hand.
//!
//! Grouping rules:
//!
//! - Untagged fields are compared as one opaque unit; any difference sets the
//!   self-changed flag.
//! - Tagged fields are bucketed by tag name. A scalar field that differs marks
//!   its whole group changed.
//! - A sequence or mapping field that is alone in its group is reconciled
//!   element by element into a [`ListDiff`]. When a group holds more than one
//!   collection field, the group falls back to plain changed/unchanged. When a
//!   scalar sibling already marked the group changed, reconciliation is
//!   skipped.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    hash::Hash,
};

use crate::{
    aggregate::Entity,
    diff::{AggregateDiff, AggregateDiffBuilder, Diff, DiffElement, ListDiff},
};

/// Parsed `"name,option,option"` field tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    name: String,
    options: String,
}

impl Tag {
    /// Parse a tag string.
    ///
    /// Returns `None` when the name component is empty or contains a
    /// character outside letters, digits and the punctuation
    /// `!#$%&()*+-./:;<=>?@[]^_{|}~` and space. Fields with such a tag are
    /// treated as untagged.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        let (name, options) = tag.split_once(',').unwrap_or((tag, ""));
        if !is_valid_name(name) {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            options: options.to_string(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the comma-separated option list contains `option`.
    #[must_use]
    pub fn has_option(&self, option: &str) -> bool {
        !self.options.is_empty() && self.options.split(',').any(|o| o == option)
    }
}

fn is_valid_name(name: &str) -> bool {
    const ALLOWED: &str = "!#$%&()*+-./:;<=>?@[]^_{|}~ ";
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || ALLOWED.contains(c))
}

type EqFn<A> = fn(&A, &A) -> bool;
type ReconcileFn<A> = fn(&A, &A) -> ListDiff;

/// How a field is compared.
pub enum FieldKind<A> {
    /// Compared by deep equality.
    Scalar { eq: EqFn<A> },
    /// Ordered collection; reconciled by element identity when alone in its
    /// group.
    Sequence {
        eq: EqFn<A>,
        reconcile: ReconcileFn<A>,
    },
    /// Keyed collection; reconciled by key when alone in its group.
    Mapping {
        eq: EqFn<A>,
        reconcile: ReconcileFn<A>,
    },
}

impl<A> FieldKind<A> {
    const fn eq_fn(&self) -> EqFn<A> {
        match self {
            Self::Scalar { eq } | Self::Sequence { eq, .. } | Self::Mapping { eq, .. } => *eq,
        }
    }

    const fn reconcile_fn(&self) -> Option<ReconcileFn<A>> {
        match self {
            Self::Scalar { .. } => None,
            Self::Sequence { reconcile, .. } | Self::Mapping { reconcile, .. } => Some(*reconcile),
        }
    }
}

impl<A> fmt::Debug for FieldKind<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Scalar { .. } => "Scalar",
            Self::Sequence { .. } => "Sequence",
            Self::Mapping { .. } => "Mapping",
        })
    }
}

/// One traced field of an aggregate type.
pub struct FieldDescriptor<A> {
    name: &'static str,
    tag: Option<Tag>,
    kind: FieldKind<A>,
}

impl<A> FieldDescriptor<A> {
    #[must_use]
    pub const fn untagged(name: &'static str, kind: FieldKind<A>) -> Self {
        Self {
            name,
            tag: None,
            kind,
        }
    }

    /// A field carrying a `"group,options"` tag. An invalid tag leaves the
    /// field untagged.
    #[must_use]
    pub fn tagged(name: &'static str, tag: &str, kind: FieldKind<A>) -> Self {
        Self {
            name,
            tag: Tag::parse(tag),
            kind,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn tag(&self) -> Option<&Tag> {
        self.tag.as_ref()
    }

    #[must_use]
    pub const fn kind(&self) -> &FieldKind<A> {
        &self.kind
    }
}

impl<A> fmt::Debug for FieldDescriptor<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Every traced field of an aggregate type.
///
/// Identity and bookkeeping fields are left out when the descriptor is built.
pub struct Descriptor<A> {
    fields: Vec<FieldDescriptor<A>>,
}

impl<A> Descriptor<A> {
    #[must_use]
    pub const fn new(fields: Vec<FieldDescriptor<A>>) -> Self {
        Self { fields }
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldDescriptor<A>] {
        &self.fields
    }
}

impl<A> fmt::Debug for Descriptor<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.fields).finish()
    }
}

/// Types with a structural diff descriptor.
pub trait Traced: Sized + 'static {
    /// The descriptor for this type, built once.
    fn descriptor() -> &'static Descriptor<Self>;
}

/// Diff `current` against `snapshot`.
///
/// Without a snapshot the result only says the aggregate changed as a whole.
pub fn trace<A: Traced>(current: &A, snapshot: Option<&A>) -> AggregateDiff {
    let Some(snapshot) = snapshot else {
        return AggregateDiff::self_changed();
    };

    let mut builder = AggregateDiff::builder();
    let mut deferred: HashMap<&str, Vec<&FieldDescriptor<A>>> = HashMap::new();

    for field in A::descriptor().fields() {
        let Some(tag) = field.tag() else {
            if !builder.is_self_changed() {
                let changed = !(field.kind().eq_fn())(current, snapshot);
                builder.set_self_changed(changed);
            }
            continue;
        };

        let group = tag.name();
        if builder.diff(group).is_changed() {
            continue;
        }
        match field.kind() {
            FieldKind::Scalar { eq } => {
                if !eq(current, snapshot) {
                    builder.put_diff(group, Diff::CHANGED);
                }
            }
            FieldKind::Sequence { .. } | FieldKind::Mapping { .. } => {
                deferred.entry(group).or_default().push(field);
            }
        }
    }

    for (group, fields) in deferred {
        reconcile_group(&mut builder, group, &fields, current, snapshot);
    }
    builder.build()
}

/// Diff against a snapshot of unknown type.
///
/// A snapshot that is not an `A` is treated like a missing snapshot.
pub fn trace_dyn<A: Traced>(current: &A, snapshot: Option<&dyn Any>) -> AggregateDiff {
    trace(current, snapshot.and_then(<dyn Any>::downcast_ref::<A>))
}

fn reconcile_group<A>(
    builder: &mut AggregateDiffBuilder,
    group: &str,
    fields: &[&FieldDescriptor<A>],
    current: &A,
    snapshot: &A,
) {
    if builder.diff(group).is_changed() {
        return;
    }
    match fields {
        [single] => {
            if let Some(reconcile) = single.kind().reconcile_fn() {
                builder.put_list_diff(group, reconcile(current, snapshot));
            }
        }
        _ => {
            let changed = fields
                .iter()
                .any(|field| !(field.kind().eq_fn())(current, snapshot));
            if changed {
                builder.put_diff(group, Diff::CHANGED);
            }
        }
    }
}

/// Reconcile two sequences by element identity.
///
/// When either side has no element with an identity, the result is a
/// wholesale replacement: every current element added, every snapshot element
/// removed.
pub fn reconcile_sequence<T, F>(current: &[T], snapshot: &[T], identity: F) -> ListDiff
where
    T: DiffElement + Clone + PartialEq,
    F: Fn(&T) -> Option<i64>,
{
    let index = |items: &[T]| -> HashMap<i64, usize> {
        items
            .iter()
            .enumerate()
            .filter_map(|(pos, item)| identity(item).map(|id| (id, pos)))
            .collect()
    };
    let current_ids = index(current);
    let snapshot_ids = index(snapshot);

    let mut builder = ListDiff::builder();
    if current_ids.is_empty() || snapshot_ids.is_empty() {
        for item in current {
            builder.append_added(item.clone());
        }
        for item in snapshot {
            builder.append_removed(item.clone());
        }
        return builder.build();
    }

    let mut seen = HashSet::new();
    for item in current {
        let Some(id) = identity(item) else { continue };
        if !seen.insert(id) {
            continue;
        }
        let latest = &current[current_ids[&id]];
        match snapshot_ids.get(&id) {
            None => {
                builder.append_added(latest.clone());
            }
            Some(&pos) if snapshot[pos] != *latest => {
                builder.append_modified(latest.clone());
            }
            Some(_) => {}
        }
    }

    let mut seen = HashSet::new();
    for item in snapshot {
        let Some(id) = identity(item) else { continue };
        if seen.insert(id) && !current_ids.contains_key(&id) {
            builder.append_removed(snapshot[snapshot_ids[&id]].clone());
        }
    }
    builder.build()
}

/// Reconcile two sequences of [`Entity`] elements by their identifier.
pub fn reconcile_entities<T>(current: &[T], snapshot: &[T]) -> ListDiff
where
    T: Entity + DiffElement + Clone + PartialEq,
{
    reconcile_sequence(current, snapshot, |item| Some(item.identifier()))
}

/// Reconcile sequences whose elements carry no identity: always a wholesale
/// replacement, and empty when both sides are equal.
pub fn reconcile_anonymous<T>(current: &[T], snapshot: &[T]) -> ListDiff
where
    T: DiffElement + Clone + PartialEq,
{
    if current == snapshot {
        return ListDiff::default();
    }
    reconcile_sequence(current, snapshot, |_| None)
}

/// Keyed collections reconciled by [`reconcile_mapping`].
pub trait TraceMap {
    type Key;
    type Value: DiffElement + Clone + PartialEq;

    fn entries(&self) -> Box<dyn Iterator<Item = (&Self::Key, &Self::Value)> + '_>;
    fn lookup(&self, key: &Self::Key) -> Option<&Self::Value>;
}

impl<K, V, S> TraceMap for HashMap<K, V, S>
where
    K: Eq + Hash,
    V: DiffElement + Clone + PartialEq,
    S: std::hash::BuildHasher,
{
    type Key = K;
    type Value = V;

    fn entries(&self) -> Box<dyn Iterator<Item = (&K, &V)> + '_> {
        Box::new(self.iter())
    }

    fn lookup(&self, key: &K) -> Option<&V> {
        self.get(key)
    }
}

impl<K, V> TraceMap for BTreeMap<K, V>
where
    K: Ord,
    V: DiffElement + Clone + PartialEq,
{
    type Key = K;
    type Value = V;

    fn entries(&self) -> Box<dyn Iterator<Item = (&K, &V)> + '_> {
        Box::new(self.iter())
    }

    fn lookup(&self, key: &K) -> Option<&V> {
        self.get(key)
    }
}

/// Reconcile two maps, using the key as element identity.
pub fn reconcile_mapping<M: TraceMap>(current: &M, snapshot: &M) -> ListDiff {
    let mut builder = ListDiff::builder();
    for (key, value) in current.entries() {
        match snapshot.lookup(key) {
            None => {
                builder.append_added(value.clone());
            }
            Some(previous) if previous != value => {
                builder.append_modified(value.clone());
            }
            Some(_) => {}
        }
    }
    for (key, value) in snapshot.entries() {
        if current.lookup(key).is_none() {
            builder.append_removed(value.clone());
        }
    }
    builder.build()
}
