//! Aggregate primitives.
//!
//! An [`Aggregate`] is anything with a stable integer identity. An
//! [`AggregateRoot`] additionally buffers domain events raised while it is
//! being mutated and holds a snapshot of its last persisted state, which is
//! what [`RootTracking::diff`] compares against.
//!
//! The bookkeeping lives in a [`RootState`] field on the root itself. The
//! derive macros wire everything up:
//!
//! ```ignore
//! #[derive(Clone, Debug, AggregateRoot)]
//! struct Order {
//!     #[aggregate(id)]
//!     id: i64,
//!     #[trace(tag = "address")]
//!     street: String,
//!     #[trace(tag = "lines", entity)]
//!     lines: Vec<OrderLine>,
//!     state: RootState<Order>,
//! }
//! ```

use std::{any::Any, fmt, sync::Arc};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::IgnoredAny};

use crate::{
    diff::AggregateDiff,
    event::{DomainEvent, SharedEvent},
    trace::{Traced, trace},
};

/// A domain object with a stable identity.
///
/// An identity `<= 0` means the aggregate has not been persisted yet.
pub trait Aggregate: Any + Send + Sync {
    fn aggregate_id(&self) -> i64;

    fn is_zero(&self) -> bool {
        self.aggregate_id() <= 0
    }

    /// Name of the concrete type, also through `dyn Aggregate`.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// The root bookkeeping of this aggregate, if it is a root.
    fn as_root(&self) -> Option<&dyn RootTracking> {
        None
    }

    fn as_root_mut(&mut self) -> Option<&mut dyn RootTracking> {
        None
    }
}

/// Collection elements with their own identity.
///
/// Sequences of entities are reconciled element by element when diffed.
pub trait Entity {
    fn identifier(&self) -> i64;
}

/// Object-safe view of an aggregate root's bookkeeping.
///
/// Implemented for every [`AggregateRoot`]; the unit of work drives roots
/// through this trait without knowing their concrete type.
pub trait RootTracking: Send + Sync {
    /// Pending events, in the order they were raised.
    fn events(&self) -> &[SharedEvent];

    /// Drop every pending event.
    fn clear_events(&mut self);

    /// Replace the snapshot with a copy of the current state.
    ///
    /// Does nothing for an aggregate that has not been persisted yet, or
    /// whose snapshot belongs to another identity.
    fn attach(&mut self);

    /// Drop the snapshot.
    fn detach(&mut self);

    fn has_snapshot(&self) -> bool;

    /// Changes since the snapshot was taken.
    fn diff(&self) -> AggregateDiff;
}

/// An aggregate that tracks pending events and a snapshot.
pub trait AggregateRoot: Aggregate + Traced + Clone {
    fn root_state(&self) -> &RootState<Self>;

    fn root_state_mut(&mut self) -> &mut RootState<Self>;

    /// Buffer `event` for publication on the next save.
    ///
    /// The event's identifier and occurrence time are assigned now if they
    /// are not set yet.
    fn raise_event<E: DomainEvent>(&mut self, event: E) {
        event.occurred_on();
        event.event_id();
        self.root_state_mut().events.push(Arc::new(event));
    }

    /// The snapshot, if one is held.
    fn snapshot(&self) -> Option<&Self> {
        self.root_state().snapshot.as_deref()
    }
}

impl<A: AggregateRoot> RootTracking for A {
    fn events(&self) -> &[SharedEvent] {
        &self.root_state().events
    }

    fn clear_events(&mut self) {
        self.root_state_mut().events.clear();
    }

    fn attach(&mut self) {
        let id = self.aggregate_id();
        let foreign = self
            .snapshot()
            .is_some_and(|snapshot| snapshot.aggregate_id() != id);
        if self.is_zero() || foreign {
            return;
        }
        let copy = Box::new(self.clone());
        self.root_state_mut().snapshot = Some(copy);
        tracing::trace!(aggregate_id = self.aggregate_id(), "snapshot attached");
    }

    fn detach(&mut self) {
        if self.root_state_mut().snapshot.take().is_some() {
            tracing::trace!(aggregate_id = self.aggregate_id(), "snapshot detached");
        }
    }

    fn has_snapshot(&self) -> bool {
        self.root_state().snapshot.is_some()
    }

    fn diff(&self) -> AggregateDiff {
        let snapshot = self
            .snapshot()
            .filter(|snapshot| snapshot.aggregate_id() == self.aggregate_id());
        trace(self, snapshot)
    }
}

/// Bookkeeping owned by an aggregate root: pending events and the snapshot.
///
/// A `RootState` is invisible to everything except the root's own tracking:
/// cloning yields an empty state (a snapshot never holds a nested snapshot or
/// stale events), any two states compare equal, and serialization writes
/// nothing meaningful and reads back an empty state.
pub struct RootState<A> {
    events: Vec<SharedEvent>,
    snapshot: Option<Box<A>>,
}

impl<A> RootState<A> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            events: Vec::new(),
            snapshot: None,
        }
    }
}

impl<A> Default for RootState<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Clone for RootState<A> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<A> PartialEq for RootState<A> {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl<A> Eq for RootState<A> {}

impl<A> fmt::Debug for RootState<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootState")
            .field("events", &self.events.len())
            .field("snapshot", &self.snapshot.is_some())
            .finish()
    }
}

impl<A> Serialize for RootState<A> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_unit()
    }
}

impl<'de, A> Deserialize<'de> for RootState<A> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        IgnoredAny::deserialize(deserializer)?;
        Ok(Self::new())
    }
}

#[cfg(test)]
mod tests {
    use std::{fmt, sync::LazyLock};

    use super::*;
    use crate::{
        event::EventMeta,
        trace::{Descriptor, FieldDescriptor, FieldKind, reconcile_entities},
    };

    #[derive(Clone, Debug, PartialEq)]
    struct Line {
        id: i64,
        qty: u32,
    }

    impl Entity for Line {
        fn identifier(&self) -> i64 {
            self.id
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Cart {
        id: i64,
        owner: String,
        lines: Vec<Line>,
        state: RootState<Cart>,
    }

    static CART: LazyLock<Descriptor<Cart>> = LazyLock::new(|| {
        Descriptor::new(vec![
            FieldDescriptor::untagged("owner", FieldKind::Scalar {
                eq: |a: &Cart, b: &Cart| a.owner == b.owner,
            }),
            FieldDescriptor::tagged("lines", "lines", FieldKind::Sequence {
                eq: |a: &Cart, b: &Cart| a.lines == b.lines,
                reconcile: |a: &Cart, b: &Cart| reconcile_entities(&a.lines, &b.lines),
            }),
        ])
    });

    impl Traced for Cart {
        fn descriptor() -> &'static Descriptor<Self> {
            &CART
        }
    }

    impl Aggregate for Cart {
        fn aggregate_id(&self) -> i64 {
            self.id
        }

        fn as_root(&self) -> Option<&dyn RootTracking> {
            Some(self)
        }

        fn as_root_mut(&mut self) -> Option<&mut dyn RootTracking> {
            Some(self)
        }
    }

    impl AggregateRoot for Cart {
        fn root_state(&self) -> &RootState<Self> {
            &self.state
        }

        fn root_state_mut(&mut self) -> &mut RootState<Self> {
            &mut self.state
        }
    }

    #[derive(Debug)]
    struct LineAdded {
        line: i64,
        meta: EventMeta,
    }

    impl fmt::Display for LineAdded {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "line {} added", self.line)
        }
    }

    impl DomainEvent for LineAdded {
        fn meta(&self) -> &EventMeta {
            &self.meta
        }
    }

    fn cart(id: i64) -> Cart {
        Cart {
            id,
            owner: "ada".into(),
            lines: vec![Line { id: 1, qty: 1 }],
            state: RootState::new(),
        }
    }

    #[test]
    fn identity_at_or_below_zero_is_zero() {
        assert!(cart(0).is_zero());
        assert!(cart(-3).is_zero());
        assert!(!cart(1).is_zero());
    }

    #[test]
    fn raise_event_stamps_and_buffers_in_order() {
        let mut cart = cart(1);
        cart.raise_event(LineAdded {
            line: 1,
            meta: EventMeta::new(),
        });
        cart.raise_event(LineAdded {
            line: 2,
            meta: EventMeta::new().with_occurred_on(42),
        });

        let events = cart.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].event_id().starts_with("DomainEvent:"));
        assert!(events[0].occurred_on() > 0);
        assert_eq!(events[1].occurred_on(), 42);
        assert_eq!(events[1].to_string(), "line 2 added");

        cart.clear_events();
        assert!(cart.events().is_empty());
    }

    #[test]
    fn without_snapshot_everything_changed() {
        let cart = cart(1);
        assert!(!cart.has_snapshot());
        assert!(cart.diff().is_self_changed());
    }

    #[test]
    fn attach_snapshots_current_state() {
        let mut cart = cart(1);
        cart.attach();
        assert!(cart.has_snapshot());
        assert!(cart.diff().is_empty());

        cart.lines.push(Line { id: 2, qty: 5 });
        let diff = cart.diff();
        assert!(!diff.is_self_changed());
        assert_eq!(
            diff.list_diff("lines").added::<Line>(),
            vec![&Line { id: 2, qty: 5 }]
        );
    }

    #[test]
    fn snapshot_does_not_nest_or_carry_events() {
        let mut cart = cart(1);
        cart.raise_event(LineAdded {
            line: 1,
            meta: EventMeta::new(),
        });
        cart.attach();
        cart.attach();

        let snapshot = cart.snapshot().unwrap();
        assert!(!snapshot.has_snapshot());
        assert!(snapshot.events().is_empty());
        assert_eq!(cart.events().len(), 1);
    }

    #[test]
    fn attach_ignores_unsaved_aggregates() {
        let mut cart = cart(0);
        cart.attach();
        assert!(!cart.has_snapshot());
    }

    #[test]
    fn detach_drops_snapshot() {
        let mut cart = cart(1);
        cart.attach();
        cart.detach();
        assert!(cart.snapshot().is_none());
        assert!(cart.diff().is_self_changed());
    }

    #[test]
    fn snapshot_for_another_identity_is_ignored() {
        let mut cart = cart(1);
        cart.attach();
        cart.id = 2;
        assert!(cart.diff().is_self_changed());
    }

    #[test]
    fn attach_keeps_a_snapshot_of_another_identity() {
        let mut cart = cart(1);
        cart.attach();
        cart.id = 2;
        cart.owner = "bo".into();
        cart.attach();

        let snapshot = cart.snapshot().unwrap();
        assert_eq!(snapshot.id, 1);
        assert_eq!(snapshot.owner, "ada");
        assert!(cart.diff().is_self_changed());
    }

    #[test]
    fn root_state_is_invisible_to_serde() {
        #[derive(Serialize, Deserialize)]
        struct Row {
            n: u8,
            state: RootState<()>,
        }

        let json = serde_json::to_string(&Row {
            n: 1,
            state: RootState::new(),
        })
        .unwrap();
        assert_eq!(json, r#"{"n":1,"state":null}"#);

        let row: Row = serde_json::from_str(r#"{"n":2,"state":{"anything":[1,2]}}"#).unwrap();
        assert_eq!(row.n, 2);
    }

    #[test]
    fn dyn_root_access_through_aggregate() {
        let mut cart = cart(1);
        let aggregate: &mut dyn Aggregate = &mut cart;
        aggregate.as_root_mut().unwrap().attach();
        assert!(aggregate.as_root().unwrap().has_snapshot());
    }
}
