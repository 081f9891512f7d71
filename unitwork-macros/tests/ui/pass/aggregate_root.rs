use std::collections::BTreeMap;

use unitwork::{AggregateRoot, Entity, RootState, RootTracking};

#[derive(Clone, Debug, PartialEq)]
struct OrderLine {
    id: i64,
    quantity: u32,
}

impl Entity for OrderLine {
    fn identifier(&self) -> i64 {
        self.id
    }
}

#[derive(Clone, AggregateRoot)]
struct Order {
    id: i64,
    #[trace(tag = "address")]
    street: String,
    #[trace(tag = "address")]
    city: String,
    note: String,
    #[trace(tag = "lines", entity)]
    lines: Vec<OrderLine>,
    #[trace(tag = "labels")]
    labels: BTreeMap<String, String>,
    #[trace(skip)]
    views: u64,
    state: RootState<Order>,
}

fn main() {
    let mut order = Order {
        id: 7,
        street: "Main St".into(),
        city: "Springfield".into(),
        note: String::new(),
        lines: vec![OrderLine { id: 1, quantity: 1 }],
        labels: BTreeMap::new(),
        views: 0,
        state: RootState::new(),
    };
    assert!(order.diff().is_self_changed());

    order.attach();
    order.views += 1;
    assert!(order.diff().is_empty());

    order.city = "Shelbyville".into();
    order.lines[0].quantity = 3;
    order.lines.push(OrderLine { id: 2, quantity: 1 });
    let diff = order.diff();
    assert!(!diff.is_self_changed());
    assert!(diff.diff("address").is_changed());
    assert_eq!(diff.list_diff("lines").added::<OrderLine>()[0].id, 2);
    assert_eq!(diff.list_diff("lines").modified::<OrderLine>()[0].quantity, 3);
    assert!(!diff.list_diff("labels").is_changed());

    order.note = "fragile".into();
    assert!(order.diff().is_self_changed());
}
