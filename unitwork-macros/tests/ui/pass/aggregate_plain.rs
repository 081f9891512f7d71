use unitwork::Aggregate;

#[derive(Aggregate)]
struct Warehouse {
    #[aggregate(id)]
    code: i32,
    #[allow(dead_code)]
    city: String,
}

#[derive(Aggregate)]
struct Tagged<T: Send + Sync + 'static> {
    id: i64,
    #[allow(dead_code)]
    value: T,
}

fn main() {
    let warehouse = Warehouse {
        code: 12,
        city: "Oslo".into(),
    };
    assert_eq!(warehouse.aggregate_id(), 12);
    assert!(warehouse.as_root().is_none());

    let tagged = Tagged { id: 0, value: 'x' };
    assert!(tagged.is_zero());
}
