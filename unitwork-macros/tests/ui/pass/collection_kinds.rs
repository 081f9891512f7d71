use std::collections::{HashMap, VecDeque};

use unitwork::{AggregateRoot, RootState, RootTracking};

#[derive(Clone, AggregateRoot)]
struct Playlist {
    #[aggregate(id)]
    key: i64,
    #[trace(tag = "queue")]
    queue: VecDeque<String>,
    #[trace(tag = "ratings")]
    ratings: HashMap<String, u8>,
    #[trace(tag = "slots")]
    slots: [u8; 3],
    #[trace(tag = "owner", scalar)]
    owners: Vec<String>,
    #[aggregate(state)]
    bookkeeping: RootState<Playlist>,
}

fn main() {
    let mut playlist = Playlist {
        key: 1,
        queue: VecDeque::from(vec!["a".to_string()]),
        ratings: HashMap::new(),
        slots: [0; 3],
        owners: vec!["ada".into()],
        bookkeeping: RootState::new(),
    };
    playlist.attach();

    playlist.queue.push_back("b".into());
    playlist.ratings.insert("a".into(), 5);
    playlist.slots[1] = 9;
    playlist.owners.push("bo".into());

    let diff = playlist.diff();
    assert!(!diff.is_self_changed());
    assert!(diff.list_diff("queue").is_changed());
    assert_eq!(diff.list_diff("ratings").added::<u8>(), vec![&5]);
    assert!(diff.list_diff("slots").is_changed());
    assert!(diff.diff("owner").is_changed());
}
