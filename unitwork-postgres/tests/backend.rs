//! Integration tests for the `PostgreSQL` backend.
//!
//! These tests require Docker to be running and will spin up a `PostgreSQL`
//! container using testcontainers.

use std::sync::{Arc, LazyLock};

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use unitwork_core::{
    aggregate::{Aggregate, AggregateRoot, RootState, RootTracking},
    context::Context,
    error::Error,
    repository::{Repository, StoreRepository, UnitOfWork},
    test::{RecordingPublisher, SequenceIdGenerator},
    trace::{Descriptor, FieldDescriptor, FieldKind, Traced},
    transaction::{Propagation, TransactionManager},
};
use unitwork_postgres::{Database, JsonStore};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Note {
    id: i64,
    title: String,
}

impl Aggregate for Note {
    fn aggregate_id(&self) -> i64 {
        self.id
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Memo {
    id: i64,
    body: String,
    state: RootState<Memo>,
}

static MEMO: LazyLock<Descriptor<Memo>> = LazyLock::new(|| {
    Descriptor::new(vec![FieldDescriptor::untagged("body", FieldKind::Scalar {
        eq: |a: &Memo, b: &Memo| a.body == b.body,
    })])
});

impl Traced for Memo {
    fn descriptor() -> &'static Descriptor<Self> {
        &MEMO
    }
}

impl Aggregate for Memo {
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

impl AggregateRoot for Memo {
    fn root_state(&self) -> &RootState<Self> {
        &self.state
    }

    fn root_state_mut(&mut self) -> &mut RootState<Self> {
        &mut self.state
    }
}

/// Test helper to set up a `PostgreSQL` container and connection pool.
struct TestDb {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestDb {
    async fn new() -> Self {
        let container = Postgres::default().start().await.unwrap();
        let host = container.get_host().await.unwrap();
        let port = container.get_host_port_ipv4(5432).await.unwrap();

        let connection_string = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let pool = PgPool::connect(&connection_string).await.unwrap();

        Self {
            _container: container,
            pool,
        }
    }
}

struct Fixture {
    db: TestDb,
    repository: StoreRepository<Note, JsonStore<Note>>,
    manager: TransactionManager,
}

async fn fixture() -> Fixture {
    let db = TestDb::new().await;
    let database = Database::new(db.pool.clone());
    let store = JsonStore::new("notes").unwrap();
    store.migrate(&database).await.unwrap();
    let uow = Arc::new(UnitOfWork::new(
        Arc::new(RecordingPublisher::new()),
        Arc::new(SequenceIdGenerator::default()),
    ));
    Fixture {
        repository: StoreRepository::new(uow, database.clone(), store),
        manager: TransactionManager::new(database),
        db,
    }
}

fn note(id: i64, title: &str) -> Note {
    Note {
        id,
        title: title.into(),
    }
}

async fn count(pool: &PgPool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM notes")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn migrate_is_idempotent() {
    let fx = fixture().await;
    let database = Database::new(fx.db.pool.clone());
    let store = JsonStore::<Note>::new("notes").unwrap();

    store.migrate(&database).await.unwrap();
    store.migrate(&database).await.unwrap();
    assert_eq!(count(&fx.db.pool).await, 0);
}

#[tokio::test]
async fn save_find_and_remove_outside_a_transaction() {
    let fx = fixture().await;
    let ctx = Context::background();

    let mut first = note(1, "draft");
    fx.repository.save(&ctx, &mut first).await.unwrap();
    first.title = "final".into();
    fx.repository.save(&ctx, &mut first).await.unwrap();

    let found = fx.repository.find(&ctx, 1).await.unwrap();
    assert_eq!(found, Some(note(1, "final")));
    let kind: String = sqlx::query_scalar("SELECT kind FROM notes WHERE id = 1")
        .fetch_one(&fx.db.pool)
        .await
        .unwrap();
    assert!(kind.ends_with("Note"));

    fx.repository.remove(&ctx, &mut first).await.unwrap();
    assert!(fx.repository.find(&ctx, 1).await.unwrap().is_none());
}

#[tokio::test]
async fn committed_transactions_are_visible() {
    let fx = fixture().await;
    let repository = &fx.repository;

    fx.manager
        .transaction(&Context::background(), |ctx| async move {
            repository.save(&ctx, &mut note(1, "a")).await?;
            repository.save(&ctx, &mut note(2, "b")).await?;
            let inside = repository.find(&ctx, 2).await?;
            assert_eq!(inside, Some(note(2, "b")));
            Ok::<_, Error>(())
        })
        .await
        .unwrap();

    assert_eq!(count(&fx.db.pool).await, 2);
}

#[tokio::test]
async fn failed_transactions_roll_back() {
    let fx = fixture().await;
    let repository = &fx.repository;

    let result: Result<(), Error> = fx
        .manager
        .transaction(&Context::background(), |ctx| async move {
            repository.save(&ctx, &mut note(1, "a")).await?;
            repository.find_non_nil(&ctx, 99).await?;
            Ok(())
        })
        .await;

    assert!(result.unwrap_err().is_not_found());
    assert_eq!(count(&fx.db.pool).await, 0);
}

#[tokio::test]
async fn nested_failure_rolls_back_to_the_savepoint() {
    let fx = fixture().await;
    let repository = &fx.repository;
    let manager = &fx.manager;

    manager
        .transaction(&Context::background(), |ctx| async move {
            repository.save(&ctx, &mut note(1, "outer")).await?;
            let nested: Result<(), Error> = manager
                .transaction_with(&ctx, Propagation::Nested, |ctx| async move {
                    repository.save(&ctx, &mut note(2, "inner")).await?;
                    repository.find_non_nil(&ctx, 99).await?;
                    Ok(())
                })
                .await;
            assert!(nested.is_err());
            repository.save(&ctx, &mut note(3, "after")).await?;
            Ok::<_, Error>(())
        })
        .await
        .unwrap();

    let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM notes ORDER BY id")
        .fetch_all(&fx.db.pool)
        .await
        .unwrap();
    assert_eq!(ids, [1, 3]);
}

#[tokio::test]
async fn requires_new_commits_independently() {
    let fx = fixture().await;
    let repository = &fx.repository;
    let manager = &fx.manager;

    let result: Result<(), Error> = manager
        .transaction(&Context::background(), |ctx| async move {
            repository.save(&ctx, &mut note(1, "outer")).await?;
            manager
                .transaction_with(&ctx, Propagation::RequiresNew, |ctx| async move {
                    repository.save(&ctx, &mut note(2, "independent")).await
                })
                .await?;
            repository.find_non_nil(&ctx, 99).await?;
            Ok(())
        })
        .await;

    assert!(result.is_err());
    let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM notes ORDER BY id")
        .fetch_all(&fx.db.pool)
        .await
        .unwrap();
    assert_eq!(ids, [2]);
}

#[tokio::test]
async fn unchanged_roots_are_written_again_after_a_rollback() {
    let db = TestDb::new().await;
    let database = Database::new(db.pool.clone());
    let store = JsonStore::<Memo>::new("memos").unwrap();
    store.migrate(&database).await.unwrap();
    let uow = Arc::new(UnitOfWork::new(
        Arc::new(RecordingPublisher::new()),
        Arc::new(SequenceIdGenerator::default()),
    ));
    let repository = StoreRepository::new(uow, database.clone(), store);
    let manager = TransactionManager::new(database);
    let ctx = Context::background();

    let mut memo = Memo {
        id: 1,
        body: "remember".into(),
        state: RootState::new(),
    };
    let repo = &repository;
    let memo_ref = &mut memo;
    let result: Result<(), Error> = manager
        .transaction(&ctx, |ctx| async move {
            repo.save(&ctx, memo_ref).await?;
            repo.find_non_nil(&ctx, 99).await?;
            Ok(())
        })
        .await;
    assert!(result.is_err());
    assert!(memo.has_snapshot());
    assert!(memo.diff().is_empty());

    repository.save(&ctx, &mut memo).await.unwrap();

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memos")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
    let found = repository.find_non_nil(&ctx, 1).await.unwrap();
    assert_eq!(found.body, "remember");
}
