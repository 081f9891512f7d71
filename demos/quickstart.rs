//! Walkthrough of the unit of work over the in-memory backend.
//!
//! ```sh
//! RUST_LOG=unitwork_core=trace cargo run --example quickstart --features test-util
//! ```

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use unitwork::{
    AggregateRoot, Context, DomainEvent, EventMeta, Propagation, Registry, Repository, RootState,
    SharedEvent, StoreRepository, TransactionManager, UnitOfWork,
    backend::inmemory::Database,
    bus::Bus,
    event::{BusPublisher, register_async_subscriber, register_sync_subscriber},
    store::inmemory,
    test::SequenceIdGenerator,
};

#[derive(Debug)]
struct Deposited {
    account: i64,
    amount: i64,
    meta: EventMeta,
}

impl fmt::Display for Deposited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} deposited into account {}", self.amount, self.account)
    }
}

impl DomainEvent for Deposited {
    fn meta(&self) -> &EventMeta {
        &self.meta
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, AggregateRoot)]
struct Account {
    id: i64,
    owner: String,
    #[trace(tag = "balance")]
    balance: i64,
    #[serde(skip)]
    state: RootState<Account>,
}

impl Account {
    fn open(id: i64, owner: &str) -> Self {
        Self {
            id,
            owner: owner.into(),
            balance: 0,
            state: RootState::new(),
        }
    }

    fn deposit(&mut self, amount: i64) {
        self.balance += amount;
        self.raise_event(Deposited {
            account: self.id,
            amount,
            meta: EventMeta::new(),
        });
    }
}

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error(transparent)]
    UnitOfWork(#[from] unitwork::Error),
    #[error("deposit of {0} exceeds the limit")]
    OverLimit(i64),
}

impl From<unitwork::transaction::TransactionError> for DemoError {
    fn from(err: unitwork::transaction::TransactionError) -> Self {
        Self::UnitOfWork(err.into())
    }
}

#[tokio::main]
async fn main() -> Result<(), DemoError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let registry = Registry::new();
    let database = Database::new();

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();
    let bus: Arc<Bus<SharedEvent>> = Arc::new(
        Bus::builder()
            .on_async_complete(move |id| {
                let _ = done_tx.send(id.to_owned());
            })
            .build(),
    );
    register_sync_subscriber(&bus, "ledger", |ctx, event| async move {
        println!("[ledger] {event} (in transaction: {})", ctx.in_transaction());
    })
    .map_err(unitwork::Error::from)?;
    register_async_subscriber(&bus, "mailer", |ctx, event| async move {
        println!("[mailer] {event} (in transaction: {})", ctx.in_transaction());
    })
    .map_err(unitwork::Error::from)?;

    let uow = UnitOfWork::shared(
        &registry,
        BusPublisher::shared(&registry, bus),
        Arc::new(SequenceIdGenerator::default()),
    );
    let accounts =
        StoreRepository::new(uow, database.clone(), inmemory::Store::<Account>::new("accounts"));
    let manager = TransactionManager::shared(&registry, database.clone());
    let ctx = Context::background();
    let repo = &accounts;

    let id = manager
        .transaction(&ctx, |ctx| async move {
            let id = repo.next_identity(&ctx).await?;
            let mut account = Account::open(id, "ada");
            account.deposit(100);
            repo.save(&ctx, &mut account).await?;
            Ok::<_, DemoError>(id)
        })
        .await?;
    done_rx.recv().await;

    // The second deposit fails inside a savepoint; the first one survives.
    let manager = &manager;
    manager
        .transaction(&ctx, |ctx| async move {
            let mut account = repo.find_non_nil(&ctx, id).await?;
            account.deposit(50);
            repo.save(&ctx, &mut account).await?;

            let nested = manager
                .transaction_with(&ctx, Propagation::Nested, |ctx| async move {
                    let mut account = repo.find_non_nil(&ctx, id).await?;
                    let amount = 10_000;
                    account.deposit(amount);
                    repo.save(&ctx, &mut account).await?;
                    Err::<(), _>(DemoError::OverLimit(amount))
                })
                .await;
            if let Err(err) = nested {
                println!("nested deposit rolled back: {err}");
            }
            Ok::<_, DemoError>(())
        })
        .await?;
    done_rx.recv().await;
    done_rx.recv().await;

    let account = accounts.find_non_nil(&ctx, id).await?;
    println!(
        "{} has a balance of {} after {:?}",
        account.owner,
        account.balance,
        database.stats()
    );
    Ok(())
}
