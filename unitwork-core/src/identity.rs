//! Identity generation for new aggregates.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;

use crate::{context::Context, error::BoxError};

/// Source of fresh aggregate identities.
///
/// Implementations must hand out positive, never-repeating values.
#[async_trait]
pub trait IdGenerator: Send + Sync {
    async fn generate(&self, ctx: &Context) -> Result<i64, BoxError>;
}

/// Process-local monotonically increasing identities.
#[derive(Debug)]
pub struct SequenceIdGenerator {
    next: AtomicI64,
}

impl SequenceIdGenerator {
    /// A generator whose first identity is `start`.
    #[must_use]
    pub const fn starting_at(start: i64) -> Self {
        Self {
            next: AtomicI64::new(start),
        }
    }
}

impl Default for SequenceIdGenerator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

#[async_trait]
impl IdGenerator for SequenceIdGenerator {
    async fn generate(&self, ctx: &Context) -> Result<i64, BoxError> {
        ctx.check()?;
        Ok(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_counts_up_from_start() {
        let ids = SequenceIdGenerator::starting_at(100);
        let ctx = Context::background();
        assert_eq!(ids.generate(&ctx).await.unwrap(), 100);
        assert_eq!(ids.generate(&ctx).await.unwrap(), 101);
        assert_eq!(SequenceIdGenerator::default().generate(&ctx).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_context_is_refused() {
        let (ctx, token) = Context::background().child_cancellation();
        token.cancel();
        assert!(SequenceIdGenerator::default().generate(&ctx).await.is_err());
    }
}
