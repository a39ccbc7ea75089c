//! Nest-safe transaction helper.
//!
//! Repositories implement [`TransactionAbility`] by exposing their current
//! [`ExecContext`] and a way to rebuild themselves around another one. The helper
//! then decides whether to open a transaction or join the caller's:
//!
//! - pooled context: begin, run the unit of work, commit on `Ok`, roll back on `Err`
//!   or panic (the panic is re-raised after the rollback completes)
//! - transactional context: run the unit of work in place, no commit, no rollback
//!
//! ```ignore
//! struct ProductRepo { ctx: ExecContext }
//!
//! impl TransactionAbility for ProductRepo {
//!     fn exec_context(&self) -> &ExecContext { &self.ctx }
//!     fn with_context(&self, ctx: ExecContext) -> Self { Self { ctx } }
//! }
//!
//! repo.transaction(|repo| async move {
//!     repo.insert(&product).await?;
//!     repo.adjust_stock(product.id, -1).await
//! })
//! .await?;
//! ```

use crate::db::context::{ExecContext, TxHandle};
use crate::error::{DbError, DbResult};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{error, warn};

/// Deadline for acquiring a connection and beginning a transaction.
pub const DEFAULT_BEGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// An owner that can hand out its execution context and be rebuilt around another.
pub trait TransactionAbility: Sized + Send + Sync {
    /// The context statements currently run against.
    fn exec_context(&self) -> &ExecContext;

    /// A copy of this owner bound to `ctx`.
    fn with_context(&self, ctx: ExecContext) -> Self;

    /// Run `work` inside a transaction, joining the current one if there is one.
    fn transaction<T, F, Fut>(&self, work: F) -> impl Future<Output = DbResult<T>> + Send
    where
        T: Send,
        F: FnOnce(Self) -> Fut + Send,
        Fut: Future<Output = DbResult<T>> + Send,
    {
        run_in_transaction(self, work)
    }
}

impl TransactionAbility for ExecContext {
    fn exec_context(&self) -> &ExecContext {
        self
    }

    fn with_context(&self, ctx: ExecContext) -> Self {
        ctx
    }
}

/// [`run_in_transaction_within`] with [`DEFAULT_BEGIN_TIMEOUT`].
pub async fn run_in_transaction<O, T, F, Fut>(owner: &O, work: F) -> DbResult<T>
where
    O: TransactionAbility,
    F: FnOnce(O) -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    run_in_transaction_within(owner, DEFAULT_BEGIN_TIMEOUT, work).await
}

/// Run `work` against a transactional copy of `owner`.
///
/// `begin_timeout` bounds connection acquisition plus `BEGIN`; when it elapses the
/// call fails with `DbError::Timeout` and nothing is left open. A failed rollback
/// is joined with the error that caused it.
pub async fn run_in_transaction_within<O, T, F, Fut>(
    owner: &O,
    begin_timeout: Duration,
    work: F,
) -> DbResult<T>
where
    O: TransactionAbility,
    F: FnOnce(O) -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let pool = match owner.exec_context() {
        ExecContext::Transaction(tx) => {
            if !tx.is_active().await {
                return Err(DbError::unsupported_context(format!(
                    "transaction {} is no longer active",
                    tx.id()
                )));
            }
            return work(owner.with_context(ExecContext::Transaction(tx.clone()))).await;
        }
        ExecContext::Pool(pool) => pool.clone(),
    };

    let tx = tokio::time::timeout(begin_timeout, TxHandle::begin(&pool))
        .await
        .map_err(|_| DbError::timeout(format!("begin {} transaction", pool.engine()), begin_timeout))??;

    let guard = TxGuard::new(tx.clone());
    let scoped = owner.with_context(ExecContext::Transaction(tx));
    let outcome = AssertUnwindSafe(async move { work(scoped).await })
        .catch_unwind()
        .await;

    match outcome {
        Err(panic) => {
            let id = guard.id().to_string();
            if let Err(e) = guard.rollback().await {
                error!(transaction_id = %id, error = %e, "Rollback after panic failed");
            }
            std::panic::resume_unwind(panic)
        }
        Ok(Err(cause)) => {
            warn!(transaction_id = %guard.id(), error = %cause, "Unit of work failed, rolling back");
            match guard.rollback().await {
                Ok(()) => Err(cause),
                Err(rollback) => Err(DbError::rollback(cause, rollback)),
            }
        }
        Ok(Ok(value)) => {
            guard.commit().await?;
            Ok(value)
        }
    }
}

/// Owns the outcome of one transaction. Dropped without being resolved (the
/// surrounding future was cancelled), it releases the transaction so the driver
/// rolls it back.
struct TxGuard {
    tx: TxHandle,
    armed: bool,
}

impl TxGuard {
    fn new(tx: TxHandle) -> Self {
        Self { tx, armed: true }
    }

    fn id(&self) -> &str {
        self.tx.id()
    }

    async fn commit(mut self) -> DbResult<()> {
        self.armed = false;
        self.tx.commit().await
    }

    async fn rollback(mut self) -> DbResult<()> {
        self.armed = false;
        self.tx.rollback().await
    }
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        if self.armed {
            self.tx.abandon();
        }
    }
}
