use sqlx::{PgConnection, Postgres, Transaction};

use crate::db::DbPool;
use crate::error::MarketDashResult;

/// A database transaction scoped to one tenant.
///
/// Every statement that touches a tenant table must run through one of these.
/// The row-level policies compare each row's user_id against the
/// app.current_user_id session variable, which is set transaction-locally
/// here (set_config with is_local = true), so the variable is gone as soon as
/// the transaction commits or rolls back. Dropping the guard without commit
/// rolls back.
pub struct TenantTx {
    tx: Transaction<'static, Postgres>,
    owner_id: i64,
}

pub async fn begin(pool: &DbPool, owner_id: i64) -> MarketDashResult<TenantTx> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT set_config('app.current_user_id', $1, true)")
        .bind(owner_id.to_string())
        .execute(&mut *tx)
        .await?;
    Ok(TenantTx { tx, owner_id })
}

impl TenantTx {
    pub fn owner_id(&self) -> i64 {
        self.owner_id
    }

    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    pub async fn commit(self) -> MarketDashResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> MarketDashResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
