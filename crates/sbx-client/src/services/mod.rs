//! Per-operation orchestrators.
//!
//! Each service encodes one operation's preconditions, engine call, and
//! repository updates, holding borrowed references for the duration of a
//! single call. Multi-step operations record their steps in the task
//! ledger before touching the engine, then complete or fail each step as
//! the work lands.

pub mod check;
pub mod copy;
pub mod create;
pub mod exec;
pub mod forward;
pub mod list;
pub mod pull;
pub mod remove;
pub mod snapshot;
pub mod start;
pub mod stop;

use std::future::Future;

use anyhow::{Result, anyhow};

use sbx_core::task::Operation;
use sbx_storage::Database;

/// Drive the next pending ledger step through `work`, marking it done or
/// failed. The ledger is a record, not a re-driver; failures still
/// propagate to the caller.
pub(crate) async fn ledger_step<T>(
    db: &Database,
    sandbox_id: &str,
    operation: Operation,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    let task = db
        .next_task(sandbox_id, operation)?
        .ok_or_else(|| anyhow!("ledger for {} has no pending step", operation))?;

    match work.await {
        Ok(value) => {
            db.complete_task(&task.id)?;
            Ok(value)
        }
        Err(e) => {
            db.fail_task(&task.id, &format!("{:#}", e))?;
            Err(e)
        }
    }
}
