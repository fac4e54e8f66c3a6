use anyhow::{Result, bail};
use rusqlite::{OptionalExtension, Row, params};

use sbx_core::task::{Operation, Task, TaskStatus};
use sbx_core::{id, time};

use crate::db::Database;

/// Done/total counts for one `(sandbox, operation)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationProgress {
    pub done: i64,
    pub total: i64,
}

const TASK_COLUMNS: &str =
    "id, sandbox_id, operation, sequence, name, status, error, created_at";

impl Database {
    /// Append a single step to an operation's ledger.
    pub fn add_task(&self, sandbox_id: &str, operation: Operation, name: &str) -> Result<Task> {
        let mut tasks = self.add_tasks(sandbox_id, operation, &[name])?;
        Ok(tasks.remove(0))
    }

    /// Append a batch of steps with contiguous sequence numbers above the
    /// current maximum for `(sandbox, operation)`. One transaction, so
    /// sequences stay gap-free even under concurrent callers. An empty name
    /// list is a no-op.
    pub fn add_tasks(
        &self,
        sandbox_id: &str,
        operation: Operation,
        names: &[&str],
    ) -> Result<Vec<Task>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        for name in names {
            if name.is_empty() {
                bail!("task names must be non-empty");
            }
        }

        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let max_sequence: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) FROM tasks
             WHERE sandbox_id = ?1 AND operation = ?2",
            params![sandbox_id, operation.as_str()],
            |row| row.get(0),
        )?;

        let created_at = time::now();
        let mut tasks = Vec::with_capacity(names.len());
        for (offset, name) in names.iter().enumerate() {
            let task = Task {
                id: id::generate(),
                sandbox_id: sandbox_id.to_string(),
                operation,
                sequence: max_sequence + 1 + offset as i64,
                name: name.to_string(),
                status: TaskStatus::Pending,
                error: None,
                created_at,
            };
            tx.execute(
                &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    task.id,
                    task.sandbox_id,
                    task.operation.as_str(),
                    task.sequence,
                    task.name,
                    task.status.as_str(),
                    task.error,
                    time::to_epoch(task.created_at),
                ],
            )?;
            tasks.push(task);
        }

        tx.commit()?;
        Ok(tasks)
    }

    /// The pending task with the smallest sequence for `(sandbox, operation)`,
    /// or `None` once the operation is drained. Failed tasks are skipped so a
    /// retry advances past them.
    pub fn next_task(&self, sandbox_id: &str, operation: Operation) -> Result<Option<Task>> {
        let conn = self.lock_conn();
        let task = conn
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE sandbox_id = ?1 AND operation = ?2 AND status = 'pending'
                     ORDER BY sequence ASC LIMIT 1"
                ),
                params![sandbox_id, operation.as_str()],
                read_task_row,
            )
            .optional()?;
        task.transpose()
    }

    pub fn complete_task(&self, task_id: &str) -> Result<()> {
        self.set_task_status(task_id, TaskStatus::Done, None)
    }

    pub fn fail_task(&self, task_id: &str, error: &str) -> Result<()> {
        self.set_task_status(task_id, TaskStatus::Failed, Some(error))
    }

    fn set_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock_conn();
        let updated = conn.execute(
            "UPDATE tasks SET status = ?2, error = ?3 WHERE id = ?1",
            params![task_id, status.as_str(), error],
        )?;
        if updated == 0 {
            bail!("task with id {:?} does not exist", task_id);
        }
        Ok(())
    }

    /// Done/total step counts for one operation.
    pub fn progress(&self, sandbox_id: &str, operation: Operation) -> Result<OperationProgress> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT COALESCE(SUM(status = 'done'), 0), COUNT(*) FROM tasks
             WHERE sandbox_id = ?1 AND operation = ?2",
            params![sandbox_id, operation.as_str()],
            |row| {
                Ok(OperationProgress {
                    done: row.get(0)?,
                    total: row.get(1)?,
                })
            },
        )
        .map_err(Into::into)
    }

    /// The operation of the oldest pending task for a sandbox, if any.
    /// Pending rows after a crash reveal where work was interrupted.
    pub fn has_pending_operation(&self, sandbox_id: &str) -> Result<Option<Operation>> {
        let conn = self.lock_conn();
        let op: Option<String> = conn
            .query_row(
                "SELECT operation FROM tasks
                 WHERE sandbox_id = ?1 AND status = 'pending'
                 ORDER BY created_at ASC, sequence ASC LIMIT 1",
                params![sandbox_id],
                |row| row.get(0),
            )
            .optional()?;
        op.as_deref().map(Operation::parse).transpose()
    }

    /// Drop all ledger rows for one operation.
    pub fn clear_operation(&self, sandbox_id: &str, operation: Operation) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "DELETE FROM tasks WHERE sandbox_id = ?1 AND operation = ?2",
            params![sandbox_id, operation.as_str()],
        )?;
        Ok(())
    }

    /// Full ledger for one operation, in sequence order.
    pub fn list_tasks(&self, sandbox_id: &str, operation: Operation) -> Result<Vec<Task>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE sandbox_id = ?1 AND operation = ?2
             ORDER BY sequence ASC"
        ))?;
        let rows = stmt
            .query_map(params![sandbox_id, operation.as_str()], read_task_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }
}

fn read_task_row(row: &Row<'_>) -> rusqlite::Result<Result<Task>> {
    let operation_str: String = row.get(2)?;
    let status_str: String = row.get(5)?;
    let created_at: i64 = row.get(7)?;

    let id: String = row.get(0)?;
    let sandbox_id: String = row.get(1)?;
    let sequence: i64 = row.get(3)?;
    let name: String = row.get(4)?;
    let error: Option<String> = row.get(6)?;

    Ok((|| -> Result<Task> {
        Ok(Task {
            id,
            sandbox_id,
            operation: Operation::parse(&operation_str)?,
            sequence,
            name,
            status: TaskStatus::parse(&status_str)?,
            error,
            created_at: time::from_epoch(created_at),
        })
    })())
}
