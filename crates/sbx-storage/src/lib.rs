// sbx-storage: Durable state behind a single SQLite database.
//
// One `Database` owns the connection; the repository (sandboxes), the task
// ledger, and the image catalog are method groups on it. Every public method
// is a single transaction.

mod db;
mod images;
mod ledger;
mod repository;

pub use db::Database;
pub use ledger::OperationProgress;
