use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Instrument;

/// Spawn a Tokio task inside a span carrying its stable name.
pub fn spawn_named_task<F, S>(name: S, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Into<String>,
{
    let name = name.into();
    let span = tracing::info_span!("task", task_name = %name);
    tokio::spawn(future.instrument(span))
}

/// Spawn a task owned by one table, e.g. `replica:<table>` or `persist:<table>`.
/// The task span carries the table id so every event inside it is attributable.
pub fn spawn_table_task<F>(role: &str, table: &str, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let name = format!("{role}:{table}");
    let span = tracing::info_span!("task", task_name = %name, table = %table);
    tokio::spawn(future.instrument(span))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawned_tasks_return_their_output() {
        let named = spawn_named_task("answer", async { 42 });
        let table = spawn_table_task("replica", "t-1", async { "done" });
        assert_eq!(named.await.unwrap(), 42);
        assert_eq!(table.await.unwrap(), "done");
    }
}
