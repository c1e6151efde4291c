/// Command-backed labels refreshed in the background
use crate::core::CommandLabel;
use crate::error::{GatewayError, GatewayResult};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound for a single label command run
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Dynamic labels of one database.
///
/// Each label gets its own refresh task re-running the command every
/// `period`. A failed run keeps the last known good value.
pub struct DynamicLabels {
    database: String,
    labels: Arc<RwLock<BTreeMap<String, CommandLabel>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DynamicLabels {
    pub fn new<S: Into<String>>(
        database: S,
        labels: BTreeMap<String, CommandLabel>,
        parent: &CancellationToken,
    ) -> GatewayResult<Self> {
        let database = database.into();
        for (key, label) in &labels {
            if label.command.is_empty() {
                return Err(GatewayError::bad_parameter(format!(
                    "dynamic label {:?} of {:?} has no command",
                    key, database
                )));
            }
            if label.period.is_zero() {
                return Err(GatewayError::bad_parameter(format!(
                    "dynamic label {:?} of {:?} has a zero period",
                    key, database
                )));
            }
        }
        Ok(Self {
            database,
            labels: Arc::new(RwLock::new(labels)),
            cancel: parent.child_token(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Run every label command once, in the caller's task
    pub async fn sync(&self) {
        for (key, label) in self.get() {
            refresh(&self.database, &self.labels, &key, &label.command).await;
        }
    }

    /// Spawn the refresh tasks
    pub fn start(&self) {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(e) => e.into_inner(),
        };
        if !tasks.is_empty() {
            return;
        }
        for (key, label) in self.get() {
            let database = self.database.clone();
            let labels = self.labels.clone();
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(label.period) => {}
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = refresh(&database, &labels, &key, &label.command) => {}
                    }
                }
                debug!(database = %database, label = %key, "Label refresher stopped.");
            }));
        }
    }

    /// Current labels with their latest results
    pub fn get(&self) -> BTreeMap<String, CommandLabel> {
        match self.labels.read() {
            Ok(labels) => labels.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    /// Number of refresh tasks still running
    pub fn running_tasks(&self) -> usize {
        match self.tasks.lock() {
            Ok(tasks) => tasks.iter().filter(|t| !t.is_finished()).count(),
            Err(e) => e.into_inner().iter().filter(|t| !t.is_finished()).count(),
        }
    }

    /// Stop refreshing. Tasks exit at their next wait point.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

async fn refresh(
    database: &str,
    labels: &RwLock<BTreeMap<String, CommandLabel>>,
    key: &str,
    command: &[String],
) {
    match run_command(command).await {
        Ok(output) => {
            let mut labels = match labels.write() {
                Ok(labels) => labels,
                Err(e) => e.into_inner(),
            };
            if let Some(label) = labels.get_mut(key) {
                label.result = output;
            }
        }
        Err(e) => {
            warn!(database = %database, label = %key, error = %e, "Failed to run label command, keeping previous value.");
        }
    }
}

async fn run_command(command: &[String]) -> GatewayResult<String> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| GatewayError::bad_parameter("empty label command"))?;

    let output = tokio::time::timeout(
        COMMAND_TIMEOUT,
        Command::new(program).args(args).kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| GatewayError::timeout(format!("label command {:?}", program)))??;

    if !output.status.success() {
        return Err(GatewayError::internal(format!(
            "label command {:?} exited with {}",
            program, output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(period_ms: u64, command: &[&str]) -> CommandLabel {
        CommandLabel::new(
            Duration::from_millis(period_ms),
            command.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_sync_runs_commands() {
        let mut defs = BTreeMap::new();
        defs.insert("greeting".to_string(), label(60_000, &["echo", "hello"]));
        let labels = DynamicLabels::new("pg1", defs, &CancellationToken::new()).unwrap();

        labels.sync().await;
        assert_eq!(labels.get()["greeting"].result, "hello");
    }

    #[tokio::test]
    async fn test_failed_command_keeps_last_value() {
        let mut failing = label(60_000, &["false"]);
        failing.result = "previous".to_string();
        let mut defs = BTreeMap::new();
        defs.insert("flaky".to_string(), failing);
        let labels = DynamicLabels::new("pg1", defs, &CancellationToken::new()).unwrap();

        labels.sync().await;
        assert_eq!(labels.get()["flaky"].result, "previous");
    }

    #[test]
    fn test_invalid_definitions_rejected() {
        let mut defs = BTreeMap::new();
        defs.insert("empty".to_string(), label(1_000, &[]));
        let err = DynamicLabels::new("pg1", defs, &CancellationToken::new()).err().unwrap();
        assert!(err.is_bad_parameter());

        let mut defs = BTreeMap::new();
        defs.insert("zero".to_string(), label(0, &["echo"]));
        assert!(DynamicLabels::new("pg1", defs, &CancellationToken::new()).is_err());
    }

    #[tokio::test]
    async fn test_refresh_tasks_stop_on_close() {
        let mut defs = BTreeMap::new();
        defs.insert("a".to_string(), label(10, &["echo", "a"]));
        defs.insert("b".to_string(), label(10, &["echo", "b"]));
        let labels = DynamicLabels::new("pg1", defs, &CancellationToken::new()).unwrap();

        labels.start();
        labels.start();
        assert_eq!(labels.running_tasks(), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(labels.get()["a"].result, "a");

        labels.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(labels.running_tasks(), 0);
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_refresh() {
        let parent = CancellationToken::new();
        let mut defs = BTreeMap::new();
        defs.insert("a".to_string(), label(10, &["echo", "a"]));
        let labels = DynamicLabels::new("pg1", defs, &parent).unwrap();

        labels.start();
        parent.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(labels.running_tasks(), 0);
    }
}
