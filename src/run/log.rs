//! Human-readable run logs written by an event subscriber.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, RwLock};

use super::{ProbeResult, RunEvent};
use crate::catalog::TestType;

/// One log file per run: `<dir>/<test_type>_<unix_ms>_<run_id>.log`.
#[derive(Debug)]
pub struct RunLogs {
    dir: PathBuf,
    current: RwLock<HashMap<TestType, PathBuf>>,
}

impl RunLogs {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            current: RwLock::new(HashMap::new()),
        }
    }

    /// Path of the log a new run of `test_type` writes to. Events outside a run use id 0.
    async fn rotate(&self, test_type: TestType, run_id: Option<u64>) -> PathBuf {
        let path = self.dir.join(format!(
            "{}_{}_{}.log",
            test_type.as_str(),
            Utc::now().timestamp_millis(),
            run_id.unwrap_or_default()
        ));
        self.current.write().await.insert(test_type, path.clone());
        path
    }

    async fn current_or_rotate(&self, test_type: TestType, run_id: Option<u64>) -> PathBuf {
        if let Some(path) = self.current.read().await.get(&test_type) {
            return path.clone();
        }
        self.rotate(test_type, run_id).await
    }

    async fn append(&self, event: &RunEvent) -> io::Result<()> {
        let path = match event {
            RunEvent::Started { .. } => self.rotate(event.test_type(), event.run_id()).await,
            _ => self.current_or_rotate(event.test_type(), event.run_id()).await,
        };

        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
        let mut text = String::new();
        for line in describe(event) {
            text.push_str(&format!("[{}] {}\n", stamp, line));
        }
        file.write_all(text.as_bytes()).await?;
        file.flush().await
    }

    /// Contents of the most recent log for a test type.
    pub async fn read(&self, test_type: TestType) -> io::Result<String> {
        let known = self.current.read().await.get(&test_type).cloned();
        let path = match known {
            Some(path) => path,
            None => self.newest_on_disk(test_type)?,
        };
        tokio::fs::read_to_string(path).await
    }

    /// Newest log left over from an earlier process.
    fn newest_on_disk(&self, test_type: TestType) -> io::Result<PathBuf> {
        let prefix = format!("{}_", test_type.as_str());
        std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(&prefix) && n.ends_with(".log"))
            .max_by_key(|n| log_order(&n[prefix.len()..n.len() - 4]))
            .map(|n| self.dir.join(n))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no log for {} test", test_type),
                )
            })
    }
}

/// Sort key of a log file stem such as `1700000000123_4`.
fn log_order(stem: &str) -> (i64, u64) {
    let (millis, run_id) = stem.split_once('_').unwrap_or((stem, "0"));
    (
        millis.parse().unwrap_or_default(),
        run_id.parse().unwrap_or_default(),
    )
}

/// Write every event from `rx` to the run logs until the channel closes.
pub fn spawn_run_log_writer(
    mut rx: broadcast::Receiver<RunEvent>,
    logs: Arc<RunLogs>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = logs.append(&event).await {
                        tracing::error!("Failed to write run log: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Run log writer lagged, {} events not logged", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn result_line(result: &ProbeResult) -> String {
    let metrics: Vec<String> = result
        .metrics
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{}={}", k, s),
            other => format!("{}={}", k, other),
        })
        .collect();
    format!(
        "{} ({}) hop {}: {} {}",
        result.label,
        result.address,
        result.hop_count,
        result.status.as_str(),
        metrics.join(" ")
    )
    .trim_end()
    .to_string()
}

/// Log lines for one event.
pub fn describe(event: &RunEvent) -> Vec<String> {
    match event {
        RunEvent::Started {
            test_type,
            run_id,
            total,
            parameters,
            topology_known,
            ..
        } => {
            let mut line = format!(
                "Starting {} (run {}) on {} devices, timeout {}s",
                test_type.display_name(),
                run_id,
                total,
                parameters.timeout_secs
            );
            if *test_type == TestType::Ping {
                line.push_str(&format!(", {} packets", parameters.packet_count));
            }
            if !topology_known {
                line.push_str(", topology unavailable");
            }
            vec![line]
        }
        RunEvent::Progress {
            current,
            total,
            result,
            ..
        } => vec![format!("[{}/{}] {}", current, total, result_line(result))],
        RunEvent::Paused { progress, .. } => {
            vec![format!("Paused at {}/{}", progress.current, progress.total)]
        }
        RunEvent::Resumed { progress, .. } => {
            vec![format!("Resumed at {}/{}", progress.current, progress.total)]
        }
        RunEvent::Stopped(o) | RunEvent::Completed(o) | RunEvent::Error(o) => {
            let mut lines = vec![match &o.error {
                Some(error) => format!("Test failed: {}", error),
                None => format!("Test {}", event.name()),
            }];
            if !o.results.is_empty() {
                lines.push(o.summary_text.clone());
            }
            lines.extend(o.reports.iter().map(|r| format!("Report saved: {}", r.path.display())));
            lines
        }
        RunEvent::DeviceRetestResult { result, summary_text, .. } => {
            let mut lines = vec![format!("Retest {}", result_line(result))];
            lines.extend(summary_text.clone());
            lines
        }
        RunEvent::DeviceRetestError { address, message, .. } => {
            vec![format!("Retest of {} failed: {}", address, message)]
        }
        RunEvent::ReportRegenerated { reports, .. } => reports
            .iter()
            .map(|r| format!("Report regenerated: {}", r.path.display()))
            .collect(),
    }
}
