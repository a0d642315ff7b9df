//! Job queue boundary.
//!
//! Tasks arrive as jobs that are reserved, worked on and then deleted; results
//! are put back as new tasks. [`SpoolQueue`] implements this over two
//! directories of JSON files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pricewatch_models::Task;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const RESERVED_DIR: &str = ".reserved";
const FAILED_DIR: &str = ".failed";
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A reserved task.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub task: Task,
    /// The job body as received.
    pub raw: String,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Wait up to `timeout` for a job. `None` means the queue stayed empty.
    async fn reserve(&self, timeout: Duration) -> Result<Option<Job>>;
    async fn delete(&self, job: &Job) -> Result<()>;
    async fn put(&self, task: &Task) -> Result<()>;
}

/// Directory-backed queue.
///
/// Jobs are `*.json` task files in `inbox`, taken in file-name order. A
/// reserved job is moved to `inbox/.reserved/` until deleted; bodies that are
/// not valid tasks go to `inbox/.failed/`. Reports are written to `outbox`.
#[derive(Debug, Clone)]
pub struct SpoolQueue {
    inbox: PathBuf,
    outbox: PathBuf,
}

impl SpoolQueue {
    /// Create the spool directories and requeue jobs left reserved by a
    /// previous run.
    pub async fn open(inbox: impl Into<PathBuf>, outbox: impl Into<PathBuf>) -> Result<Self> {
        let queue = Self {
            inbox: inbox.into(),
            outbox: outbox.into(),
        };
        for dir in [queue.reserved_dir(), queue.failed_dir(), queue.outbox.clone()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create spool directory {:?}", dir))?;
        }

        let stale = list_jobs(&queue.reserved_dir()).await?;
        for name in &stale {
            tokio::fs::rename(queue.reserved_dir().join(name), queue.inbox.join(name))
                .await
                .with_context(|| format!("Failed to requeue job {}", name))?;
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "requeued jobs left reserved");
        }
        Ok(queue)
    }

    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    fn reserved_dir(&self) -> PathBuf {
        self.inbox.join(RESERVED_DIR)
    }

    fn failed_dir(&self) -> PathBuf {
        self.inbox.join(FAILED_DIR)
    }

    /// Move the first waiting job into the reserved area and decode it.
    async fn try_reserve(&self) -> Result<Option<Job>> {
        for name in list_jobs(&self.inbox).await? {
            let reserved = self.reserved_dir().join(&name);
            match tokio::fs::rename(self.inbox.join(&name), &reserved).await {
                Ok(()) => {}
                // Taken by another consumer in the meantime.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("Failed to reserve job {}", name));
                }
            }

            let raw = tokio::fs::read_to_string(&reserved)
                .await
                .with_context(|| format!("Failed to read job {}", name))?;
            match serde_json::from_str::<Task>(&raw) {
                Ok(task) => {
                    info!(job = %name, task = %task.id, count = task.payloads.len(), "job reserved");
                    return Ok(Some(Job {
                        id: name,
                        task,
                        raw,
                    }));
                }
                Err(err) => {
                    warn!(job = %name, error = %err, "job is not a valid task");
                    tokio::fs::rename(&reserved, self.failed_dir().join(&name))
                        .await
                        .with_context(|| format!("Failed to set aside job {}", name))?;
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl JobQueue for SpoolQueue {
    async fn reserve(&self, timeout: Duration) -> Result<Option<Job>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = self.try_reserve().await? {
                return Ok(Some(job));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn delete(&self, job: &Job) -> Result<()> {
        tokio::fs::remove_file(self.reserved_dir().join(&job.id))
            .await
            .with_context(|| format!("Failed to delete job {}", job.id))?;
        debug!(job = %job.id, "job deleted");
        Ok(())
    }

    async fn put(&self, task: &Task) -> Result<()> {
        let data = serde_json::to_vec(task)?;
        let name = format!("{}-{}.json", file_stem(&task.id), uuid::Uuid::new_v4());
        let staging = self.outbox.join(format!(".{}.tmp", name));
        tokio::fs::write(&staging, &data)
            .await
            .with_context(|| format!("Failed to write report {:?}", staging))?;
        tokio::fs::rename(&staging, self.outbox.join(&name))
            .await
            .with_context(|| format!("Failed to publish report {}", name))?;
        debug!(task = %task.id, file = %name, "report queued");
        Ok(())
    }
}

/// A task id made safe for use in a file name.
///
/// Path separators and other characters outside `[A-Za-z0-9._-]` become `_`,
/// and leading dots are dropped so the file stays visible.
pub fn file_stem(task_id: &str) -> String {
    let stem: String = task_id
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect();
    match stem.trim_start_matches('.') {
        "" => "task".to_string(),
        stem => stem.to_string(),
    }
}

/// Names of visible `*.json` files in `dir`, sorted.
async fn list_jobs(dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to list {:?}", dir))?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        if entry.file_type().await?.is_file() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
