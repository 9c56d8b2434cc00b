//! Crash-recovery tracking of containers this process created.
//!
//! The tracking file is a JSON array of [`TrackedContainer`], rewritten in
//! full on every mutation through a temp file and rename. A heartbeat file
//! next to it tells a later process whether the writer is still alive.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// File holding the tracked container set.
pub const TRACKING_FILE: &str = "containers.json";

/// File holding the liveness heartbeat.
pub const HEARTBEAT_FILE: &str = "heartbeat";

/// A heartbeat older than this means its writer is presumed dead.
pub const HEARTBEAT_STALE_AFTER: Duration = Duration::from_secs(30);

/// A container created by this tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedContainer {
    pub container_id: String,
    pub workstream_id: String,
    pub branch_name: String,
    pub repo_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Contents of the heartbeat file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub pid: u32,
    pub unix_timestamp: i64,
}

impl Heartbeat {
    fn render(&self) -> String {
        format!("{}\n{}\n", self.pid, self.unix_timestamp)
    }

    fn parse(content: &str) -> Option<Self> {
        let mut lines = content.lines().map(str::trim);
        let pid = lines.next()?.parse().ok()?;
        let unix_timestamp = lines.next()?.parse().ok()?;
        Some(Self {
            pid,
            unix_timestamp,
        })
    }
}

/// Durable registry of tracked containers plus the heartbeat signal.
///
/// Mutations are serialized by one lock per instance. There is no locking
/// across processes; the heartbeat decides which process owns the file.
#[derive(Debug)]
pub struct ContainerTracker {
    dir: PathBuf,
    stale_after: Duration,
    containers: Mutex<BTreeMap<String, TrackedContainer>>,
}

impl ContainerTracker {
    /// Opens the tracker stored in `dir`, loading any existing entries.
    ///
    /// A missing or unreadable tracking file yields an empty set; the file is
    /// a cache and the runtime stays authoritative.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| Error::Persistence {
            path: dir.clone(),
            reason: e.to_string(),
        })?;

        let containers = match Self::load(&dir.join(TRACKING_FILE)) {
            Ok(list) => list
                .into_iter()
                .map(|c| (c.container_id.clone(), c))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, dir = ?dir, "ignoring unreadable tracking file");
                BTreeMap::new()
            }
        };

        Ok(Self {
            dir,
            stale_after: HEARTBEAT_STALE_AFTER,
            containers: Mutex::new(containers),
        })
    }

    /// Overrides the heartbeat staleness threshold.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    fn load(path: &Path) -> Result<Vec<TrackedContainer>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content).map_err(|e| Error::Persistence {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tracking_path(&self) -> PathBuf {
        self.dir.join(TRACKING_FILE)
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.dir.join(HEARTBEAT_FILE)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, TrackedContainer>> {
        self.containers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records a container, replacing any entry with the same ID.
    pub fn track(
        &self,
        container_id: &str,
        workstream_id: &str,
        branch_name: &str,
        repo_path: &Path,
    ) -> Result<()> {
        let mut containers = self.lock();
        containers.insert(
            container_id.to_string(),
            TrackedContainer {
                container_id: container_id.to_string(),
                workstream_id: workstream_id.to_string(),
                branch_name: branch_name.to_string(),
                repo_path: repo_path.to_path_buf(),
                created_at: Utc::now(),
            },
        );
        self.persist(&containers)
    }

    /// Forgets a container.
    pub fn untrack(&self, container_id: &str) -> Result<()> {
        let mut containers = self.lock();
        containers.remove(container_id);
        self.persist(&containers)
    }

    /// Forgets every container.
    pub fn clear(&self) -> Result<()> {
        let mut containers = self.lock();
        containers.clear();
        self.persist(&containers)
    }

    pub fn get(&self, container_id: &str) -> Option<TrackedContainer> {
        self.lock().get(container_id).cloned()
    }

    pub fn list(&self) -> Vec<TrackedContainer> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Writes the full set atomically. Called with the map lock held.
    fn persist(&self, containers: &BTreeMap<String, TrackedContainer>) -> Result<()> {
        let list: Vec<&TrackedContainer> = containers.values().collect();
        let json = serde_json::to_vec_pretty(&list).map_err(|e| self.persist_err(e))?;
        self.write_atomic(&self.tracking_path(), &json)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&self.dir)
            .map_err(|e| self.persist_err(e))?;
        tmp.write_all(bytes).map_err(|e| self.persist_err(e))?;
        tmp.as_file().sync_all().map_err(|e| self.persist_err(e))?;
        tmp.persist(path).map_err(|e| self.persist_err(e.error))?;
        Ok(())
    }

    fn persist_err(&self, e: impl std::fmt::Display) -> Error {
        Error::Persistence {
            path: self.dir.clone(),
            reason: e.to_string(),
        }
    }

    /// Writes the heartbeat for `pid` with the current time.
    pub fn write_heartbeat(&self, pid: u32) -> Result<()> {
        let beat = Heartbeat {
            pid,
            unix_timestamp: Utc::now().timestamp(),
        };
        self.write_atomic(&self.heartbeat_path(), beat.render().as_bytes())
    }

    /// Deletes the heartbeat on clean shutdown.
    pub fn remove_heartbeat(&self) -> Result<()> {
        match std::fs::remove_file(self.heartbeat_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.persist_err(e)),
        }
    }

    /// Reads the heartbeat file, if present and well-formed.
    pub fn read_heartbeat(&self) -> Option<Heartbeat> {
        let content = std::fs::read_to_string(self.heartbeat_path()).ok()?;
        Heartbeat::parse(&content)
    }

    /// True if the heartbeat is missing or older than the threshold.
    pub fn is_heartbeat_stale(&self) -> bool {
        let modified = match std::fs::metadata(self.heartbeat_path()).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return true,
        };
        // A modification time in the future counts as fresh
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age > self.stale_after)
            .unwrap_or(false)
    }

    /// Returns every tracked container if the writing process is presumed
    /// dead, or nothing if its heartbeat is fresh.
    pub fn get_orphaned_containers(&self) -> Vec<TrackedContainer> {
        if self.is_heartbeat_stale() {
            self.list()
        } else {
            Vec::new()
        }
    }
}

/// Background task that keeps the heartbeat fresh.
pub struct HeartbeatTask {
    tracker: Arc<ContainerTracker>,
    handle: JoinHandle<()>,
}

impl HeartbeatTask {
    /// Writes the heartbeat now and then every `interval`.
    pub fn spawn(tracker: Arc<ContainerTracker>, interval: Duration) -> Self {
        let pid = std::process::id();
        let beat_tracker = tracker.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = beat_tracker.write_heartbeat(pid) {
                    tracing::warn!(error = %e, "failed to write heartbeat");
                }
            }
        });
        Self { tracker, handle }
    }

    /// Stops the task and removes the heartbeat file.
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
        if let Err(e) = self.tracker.remove_heartbeat() {
            tracing::warn!(error = %e, "failed to remove heartbeat");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name != TRACKING_FILE && name != HEARTBEAT_FILE)
            .collect()
    }

    #[test]
    fn tracked_entries_survive_reload() {
        let dir = TempDir::new().unwrap();
        let tracker = ContainerTracker::open(dir.path()).unwrap();
        tracker.track("c-a", "ws-1", "feature/a", Path::new("/repo")).unwrap();
        tracker.track("c-b", "ws-2", "feature/b", Path::new("/repo")).unwrap();

        let reloaded = ContainerTracker::open(dir.path()).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("c-a"), tracker.get("c-a"));
        assert_eq!(reloaded.get("c-b"), tracker.get("c-b"));
        assert_eq!(reloaded.get("c-b").unwrap().branch_name, "feature/b");
    }

    #[test]
    fn track_overwrites_same_id() {
        let dir = TempDir::new().unwrap();
        let tracker = ContainerTracker::open(dir.path()).unwrap();
        tracker.track("c", "ws-1", "old", Path::new("/repo")).unwrap();
        tracker.track("c", "ws-1", "new", Path::new("/repo")).unwrap();

        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.get("c").unwrap().branch_name, "new");
    }

    #[test]
    fn untrack_and_clear_persist() {
        let dir = TempDir::new().unwrap();
        let tracker = ContainerTracker::open(dir.path()).unwrap();
        tracker.track("a", "1", "x", Path::new("/repo")).unwrap();
        tracker.track("b", "2", "y", Path::new("/repo")).unwrap();

        tracker.untrack("a").unwrap();
        assert_eq!(ContainerTracker::open(dir.path()).unwrap().len(), 1);

        tracker.clear().unwrap();
        assert!(ContainerTracker::open(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn no_temp_files_remain() {
        let dir = TempDir::new().unwrap();
        let tracker = ContainerTracker::open(dir.path()).unwrap();

        for i in 0..5 {
            tracker
                .track(&format!("c{i}"), "ws", "b", Path::new("/repo"))
                .unwrap();
        }
        tracker.untrack("c0").unwrap();
        tracker.write_heartbeat(1).unwrap();
        tracker.clear().unwrap();

        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn tracking_file_is_a_json_array() {
        let dir = TempDir::new().unwrap();
        let tracker = ContainerTracker::open(dir.path()).unwrap();
        tracker.track("c", "ws", "main", Path::new("/repo")).unwrap();

        let raw = std::fs::read_to_string(tracker.tracking_path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 1);
        assert_eq!(value[0]["container_id"], "c");
    }

    #[test]
    fn corrupt_tracking_file_opens_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(TRACKING_FILE), "{not json").unwrap();

        let tracker = ContainerTracker::open(dir.path()).unwrap();
        assert!(tracker.is_empty());
    }

    #[test]
    fn heartbeat_freshness() {
        let dir = TempDir::new().unwrap();
        let tracker = ContainerTracker::open(dir.path()).unwrap();
        assert!(tracker.is_heartbeat_stale());

        tracker.write_heartbeat(4242).unwrap();
        assert!(!tracker.is_heartbeat_stale());

        let beat = tracker.read_heartbeat().unwrap();
        assert_eq!(beat.pid, 4242);
        assert!(beat.unix_timestamp > 0);

        tracker.remove_heartbeat().unwrap();
        assert!(tracker.is_heartbeat_stale());
        tracker.remove_heartbeat().unwrap();
    }

    #[test]
    fn old_heartbeat_is_stale() {
        let dir = TempDir::new().unwrap();
        let tracker = ContainerTracker::open(dir.path())
            .unwrap()
            .with_stale_after(Duration::from_millis(10));
        tracker.write_heartbeat(1).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(tracker.is_heartbeat_stale());
    }

    #[test]
    fn orphans_only_reported_when_stale() {
        let dir = TempDir::new().unwrap();
        let tracker = ContainerTracker::open(dir.path()).unwrap();
        tracker.track("c", "ws", "main", Path::new("/repo")).unwrap();

        tracker.write_heartbeat(1).unwrap();
        assert!(tracker.get_orphaned_containers().is_empty());

        tracker.remove_heartbeat().unwrap();
        let orphans = tracker.get_orphaned_containers();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].container_id, "c");
    }

    #[tokio::test]
    async fn heartbeat_task_writes_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let tracker = Arc::new(ContainerTracker::open(dir.path()).unwrap());

        let task = HeartbeatTask::spawn(tracker.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!tracker.is_heartbeat_stale());
        assert_eq!(tracker.read_heartbeat().unwrap().pid, std::process::id());

        task.stop().await;
        assert!(tracker.is_heartbeat_stale());
    }
}
