//! The relay's memory of what each pod looked like on the backend.
//!
//! Every operation takes the one lock for a constant amount of work per entry.
//! Disk writes for the optional on-disk copy happen after the lock is released,
//! serialized by a second lock that is always taken first.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_api::PodStatus;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a deleted UID is remembered.
pub const TOMBSTONE_TTL: Duration = Duration::from_secs(60 * 60);
/// How often expired tombstones are swept.
pub const TOMBSTONE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const CACHE_DIR: &str = ".cache";

#[derive(Default)]
struct Inner {
    entries: HashMap<String, PodStatus>,
    deleted: HashMap<String, DateTime<Utc>>,
}

/// Last known backend status per pod UID, plus tombstones for recently
/// deleted UIDs.
#[derive(Default)]
pub struct StatusCache {
    inner: Mutex<Inner>,
    persist_dir: Option<PathBuf>,
    files: Mutex<()>,
}

impl StatusCache {
    /// An empty, memory-only cache.
    pub fn new() -> Self {
        Default::default()
    }

    /// Open the cache kept under `<data_root>/.cache`, restoring whatever a
    /// previous run left there.
    ///
    /// Files that cannot be read or parsed are logged and skipped.
    pub fn load(data_root: &Path) -> anyhow::Result<Self> {
        let dir = data_root.join(CACHE_DIR);
        std::fs::create_dir_all(&dir)?;

        let mut entries = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let status = std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| Ok(serde_yaml::from_str::<PodStatus>(&raw)?));
            match status {
                Ok(status) if !status.pod_uid.is_empty() => {
                    entries.insert(status.pod_uid.clone(), status);
                }
                Ok(_) => warn!(path = %path.display(), "Cached status has no UID, skipping"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unable to load cached status")
                }
            }
        }
        info!(count = entries.len(), dir = %dir.display(), "Loaded status cache");

        Ok(StatusCache {
            inner: Mutex::new(Inner {
                entries,
                deleted: HashMap::new(),
            }),
            persist_dir: Some(dir),
            files: Mutex::new(()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The cached status for `uid`.
    pub fn get(&self, uid: &str) -> Option<PodStatus> {
        self.lock().entries.get(uid).cloned()
    }

    /// Whether `uid` has a cached status.
    pub fn contains(&self, uid: &str) -> bool {
        self.lock().entries.contains_key(uid)
    }

    /// Upsert `statuses`, last write wins. Entries for tombstoned UIDs are
    /// dropped. Returns how many entries were stored.
    pub fn put(&self, statuses: Vec<PodStatus>) -> usize {
        let mut stored = Vec::with_capacity(statuses.len());
        {
            let mut inner = self.lock();
            for status in statuses {
                if inner.deleted.contains_key(&status.pod_uid) {
                    debug!(uid = %status.pod_uid, "Ignoring status of a deleted pod");
                    continue;
                }
                stored.push(status.pod_uid.clone());
                inner.entries.insert(status.pod_uid.clone(), status);
            }
        }
        for uid in &stored {
            self.write_through(uid);
        }
        stored.len()
    }

    /// Forget `uid`. Returns the entry if there was one.
    pub fn evict(&self, uid: &str) -> Option<PodStatus> {
        let removed = self.lock().entries.remove(uid);
        self.remove_file(uid);
        removed
    }

    /// Forget `uid` and refuse to cache it again until the tombstone expires.
    pub fn evict_deleted(&self, uid: &str) -> Option<PodStatus> {
        let removed = {
            let mut inner = self.lock();
            inner.deleted.insert(uid.to_string(), Utc::now());
            inner.entries.remove(uid)
        };
        self.remove_file(uid);
        removed
    }

    /// Whether `uid` was deleted recently.
    pub fn is_deleted(&self, uid: &str) -> bool {
        self.lock().deleted.contains_key(uid)
    }

    /// Drop tombstones older than `max_age`. Returns how many were dropped.
    pub fn prune_deleted(&self, max_age: Duration) -> usize {
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::max_value());
        let now = Utc::now();
        let mut inner = self.lock();
        let before = inner.deleted.len();
        inner.deleted.retain(|_, at| now.signed_duration_since(*at) < max_age);
        before - inner.deleted.len()
    }

    /// Every cached entry.
    pub fn snapshot(&self) -> Vec<PodStatus> {
        self.lock().entries.values().cloned().collect()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Writes whatever is cached for `uid` at the time the file lock is held,
    // so a delete or a newer put that ran in between is never overwritten.
    fn write_through(&self, uid: &str) {
        let dir = match &self.persist_dir {
            Some(dir) => dir,
            None => return,
        };
        let _files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        let status = match self.get(uid) {
            Some(status) => status,
            None => {
                debug!(uid, "Status evicted before it was persisted");
                return;
            }
        };
        let path = dir.join(format!("{}.yaml", uid));
        let result = serde_yaml::to_string(&status)
            .map_err(anyhow::Error::from)
            .and_then(|raw| Ok(std::fs::write(&path, raw)?));
        if let Err(e) = result {
            warn!(uid, error = %e, "Unable to persist status");
        }
    }

    fn remove_file(&self, uid: &str) {
        if let Some(dir) = &self.persist_dir {
            let _files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
            let path = dir.join(format!("{}.yaml", uid));
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(uid, error = %e, "Unable to remove persisted status");
                }
            }
        }
    }
}

/// Periodically drop expired tombstones until `shutdown` is cancelled.
pub async fn sweep_tombstones(cache: Arc<StatusCache>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(TOMBSTONE_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let pruned = cache.prune_deleted(TOMBSTONE_TTL);
                if pruned > 0 {
                    debug!(pruned, "Dropped expired tombstones");
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn status(uid: &str, jid: &str) -> PodStatus {
        PodStatus {
            pod_name: format!("pod-{}", uid),
            pod_uid: uid.to_string(),
            pod_namespace: "default".to_string(),
            job_id: jid.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn put_is_last_write_wins() {
        let cache = StatusCache::new();
        cache.put(vec![status("u1", "1")]);
        cache.put(vec![status("u1", "2")]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("u1").unwrap().job_id, "2");
    }

    #[test]
    fn evict_is_idempotent() {
        let cache = StatusCache::new();
        cache.put(vec![status("u1", "1")]);
        assert!(cache.evict("u1").is_some());
        assert!(cache.evict("u1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn deleted_uids_are_not_resurrected() {
        let cache = StatusCache::new();
        cache.put(vec![status("u1", "1")]);
        cache.evict_deleted("u1");
        assert_eq!(cache.put(vec![status("u1", "1"), status("u2", "2")]), 1);
        assert!(!cache.contains("u1"));
        assert!(cache.contains("u2"));
        assert!(cache.is_deleted("u1"));
    }

    #[test]
    fn prune_drops_only_expired_tombstones() {
        let cache = StatusCache::new();
        cache.evict_deleted("u1");
        assert_eq!(cache.prune_deleted(TOMBSTONE_TTL), 0);
        assert_eq!(cache.prune_deleted(Duration::from_secs(0)), 1);
        assert!(!cache.is_deleted("u1"));
    }

    #[test]
    fn persisted_entries_survive_a_reload() {
        let root = tempfile::tempdir().unwrap();
        {
            let cache = StatusCache::load(root.path()).unwrap();
            cache.put(vec![status("u1", "1"), status("u2", "2")]);
            cache.evict("u2");
        }
        let reloaded = StatusCache::load(root.path()).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("u1").unwrap().job_id, "1");
    }

    #[test]
    fn late_writes_do_not_outlive_a_delete() {
        let root = tempfile::tempdir().unwrap();
        {
            let cache = StatusCache::load(root.path()).unwrap();
            cache.lock().entries.insert("u1".to_string(), status("u1", "1"));
            // A put that lost the race with the delete writes after it.
            cache.evict_deleted("u1");
            cache.write_through("u1");
        }
        assert!(!root.path().join(CACHE_DIR).join("u1.yaml").exists());
        let reloaded = StatusCache::load(root.path()).unwrap();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn late_writes_persist_the_newest_status() {
        let root = tempfile::tempdir().unwrap();
        {
            let cache = StatusCache::load(root.path()).unwrap();
            cache.put(vec![status("u1", "1")]);
            cache.lock().entries.insert("u1".to_string(), status("u1", "2"));
            cache.write_through("u1");
        }
        let reloaded = StatusCache::load(root.path()).unwrap();
        assert_eq!(reloaded.get("u1").unwrap().job_id, "2");
    }

    #[test]
    fn unparseable_files_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join(CACHE_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("broken.yaml"), "{ not yaml").unwrap();
        let cache = StatusCache::load(root.path()).unwrap();
        assert!(cache.is_empty());
    }
}
