//! Local file-system watcher.
//!
//! Raw notifications arrive on notify's own thread and are forwarded into a
//! tokio task that filters exclusions, debounces per path, and hands every
//! accepted event to a short-lived task. That task subscribes newly created
//! directories before the event is queued, so nothing below them is missed.
//!
//! The outgoing queue is small and keeps the most recent events: when it is
//! full the oldest pending event is dropped.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Notify, mpsc};

use super::debounce::Debouncer;
use super::exclude::Exclude;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Create,
    Write,
    Remove,
    /// Either side of a rename. Old and new paths are reported separately.
    Rename,
    Chmod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
}

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Minimum time between two delivered events for the same path.
    pub min_interval: Duration,
    /// Capacity of the outgoing event queue.
    pub capacity: usize,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            capacity: 2,
        }
    }
}

pub struct LocalWatcher {
    shared: Arc<Shared>,
}

struct Shared {
    watcher: Mutex<Option<RecommendedWatcher>>,
    watched: Mutex<HashSet<PathBuf>>,
    exclude: RwLock<Exclude>,
    debouncer: Debouncer,
    queue: EventQueue,
}

impl LocalWatcher {
    /// Create a watcher with nothing subscribed yet. Must be called inside a
    /// tokio runtime.
    pub fn new(options: WatcherOptions) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                // Receiver is gone only after close().
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        let shared = Arc::new(Shared {
            watcher: Mutex::new(Some(watcher)),
            watched: Mutex::new(HashSet::new()),
            exclude: RwLock::new(Exclude::default()),
            debouncer: Debouncer::new(options.min_interval),
            queue: EventQueue::new(options.capacity),
        });

        tokio::spawn(dispatch_loop(shared.clone(), raw_rx));

        tracing::debug!(
            min_interval_ms = options.min_interval.as_millis() as u64,
            capacity = options.capacity,
            "local watcher created"
        );
        Ok(Self { shared })
    }

    /// Subscribe `root` and every directory below it. Excluded directories
    /// and symlinks are skipped. Returns the number of new subscriptions.
    pub fn add_all(&self, root: &Path) -> Result<usize> {
        self.shared.add_all(root)
    }

    /// Drop the subscriptions of `root` and every directory below it. The
    /// dispatch task does this on its own for directories that vanish.
    #[cfg(test)]
    pub fn remove_all(&self, root: &Path) -> usize {
        self.shared.remove_all(root)
    }

    pub fn add_exclude_patterns(&self, patterns: impl IntoIterator<Item = String>) {
        write_lock(&self.shared.exclude).add_patterns(patterns);
    }

    pub fn add_exclude_files(&self, paths: impl IntoIterator<Item = PathBuf>) {
        write_lock(&self.shared.exclude).add_paths(paths);
    }

    /// Next debounced event, or `None` once the watcher is closed.
    pub async fn recv(&self) -> Option<WatchEvent> {
        self.shared.queue.recv().await
    }

    /// Stop the OS subscription. Safe to call more than once.
    pub fn close(&self) {
        if self.shared.queue.close() {
            // Dropping the notify watcher also ends the dispatch loop.
            lock(&self.shared.watcher).take();
            lock(&self.shared.watched).clear();
            tracing::debug!("local watcher closed");
        }
    }
}

impl Drop for LocalWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn add_all(&self, root: &Path) -> Result<usize> {
        let exclude = read_lock(&self.exclude).clone();
        let dirs = sub_directories(root, &exclude)
            .with_context(|| format!("Failed to scan {}", root.display()))?;

        let mut guard = lock(&self.watcher);
        let watcher = guard.as_mut().context("watcher is closed")?;
        let mut watched = lock(&self.watched);

        let mut added = 0;
        for dir in dirs {
            if watched.contains(&dir) {
                continue;
            }
            match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    watched.insert(dir);
                    added += 1;
                }
                Err(e) if dir == root => {
                    return Err(e).with_context(|| format!("Failed to watch {}", root.display()));
                }
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "cannot watch directory");
                }
            }
        }

        tracing::debug!(root = %root.display(), added, "watching directories");
        Ok(added)
    }

    fn remove_all(&self, root: &Path) -> usize {
        let mut guard = lock(&self.watcher);
        let mut watched = lock(&self.watched);

        let targets: Vec<PathBuf> = watched
            .iter()
            .filter(|p| p.starts_with(root))
            .cloned()
            .collect();
        for dir in &targets {
            watched.remove(dir);
            if let Some(w) = guard.as_mut()
                && let Err(e) = w.unwatch(dir)
            {
                tracing::debug!(path = %dir.display(), error = %e, "unwatch failed");
            }
        }
        targets.len()
    }

    fn dispatch(self: &Arc<Self>, path: PathBuf, kind: WatchEventKind) {
        if read_lock(&self.exclude).is_match(&path) {
            tracing::trace!(path = %path.display(), "excluded");
            return;
        }

        let Some(permit) = self.debouncer.try_acquire(&path) else {
            tracing::trace!(path = %path.display(), ?kind, "debounced");
            return;
        };

        let shared = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            shared.handle(path, kind).await;
        });
    }

    async fn handle(self: Arc<Self>, path: PathBuf, kind: WatchEventKind) {
        let meta = tokio::fs::symlink_metadata(&path).await;
        match (&meta, kind) {
            (Ok(m), WatchEventKind::Create | WatchEventKind::Rename) if m.is_dir() => {
                let shared = self.clone();
                let dir = path.clone();
                match tokio::task::spawn_blocking(move || shared.add_all(&dir)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(path = %path.display(), error = %e, "cannot watch new directory");
                    }
                    Err(e) => tracing::error!(error = %e, "watch task failed"),
                }
            }
            // A directory moved away keeps its OS watch under the old name.
            (Err(_), WatchEventKind::Remove | WatchEventKind::Rename) => {
                let shared = self.clone();
                let gone = path.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || shared.remove_all(&gone)).await {
                    tracing::error!(error = %e, "unwatch task failed");
                }
            }
            _ => {}
        }

        tracing::debug!(path = %path.display(), ?kind, "local change");
        self.queue.push(WatchEvent { path, kind });
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
) {
    while let Some(res) = raw_rx.recv().await {
        match res {
            Ok(event) => {
                for (path, kind) in classify(&event) {
                    shared.dispatch(path, kind);
                }
            }
            Err(e) => tracing::error!(error = %e, "local watcher error"),
        }
    }
    tracing::trace!("watcher dispatch loop finished");
}

/// Map a raw notification onto zero or more typed events.
fn classify(event: &notify::Event) -> Vec<(PathBuf, WatchEventKind)> {
    let kind = match event.kind {
        EventKind::Create(_) => WatchEventKind::Create,
        EventKind::Remove(_) => WatchEventKind::Remove,
        EventKind::Modify(ModifyKind::Metadata(_)) => WatchEventKind::Chmod,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // [from, to]: the separate From/To notifications cover the old path.
            return event
                .paths
                .last()
                .map(|p| vec![(p.clone(), WatchEventKind::Rename)])
                .unwrap_or_default();
        }
        EventKind::Modify(ModifyKind::Name(_)) => WatchEventKind::Rename,
        EventKind::Modify(_) => WatchEventKind::Write,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };
    event.paths.iter().map(|p| (p.clone(), kind)).collect()
}

/// `root` followed by every directory below it, skipping symlinks and
/// excluded directories. Directories that vanish mid-walk are skipped.
fn sub_directories(root: &Path, exclude: &Exclude) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = vec![root.to_path_buf()];
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if dir == root => return Err(e),
            Err(e) => {
                tracing::debug!(path = %dir.display(), error = %e, "skipping unreadable directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let path = entry.path();
            if is_dir && !exclude.is_match(&path) {
                dirs.push(path.clone());
                pending.push(path);
            }
        }
    }
    Ok(dirs)
}

/// Bounded queue that drops the oldest pending event when full.
struct EventQueue {
    events: Mutex<VecDeque<WatchEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl EventQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, event: WatchEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut events = lock(&self.events);
            while events.len() >= self.capacity {
                if let Some(dropped) = events.pop_front() {
                    tracing::trace!(path = %dropped.path.display(), "event queue full, dropping oldest");
                }
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Single consumer.
    async fn recv(&self) -> Option<WatchEvent> {
        loop {
            let next = lock(&self.events).pop_front();
            if next.is_some() {
                return next;
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Returns `true` on the first call only.
    fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            lock(&self.events).clear();
            self.notify.notify_one();
        }
        first
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read_lock<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn ev(path: &str, kind: WatchEventKind) -> WatchEvent {
        WatchEvent {
            path: PathBuf::from(path),
            kind,
        }
    }

    fn test_watcher(root: &Path) -> LocalWatcher {
        let w = LocalWatcher::new(WatcherOptions {
            min_interval: Duration::from_secs(1),
            capacity: 64,
        })
        .unwrap();
        w.add_all(root).unwrap();
        w
    }

    /// Receive until an event for `path` shows up, returning everything seen.
    async fn wait_for(w: &LocalWatcher, path: &Path) -> Vec<WatchEvent> {
        let mut seen = Vec::new();
        tokio::time::timeout(TIMEOUT, async {
            while let Some(e) = w.recv().await {
                let done = e.path == path;
                seen.push(e);
                if done {
                    break;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no event for {} (saw {seen:?})", path.display()));
        seen
    }

    fn scratch() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    #[tokio::test]
    async fn queue_keeps_most_recent_events() {
        let q = EventQueue::new(2);
        q.push(ev("/a", WatchEventKind::Write));
        q.push(ev("/b", WatchEventKind::Write));
        q.push(ev("/c", WatchEventKind::Write));

        assert_eq!(q.recv().await.unwrap().path, PathBuf::from("/b"));
        assert_eq!(q.recv().await.unwrap().path, PathBuf::from("/c"));

        assert!(q.close());
        assert!(!q.close());
        assert!(q.recv().await.is_none());
        q.push(ev("/d", WatchEventKind::Write));
        assert!(q.recv().await.is_none());
    }

    #[tokio::test]
    async fn queue_wakes_waiting_consumer() {
        let q = Arc::new(EventQueue::new(1));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.recv().await })
        };
        tokio::task::yield_now().await;
        q.push(ev("/late", WatchEventKind::Create));
        let got = tokio::time::timeout(TIMEOUT, consumer).await.unwrap().unwrap();
        assert_eq!(got, Some(ev("/late", WatchEventKind::Create)));
    }

    #[test]
    fn classify_maps_kinds() {
        let create = notify::Event::new(EventKind::Create(CreateKind::File)).add_path("/x".into());
        assert_eq!(classify(&create), vec![(PathBuf::from("/x"), WatchEventKind::Create)]);

        let write = notify::Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path("/x".into());
        assert_eq!(classify(&write), vec![(PathBuf::from("/x"), WatchEventKind::Write)]);

        let chmod = notify::Event::new(EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Permissions,
        )))
        .add_path("/x".into());
        assert_eq!(classify(&chmod), vec![(PathBuf::from("/x"), WatchEventKind::Chmod)]);

        let both = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path("/old".into())
            .add_path("/new".into());
        assert_eq!(classify(&both), vec![(PathBuf::from("/new"), WatchEventKind::Rename)]);

        let from = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path("/old".into());
        assert_eq!(classify(&from), vec![(PathBuf::from("/old"), WatchEventKind::Rename)]);

        let access = notify::Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path("/x".into());
        assert!(classify(&access).is_empty());
    }

    #[test]
    fn sub_directories_skips_excluded() {
        let (_dir, root) = scratch();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/x")).unwrap();
        std::fs::write(root.join("a/file.txt"), b"x").unwrap();

        let ex = Exclude::new(&["node_modules".into()], &[]);
        let mut dirs = sub_directories(&root, &ex).unwrap();
        dirs.sort();
        assert_eq!(dirs, vec![root.clone(), root.join("a"), root.join("a/b")]);
    }

    #[tokio::test]
    async fn reports_created_file() {
        let (_dir, root) = scratch();
        let w = test_watcher(&root);

        let file = root.join("test");
        std::fs::write(&file, b"LOL").unwrap();

        let seen = wait_for(&w, &file).await;
        assert_eq!(seen.last().unwrap().kind, WatchEventKind::Create);
    }

    #[tokio::test]
    async fn new_directory_is_watched_before_delivery() {
        let (_dir, root) = scratch();
        let w = test_watcher(&root);

        let level2 = root.join("level2");
        std::fs::create_dir(&level2).unwrap();
        wait_for(&w, &level2).await;

        let nested = level2.join("test");
        std::fs::write(&nested, b"x").unwrap();
        wait_for(&w, &nested).await;
    }

    #[tokio::test]
    async fn moved_away_directory_is_unwatched() {
        let (_dir, root) = scratch();
        let (_elsewhere, outside) = scratch();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        let w = test_watcher(&root);
        assert!(lock(&w.shared.watched).contains(&root.join("a/b")));

        std::fs::rename(root.join("a"), outside.join("a")).unwrap();
        wait_for(&w, &root.join("a")).await;

        let watched = lock(&w.shared.watched);
        assert!(!watched.contains(&root.join("a")));
        assert!(!watched.contains(&root.join("a/b")));
        assert!(watched.contains(&root));
    }

    #[tokio::test]
    async fn excluded_paths_are_silent() {
        let (_dir, root) = scratch();
        let skipped = root.join("skipped");
        std::fs::create_dir(&skipped).unwrap();

        let w = LocalWatcher::new(WatcherOptions {
            min_interval: Duration::from_secs(1),
            capacity: 64,
        })
        .unwrap();
        w.add_exclude_patterns(["*.tmp".to_string()]);
        w.add_exclude_files([skipped.clone()]);
        w.add_all(&root).unwrap();

        std::fs::write(root.join("scratch.tmp"), b"x").unwrap();
        std::fs::write(skipped.join("inner.txt"), b"x").unwrap();
        let marker = root.join("marker.txt");
        std::fs::write(&marker, b"x").unwrap();

        let seen = wait_for(&w, &marker).await;
        assert!(
            seen.iter()
                .all(|e| e.path == marker || e.path == root),
            "unexpected events: {seen:?}"
        );
    }

    #[tokio::test]
    async fn rapid_writes_fire_once_per_window() {
        let (_dir, root) = scratch();
        let file = root.join("burst.txt");
        std::fs::write(&file, b"0").unwrap();
        let w = test_watcher(&root);

        for i in 0..5 {
            std::fs::write(&file, format!("{i}")).unwrap();
        }
        wait_for(&w, &file).await;

        let again = tokio::time::timeout(Duration::from_millis(500), async {
            loop {
                match w.recv().await {
                    Some(e) if e.path == file => return Some(e),
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await;
        assert!(again.is_err(), "second event inside the window: {again:?}");
    }

    #[tokio::test]
    async fn remove_all_and_close() {
        let (_dir, root) = scratch();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        let w = test_watcher(&root);

        assert_eq!(w.remove_all(&root.join("a")), 2);
        assert_eq!(w.add_all(&root).unwrap(), 2);

        w.close();
        w.close();
        assert!(w.recv().await.is_none());
        assert!(w.add_all(&root).is_err());
    }
}
