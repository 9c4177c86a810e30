use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, info, warn};
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use crate::config::WatchConfig;
use crate::error::WatchError;
use crate::scan::{self, ScanScope, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    /// Closed after being opened for writing
    Closed,
    /// Renamed or moved into the tree; the path is the destination
    Moved,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
    pub is_directory: bool,
}

impl FileEvent {
    pub fn new(path: PathBuf, kind: FileEventKind) -> Self {
        let is_directory = path.is_dir();
        Self { path, kind, is_directory }
    }

    /// The path to hand to the job when this event means a complete file is in place
    pub fn stable_path(&self) -> Option<&Path> {
        match self.kind {
            FileEventKind::Closed | FileEventKind::Moved if !self.is_directory => Some(&self.path),
            _ => None,
        }
    }
}

/// Translate a platform notification into file events.
///
/// Close-after-write becomes Closed and the destination side of a rename
/// becomes Moved. Creations and content changes are kept for logging only;
/// anything else yields nothing.
pub fn classify_event(event: &notify::Event) -> Vec<FileEvent> {
    let kind = match event.kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => FileEventKind::Closed,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FileEventKind::Moved,
        // inotify follows its To event with a Both event for the same rename
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => return Vec::new(),
        // backends that cannot tell which side of a rename they saw
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            return event
                .paths
                .iter()
                .filter(|p| p.is_file())
                .map(|p| FileEvent::new(p.clone(), FileEventKind::Moved))
                .collect();
        }
        EventKind::Modify(ModifyKind::Name(_)) => return Vec::new(),
        EventKind::Modify(_) => FileEventKind::Modified,
        EventKind::Create(CreateKind::Folder) => {
            return event
                .paths
                .iter()
                .map(|p| FileEvent { path: p.clone(), kind: FileEventKind::Created, is_directory: true })
                .collect();
        }
        EventKind::Create(_) => FileEventKind::Created,
        _ => return Vec::new(),
    };

    event.paths.iter().map(|p| FileEvent::new(p.clone(), kind)).collect()
}

/// How changes under the root are observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStrategy {
    /// Platform notifier, polling if it cannot be started.
    ///
    /// A notifier that starts on a network share (NFS, SMB) stays silent about
    /// writes made by other hosts; such roots need `Poll`.
    Auto,
    Native,
    Poll,
}

#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub root: PathBuf,
    pub recursive: bool,
    /// Replay files already under the root before live events
    pub process_existing: bool,
    pub strategy: WatchStrategy,
    pub poll_interval: Duration,
    pub excluded: Vec<PathBuf>,
}

impl WatchTarget {
    pub fn from_config(cfg: &WatchConfig, root: PathBuf) -> Self {
        Self {
            root,
            recursive: cfg.recursive,
            process_existing: cfg.process_existing,
            strategy: if cfg.force_polling { WatchStrategy::Poll } else { WatchStrategy::Auto },
            poll_interval: cfg.poll_interval(),
            excluded: Vec::new(),
        }
    }

    /// Never report anything under `dir`; only meaningful when `dir` is
    /// inside the root
    pub fn exclude(mut self, dir: &Path) -> Self {
        if dir.starts_with(&self.root) && dir != self.root {
            debug!("Excluding {} from watch", dir.display());
            self.excluded.push(dir.to_path_buf());
        }
        self
    }

    pub fn scope(&self) -> ScanScope<'_> {
        ScanScope {
            root: &self.root,
            recursive: self.recursive,
            excluded: &self.excluded,
        }
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        self.scope().is_excluded(path)
    }
}

/// Snapshot diffing for the poll strategy.
///
/// A file that is new or changed in one scan and unchanged in the next
/// is reported Closed.
#[derive(Debug, Default)]
pub struct PollState {
    previous: Snapshot,
    unsettled: HashSet<PathBuf>,
}

impl PollState {
    /// Start from a snapshot whose files are not reported
    pub fn seeded(snapshot: Snapshot) -> Self {
        Self {
            previous: snapshot,
            unsettled: HashSet::new(),
        }
    }

    pub fn advance(&mut self, current: Snapshot) -> Vec<FileEvent> {
        let mut events = Vec::new();

        for (path, fingerprint) in &current {
            let kind = match self.previous.get(path) {
                None => Some(FileEventKind::Created),
                Some(old) if old != fingerprint => Some(FileEventKind::Modified),
                Some(_) => None,
            };
            match kind {
                Some(kind) => {
                    self.unsettled.insert(path.clone());
                    events.push(FileEvent { path: path.clone(), kind, is_directory: false });
                }
                None if self.unsettled.remove(path) => {
                    events.push(FileEvent {
                        path: path.clone(),
                        kind: FileEventKind::Closed,
                        is_directory: false,
                    });
                }
                None => {}
            }
        }

        self.unsettled.retain(|p| current.contains_key(p));
        self.previous = current;
        events.sort_by(|a, b| a.path.cmp(&b.path));
        events
    }
}

/// FIFO of paths waiting for the job; a path is queued at most once
#[derive(Debug, Default)]
pub struct PendingQueue {
    order: VecDeque<PathBuf>,
    queued: HashSet<PathBuf>,
}

impl PendingQueue {
    /// Returns false when the path was already waiting
    pub fn push(&mut self, path: PathBuf) -> bool {
        if !self.queued.insert(path.clone()) {
            return false;
        }
        self.order.push_back(path);
        true
    }

    pub fn pop(&mut self) -> Option<PathBuf> {
        let path = self.order.pop_front()?;
        self.queued.remove(&path);
        Some(path)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Keeps the event producer alive; dropping it stops the notifier or poll task
enum EventSource {
    Native { _watcher: RecommendedWatcher },
    Poll(JoinHandle<()>),
}

impl Drop for EventSource {
    fn drop(&mut self) {
        if let EventSource::Poll(task) = self {
            task.abort();
        }
    }
}

struct Running {
    path: PathBuf,
    task: JoinHandle<anyhow::Result<()>>,
}

async fn wait_running(running: &mut Option<Running>) -> Result<anyhow::Result<()>, JoinError> {
    match running {
        Some(r) => (&mut r.task).await,
        None => std::future::pending().await,
    }
}

pub struct DirectoryWatcher {
    target: Arc<WatchTarget>,
}

impl DirectoryWatcher {
    pub fn new(target: WatchTarget) -> Result<Self, WatchError> {
        if !target.root.is_dir() {
            return Err(WatchError::NotADirectory(target.root));
        }
        Ok(Self { target: Arc::new(target) })
    }

    /// Dispatch stable files to `handler`, one at a time, until `shutdown`
    /// resolves.
    ///
    /// Handler errors and panics are logged and do not stop the loop. On
    /// shutdown the running handler task is aborted.
    pub async fn run<F, Fut, S>(&self, handler: F, shutdown: S) -> Result<(), WatchError>
    where
        F: Fn(PathBuf) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        S: Future<Output = ()>,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _source = self.subscribe(tx.clone())?;

        if self.target.process_existing {
            for path in scan::existing_files(&self.target.scope()) {
                let _ = tx.send(FileEvent::new(path, FileEventKind::Moved));
            }
        }
        drop(tx);

        tokio::pin!(shutdown);
        let mut pending = PendingQueue::default();
        let mut running: Option<Running> = None;
        let mut events_open = true;

        loop {
            if running.is_none() {
                if let Some(path) = pending.pop() {
                    info!("Processing {} ({} more queued)", path.display(), pending.len());
                    let task = tokio::spawn(handler(path.clone()));
                    running = Some(Running { path, task });
                } else if !events_open {
                    error!("Event source for {} stopped", self.target.root.display());
                    break;
                }
            }

            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    if let Some(Running { path, task }) = running.take() {
                        warn!("Shutting down, aborting work on {}", path.display());
                        task.abort();
                        let _ = task.await;
                    }
                    info!("Stopped watching {}", self.target.root.display());
                    break;
                }

                result = wait_running(&mut running), if running.is_some() => {
                    if let Some(Running { path, .. }) = running.take() {
                        report_finished(&path, result);
                    }
                }

                event = rx.recv(), if events_open => match event {
                    Some(event) => self.accept(event, &mut pending),
                    None => events_open = false,
                },
            }
        }

        Ok(())
    }

    fn accept(&self, event: FileEvent, pending: &mut PendingQueue) {
        if self.target.is_excluded(&event.path) {
            debug!("Ignoring {:?} in excluded directory: {}", event.kind, event.path.display());
            return;
        }
        match event.stable_path() {
            Some(path) => {
                if pending.push(path.to_path_buf()) {
                    debug!("Queued {} after {:?}", path.display(), event.kind);
                } else {
                    debug!("{} is already queued", path.display());
                }
            }
            None => debug!("Ignoring {:?} event for {}", event.kind, event.path.display()),
        }
    }

    fn subscribe(&self, tx: mpsc::UnboundedSender<FileEvent>) -> Result<EventSource, WatchError> {
        match self.target.strategy {
            WatchStrategy::Native => self.start_native(tx).map(|w| EventSource::Native { _watcher: w }),
            WatchStrategy::Poll => Ok(EventSource::Poll(self.start_polling(tx))),
            WatchStrategy::Auto => match self.start_native(tx.clone()) {
                Ok(watcher) => Ok(EventSource::Native { _watcher: watcher }),
                Err(e) => {
                    warn!("{}; falling back to polling every {:?}", e, self.target.poll_interval);
                    Ok(EventSource::Poll(self.start_polling(tx)))
                }
            },
        }
    }

    fn start_native(&self, tx: mpsc::UnboundedSender<FileEvent>) -> Result<RecommendedWatcher, WatchError> {
        let root = &self.target.root;
        let notify_error = |source| WatchError::Notify { path: root.clone(), source };

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                for file_event in classify_event(&event) {
                    let _ = tx.send(file_event);
                }
            }
            Err(e) => warn!("Watch error: {}", e),
        })
        .map_err(notify_error)?;

        let mode = if self.target.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(root, mode).map_err(notify_error)?;

        info!("Watching {} for file system events", root.display());
        Ok(watcher)
    }

    fn start_polling(&self, tx: mpsc::UnboundedSender<FileEvent>) -> JoinHandle<()> {
        let target = Arc::clone(&self.target);
        let mut state = PollState::seeded(scan::snapshot(&target.scope()));
        info!("Polling {} every {:?}", target.root.display(), target.poll_interval);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(target.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let scan_target = Arc::clone(&target);
                let current = match tokio::task::spawn_blocking(move || scan::snapshot(&scan_target.scope())).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!("Poll scan of {} failed: {}", target.root.display(), e);
                        continue;
                    }
                };
                for event in state.advance(current) {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
        })
    }
}

fn report_finished(path: &Path, result: Result<anyhow::Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => debug!("Finished {}", path.display()),
        Ok(Err(e)) => error!("Handling {} failed: {:#}", path.display(), e),
        Err(e) if e.is_panic() => error!("Handler for {} panicked", path.display()),
        Err(e) => warn!("Handler for {} did not complete: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::Fingerprint;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::SystemTime;

    fn poll_target(root: &Path) -> WatchTarget {
        WatchTarget {
            root: root.to_path_buf(),
            recursive: true,
            process_existing: true,
            strategy: WatchStrategy::Poll,
            poll_interval: Duration::from_millis(50),
            excluded: Vec::new(),
        }
    }

    fn native_target(root: &Path) -> WatchTarget {
        WatchTarget {
            strategy: WatchStrategy::Native,
            ..poll_target(root)
        }
    }

    fn recording_handler(
        seen: Arc<Mutex<Vec<PathBuf>>>,
    ) -> impl Fn(PathBuf) -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
        move |path| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(path);
                anyhow::Ok(())
            })
        }
    }

    fn fingerprint(len: u64) -> Fingerprint {
        Fingerprint { len, modified: Some(SystemTime::UNIX_EPOCH) }
    }

    #[test]
    fn test_close_after_write_is_stable() {
        let event = notify::Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write)))
            .add_path(PathBuf::from("/nonexistent/show.mkv"));
        let events = classify_event(&event);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, FileEventKind::Closed);
        assert_eq!(events[0].stable_path(), Some(Path::new("/nonexistent/show.mkv")));
    }

    #[test]
    fn test_create_and_modify_are_not_stable() {
        let created = notify::Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/nonexistent/show.mkv"));
        let modified = notify::Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/nonexistent/show.mkv"));

        for event in [created, modified] {
            let events = classify_event(&event);
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].stable_path(), None);
        }
    }

    #[test]
    fn test_rename_reports_destination_once() {
        let rename = |mode| notify::Event::new(EventKind::Modify(ModifyKind::Name(mode)));
        // the sequence inotify delivers for one rename
        let sequence = [
            rename(RenameMode::From).add_path(PathBuf::from("/nonexistent/show.part")),
            rename(RenameMode::To).add_path(PathBuf::from("/nonexistent/show.mkv")),
            rename(RenameMode::Both)
                .add_path(PathBuf::from("/nonexistent/show.part"))
                .add_path(PathBuf::from("/nonexistent/show.mkv")),
        ];

        let events: Vec<FileEvent> = sequence.iter().flat_map(classify_event).collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, FileEventKind::Moved);
        assert_eq!(events[0].stable_path(), Some(Path::new("/nonexistent/show.mkv")));
    }

    #[test]
    fn test_other_events_are_dropped() {
        let opened = notify::Event::new(EventKind::Access(AccessKind::Open(AccessMode::Any)))
            .add_path(PathBuf::from("/nonexistent/show.mkv"));
        let removed = notify::Event::new(EventKind::Remove(notify::event::RemoveKind::File))
            .add_path(PathBuf::from("/nonexistent/show.mkv"));
        assert!(classify_event(&opened).is_empty());
        assert!(classify_event(&removed).is_empty());
    }

    #[test]
    fn test_directories_are_never_stable() {
        let dir = tempfile::tempdir().unwrap();
        let event = notify::Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write)))
            .add_path(dir.path().to_path_buf());
        let events = classify_event(&event);
        assert!(events[0].is_directory);
        assert_eq!(events[0].stable_path(), None);
    }

    #[test]
    fn test_poll_reports_closed_once_file_settles() {
        let path = PathBuf::from("/watch/show.mkv");
        let mut state = PollState::default();

        let first = state.advance(Snapshot::from([(path.clone(), fingerprint(10))]));
        assert_eq!(first[0].kind, FileEventKind::Created);

        let second = state.advance(Snapshot::from([(path.clone(), fingerprint(20))]));
        assert_eq!(second[0].kind, FileEventKind::Modified);

        let third = state.advance(Snapshot::from([(path.clone(), fingerprint(20))]));
        assert_eq!(third, vec![FileEvent { path: path.clone(), kind: FileEventKind::Closed, is_directory: false }]);

        assert!(state.advance(Snapshot::from([(path, fingerprint(20))])).is_empty());
    }

    #[test]
    fn test_poll_ignores_seeded_and_vanished_files() {
        let old = PathBuf::from("/watch/old.mkv");
        let gone = PathBuf::from("/watch/gone.mkv");
        let mut state = PollState::seeded(Snapshot::from([(old.clone(), fingerprint(1))]));

        let events = state.advance(Snapshot::from([(old.clone(), fingerprint(1)), (gone.clone(), fingerprint(5))]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, gone);

        assert!(state.advance(Snapshot::from([(old.clone(), fingerprint(1))])).is_empty());
        assert!(state.advance(Snapshot::from([(old, fingerprint(1))])).is_empty());
    }

    #[test]
    fn test_queue_coalesces_waiting_paths() {
        let mut queue = PendingQueue::default();
        assert!(queue.push(PathBuf::from("a.mkv")));
        assert!(queue.push(PathBuf::from("b.mkv")));
        assert!(!queue.push(PathBuf::from("a.mkv")));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some(PathBuf::from("a.mkv")));
        // may be queued again once it left the queue
        assert!(queue.push(PathBuf::from("a.mkv")));
        assert_eq!(queue.pop(), Some(PathBuf::from("b.mkv")));
        assert_eq!(queue.pop(), Some(PathBuf::from("a.mkv")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_exclusions_outside_root_are_ignored() {
        let target = poll_target(Path::new("/watch"))
            .exclude(Path::new("/watch/out"))
            .exclude(Path::new("/elsewhere/done"))
            .exclude(Path::new("/watch"));
        assert_eq!(target.excluded, vec![PathBuf::from("/watch/out")]);
        assert!(target.is_excluded(Path::new("/watch/out/show.mkv")));
        assert!(!target.is_excluded(Path::new("/watch/show.mkv")));
    }

    #[test]
    fn test_missing_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = DirectoryWatcher::new(poll_target(&dir.path().join("missing")));
        assert!(matches!(result, Err(WatchError::NotADirectory(_))));
    }

    proptest! {
        #[test]
        fn test_queue_keeps_first_occurrence_order(names in prop::collection::vec("[a-e]", 0..30)) {
            let mut queue = PendingQueue::default();
            for name in &names {
                queue.push(PathBuf::from(name));
            }

            let mut expected: Vec<PathBuf> = Vec::new();
            for name in &names {
                let path = PathBuf::from(name);
                if !expected.contains(&path) {
                    expected.push(path);
                }
            }

            let mut drained = Vec::new();
            while let Some(path) = queue.pop() {
                drained.push(path);
            }
            prop_assert_eq!(drained, expected);
        }
    }

    #[tokio::test]
    async fn test_existing_files_are_dispatched_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("season1")).unwrap();
        let files = vec![
            dir.path().join("a.mkv"),
            dir.path().join("b.mp4"),
            dir.path().join("season1/c.mkv"),
        ];
        for file in &files {
            std::fs::write(file, b"video").unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let watcher = DirectoryWatcher::new(poll_target(dir.path())).unwrap();
        watcher
            .run(recording_handler(seen.clone()), tokio::time::sleep(Duration::from_millis(400)))
            .await
            .unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, files);
    }

    #[tokio::test]
    async fn test_existing_files_skipped_without_replay() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.mkv"), b"video").unwrap();

        let mut target = poll_target(dir.path());
        target.process_existing = false;
        let seen = Arc::new(Mutex::new(Vec::new()));
        DirectoryWatcher::new(target)
            .unwrap()
            .run(recording_handler(seen.clone()), tokio::time::sleep(Duration::from_millis(300)))
            .await
            .unwrap();

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_files_are_dispatched_after_settling() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let watcher = DirectoryWatcher::new(poll_target(dir.path()).exclude(&out)).unwrap();
        let arrived = dir.path().join("new.mkv");

        let writer = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::fs::write(&arrived, b"video").unwrap();
            std::fs::write(out.join("converted.mkv"), b"video").unwrap();
        };
        let (result, ()) = tokio::join!(
            watcher.run(recording_handler(seen.clone()), tokio::time::sleep(Duration::from_millis(800))),
            writer
        );
        result.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![arrived]);
    }

    #[tokio::test]
    async fn test_handler_failures_do_not_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a_panics.mkv", "b_fails.mkv", "c_works.mkv"] {
            std::fs::write(dir.path().join(name), b"video").unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let handler = move |path: PathBuf| {
            let seen = recorder.clone();
            async move {
                let name = path.file_name().unwrap().to_string_lossy().to_string();
                seen.lock().unwrap().push(name.clone());
                match name.as_str() {
                    "a_panics.mkv" => panic!("handler blew up"),
                    "b_fails.mkv" => anyhow::bail!("conversion failed"),
                    _ => anyhow::Ok(()),
                }
            }
        };

        DirectoryWatcher::new(poll_target(dir.path()))
            .unwrap()
            .run(handler, tokio::time::sleep(Duration::from_millis(400)))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a_panics.mkv", "b_fails.mkv", "c_works.mkv"]);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_running_handler() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("slow.mkv"), b"video").unwrap();

        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let handler = move |_path: PathBuf| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                flag.store(true, Ordering::SeqCst);
                anyhow::Ok(())
            }
        };

        let watcher = DirectoryWatcher::new(poll_target(dir.path())).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            watcher.run(handler, tokio::time::sleep(Duration::from_millis(100))),
        )
        .await;

        assert!(matches!(result, Ok(Ok(()))));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_native_closed_file_is_dispatched_once() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let watcher = DirectoryWatcher::new(native_target(dir.path())).unwrap();
        let arrived = dir.path().join("show.mkv");

        let writer = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::fs::write(&arrived, b"video").unwrap();
        };
        let (result, ()) = tokio::join!(
            watcher.run(recording_handler(seen.clone()), tokio::time::sleep(Duration::from_millis(600))),
            writer
        );
        result.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![arrived]);
    }

    #[tokio::test]
    async fn test_native_rename_is_dispatched_once() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("show.part");
        let finished = dir.path().join("show.mkv");
        std::fs::write(&partial, b"video").unwrap();

        let mut target = native_target(dir.path());
        target.process_existing = false;
        let watcher = DirectoryWatcher::new(target).unwrap();

        // a finished job removes its input, so a second dispatch would find nothing
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let handler = move |path: PathBuf| {
            let seen = recorder.clone();
            async move {
                seen.lock().unwrap().push(path.clone());
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                anyhow::Ok(())
            }
        };

        let mover = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::fs::rename(&partial, &finished).unwrap();
        };
        let (result, ()) = tokio::join!(watcher.run(handler, tokio::time::sleep(Duration::from_millis(600))), mover);
        result.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![finished]);
    }

    #[tokio::test]
    async fn test_native_replay_and_live_events_dispatch_each_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let existing = vec![dir.path().join("a.mkv"), dir.path().join("b.mkv")];
        for file in &existing {
            std::fs::write(file, b"video").unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let watcher = DirectoryWatcher::new(native_target(dir.path())).unwrap();
        let arrived = dir.path().join("c.mkv");

        let writer = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            std::fs::write(&arrived, b"video").unwrap();
        };
        let (result, ()) = tokio::join!(
            watcher.run(recording_handler(seen.clone()), tokio::time::sleep(Duration::from_millis(700))),
            writer
        );
        result.unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![existing[0].clone(), existing[1].clone(), arrived]);
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_polling() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("watched");
        std::fs::create_dir_all(&root).unwrap();

        let native = DirectoryWatcher::new(native_target(&root)).unwrap();
        let auto = DirectoryWatcher::new(WatchTarget {
            strategy: WatchStrategy::Auto,
            ..poll_target(&root)
        })
        .unwrap();
        // the notifier cannot subscribe to a root that is gone
        std::fs::remove_dir(&root).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let native_result = native
            .run(recording_handler(seen.clone()), tokio::time::sleep(Duration::from_millis(100)))
            .await;
        assert!(matches!(native_result, Err(WatchError::Notify { .. })));

        let auto_result = auto
            .run(recording_handler(seen.clone()), tokio::time::sleep(Duration::from_millis(200)))
            .await;
        assert!(auto_result.is_ok());
        assert!(seen.lock().unwrap().is_empty());
    }
}
