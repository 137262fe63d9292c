//! Intake folder watcher.
//!
//! A `notify` observer pushes newly created image paths onto a FIFO; one
//! drain thread pops them in order and runs each through the pipeline.

use crate::pipeline::{is_supported, Pipeline, PipelineError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use notify::event::CreateKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use photomatch_core::FeatureRecord;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("watcher already running")]
    AlreadyRunning,
    #[error("file notification unavailable: {0}")]
    Notify(#[from] notify::Error),
    #[error("failed to spawn drain thread: {0}")]
    Spawn(std::io::Error),
}

/// Called after each drained file with the pipeline's result.
type Completion = Arc<dyn Fn(&Path, &Result<FeatureRecord, PipelineError>) + Send + Sync>;

/// Unbounded FIFO of paths with duplicate suppression.
///
/// Closing disconnects the channel: the consumer wakes, and anything
/// still queued is discarded.
pub struct WorkQueue {
    tx: Mutex<Option<Sender<PathBuf>>>,
    rx: Receiver<PathBuf>,
    queued: Mutex<HashSet<PathBuf>>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx: Mutex::new(Some(tx)), rx, queued: Mutex::new(HashSet::new()) }
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `path` unless it is already waiting. Returns whether it was added.
    pub fn push(&self, path: PathBuf) -> bool {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = tx.as_ref() else {
            return false;
        };
        let mut queued = self.queued.lock().unwrap_or_else(|e| e.into_inner());
        if !queued.insert(path.clone()) {
            return false;
        }
        tx.send(path).is_ok()
    }

    /// Block until a path is available. `None` once the queue is closed.
    pub fn pop(&self) -> Option<PathBuf> {
        loop {
            let path = self.rx.recv().ok()?;
            // Absent when close() raced us for it.
            if self.queued.lock().unwrap_or_else(|e| e.into_inner()).remove(&path) {
                return Some(path);
            }
        }
    }

    /// Disconnect the consumer and drop whatever is still waiting.
    pub fn close(&self) -> usize {
        let mut tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        drop(tx.take());
        self.queued.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Pop paths one at a time, pausing `settle` before handing each to `handle`.
pub fn drain(queue: &WorkQueue, settle: Duration, mut handle: impl FnMut(PathBuf)) {
    while let Some(path) = queue.pop() {
        std::thread::sleep(settle);
        handle(path);
    }
}

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Station whose settings apply to watched files.
    pub station: String,
    /// Only queue new files when set.
    pub auto_process: bool,
    pub settle_delay: Duration,
    pub stop_timeout: Duration,
}

struct Running {
    observer: RecommendedWatcher,
    queue: Arc<WorkQueue>,
    drain: JoinHandle<()>,
    /// Disconnects when the drain thread exits, panics included.
    done: Receiver<()>,
}

/// `Stopped → Running → Stopped` watcher over the pipeline's intake folder.
pub struct Watcher {
    pipeline: Arc<Pipeline>,
    options: WatcherOptions,
    on_complete: Option<Completion>,
    running: Mutex<Option<Running>>,
}

impl Watcher {
    pub fn new(pipeline: Arc<Pipeline>, options: WatcherOptions) -> Self {
        Self { pipeline, options, on_complete: None, running: Mutex::new(None) }
    }

    pub fn with_completion(
        mut self,
        on_complete: impl Fn(&Path, &Result<FeatureRecord, PipelineError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_complete = Some(Arc::new(on_complete));
        self
    }

    /// Begin observing the intake folder and start the drain thread.
    ///
    /// On failure nothing is left running.
    pub fn start(&self) -> Result<(), WatcherError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Err(WatcherError::AlreadyRunning);
        }

        let input = self.pipeline.dirs().input.clone();
        let queue = Arc::new(WorkQueue::new());

        let events = Arc::clone(&queue);
        let auto_process = self.options.auto_process;
        let mut observer = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => on_event(&events, &event, auto_process),
            Err(e) => tracing::warn!(error = %e, "watch error"),
        })?;
        observer.watch(&input, RecursiveMode::NonRecursive)?;

        let consumer = Arc::clone(&queue);
        let pipeline = Arc::clone(&self.pipeline);
        let station = self.options.station.clone();
        let settle = self.options.settle_delay;
        let on_complete = self.on_complete.clone();
        let (done_tx, done) = crossbeam_channel::bounded::<()>(1);
        let drain_thread = std::thread::Builder::new()
            .name("photomatch-watcher".into())
            .spawn(move || {
                let _done = done_tx;
                tracing::info!("watcher drain thread started");
                drain(&consumer, settle, |path| {
                    let result = pipeline.process(&path, &station);
                    if let Some(callback) = &on_complete {
                        callback(&path, &result);
                    }
                });
                tracing::info!("watcher drain thread exiting");
            })
            .map_err(WatcherError::Spawn)?;

        *running = Some(Running { observer, queue, drain: drain_thread, done });
        tracing::info!(path = %input.display(), "watcher started");
        Ok(())
    }

    /// Stop observing and wait (bounded) for the drain thread.
    ///
    /// Returns `false` if the watcher was not running. The watcher is
    /// stopped afterwards even if the drain thread outlives the timeout.
    pub fn stop(&self) -> bool {
        let Some(Running { observer, queue, drain: drain_thread, done }) =
            self.running.lock().unwrap_or_else(|e| e.into_inner()).take()
        else {
            return false;
        };

        drop(observer);
        let dropped = queue.close();
        if dropped > 0 {
            tracing::warn!(dropped, "discarded queued files on stop");
        }

        if exited_within(&done, self.options.stop_timeout) {
            if drain_thread.join().is_err() {
                tracing::error!("watcher drain thread panicked");
            }
        } else {
            tracing::warn!(timeout = ?self.options.stop_timeout, "drain thread still busy, detaching");
        }

        tracing::info!("watcher stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Files waiting to be processed.
    pub fn queue_len(&self) -> usize {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, |r| r.queue.len())
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait for the drain thread to drop its end of `done`.
fn exited_within(done: &Receiver<()>, timeout: Duration) -> bool {
    matches!(done.recv_timeout(timeout), Ok(()) | Err(RecvTimeoutError::Disconnected))
}

fn on_event(queue: &WorkQueue, event: &Event, auto_process: bool) {
    if !matches!(event.kind, EventKind::Create(CreateKind::File | CreateKind::Any)) {
        return;
    }
    for path in event.paths.iter().filter(|p| is_supported(p)) {
        if !auto_process {
            tracing::info!(path = %path.display(), "new file, auto-processing disabled");
            continue;
        }
        if queue.push(path.clone()) {
            tracing::info!(path = %path.display(), "queued new file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{pipeline, write_photo};
    use std::sync::mpsc;

    fn create_event(paths: &[&str]) -> Event {
        let mut event = Event::new(EventKind::Create(CreateKind::File));
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    fn options() -> WatcherOptions {
        WatcherOptions {
            station: "default".into(),
            auto_process: true,
            settle_delay: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_queue_fifo_order() {
        let queue = WorkQueue::new();
        for name in ["A.jpg", "B.jpg", "C.jpg"] {
            on_event(&queue, &create_event(&[name]), true);
        }

        let mut seen = Vec::new();
        drain(&queue, Duration::ZERO, |path| {
            seen.push(path);
            if seen.len() == 3 {
                queue.close();
            }
        });
        assert_eq!(seen, vec![PathBuf::from("A.jpg"), PathBuf::from("B.jpg"), PathBuf::from("C.jpg")]);
    }

    #[test]
    fn test_queue_dedup_and_close() {
        let queue = WorkQueue::new();
        assert!(queue.push(PathBuf::from("a.jpg")));
        assert!(!queue.push(PathBuf::from("a.jpg")));
        assert!(queue.push(PathBuf::from("b.jpg")));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some(PathBuf::from("a.jpg")));
        assert!(queue.push(PathBuf::from("a.jpg")));

        assert_eq!(queue.close(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
        assert!(!queue.push(PathBuf::from("c.jpg")));
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let queue = Arc::new(WorkQueue::new());
        let consumer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || consumer.pop());
        std::thread::sleep(Duration::from_millis(50));
        queue.push(PathBuf::from("late.png"));
        assert_eq!(handle.join().unwrap(), Some(PathBuf::from("late.png")));
    }

    #[test]
    fn test_exit_wait_is_bounded() {
        let (done_tx, done) = crossbeam_channel::bounded::<()>(1);
        let worker = std::thread::spawn(move || {
            let _done = done_tx;
            std::thread::sleep(Duration::from_millis(300));
        });
        assert!(!exited_within(&done, Duration::from_millis(20)));
        assert!(exited_within(&done, Duration::from_secs(5)));
        worker.join().unwrap();
    }

    #[test]
    fn test_event_filtering() {
        let queue = WorkQueue::new();
        on_event(&queue, &create_event(&["notes.txt", "photo.JPEG"]), true);
        on_event(&queue, &Event::new(EventKind::Create(CreateKind::Folder)).add_path("dir.jpg".into()), true);
        on_event(&queue, &Event::new(EventKind::Remove(notify::event::RemoveKind::File)).add_path("x.jpg".into()), true);
        assert_eq!(queue.len(), 1);

        on_event(&queue, &create_event(&["other.png"]), false);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_start_stop_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = Watcher::new(Arc::new(pipeline(dir.path())), options());

        assert!(!watcher.stop());
        watcher.start().unwrap();
        assert!(watcher.is_running());
        assert!(matches!(watcher.start(), Err(WatcherError::AlreadyRunning)));
        assert!(watcher.stop());
        assert!(!watcher.is_running());
        assert!(!watcher.stop());

        watcher.start().unwrap();
        assert!(watcher.stop());
    }

    #[test]
    fn test_start_fails_without_intake_folder() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(pipeline(dir.path()));
        std::fs::remove_dir_all(&pipeline.dirs().input).unwrap();

        let watcher = Watcher::new(pipeline, options());
        assert!(matches!(watcher.start(), Err(WatcherError::Notify(_))));
        assert!(!watcher.is_running());
    }

    #[test]
    fn test_new_file_is_processed() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(pipeline(dir.path()));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let watcher = Watcher::new(Arc::clone(&pipeline), options()).with_completion(move |path, result| {
            let _ = tx.lock().unwrap().send((path.to_path_buf(), result.is_ok()));
        });
        watcher.start().unwrap();

        let photo = write_photo(&pipeline.dirs().input, "walk-in.png");
        let (path, ok) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(path, photo);
        assert!(ok);
        assert!(pipeline.store().get_by_filename("walk-in.png").is_some());

        assert!(watcher.stop());
    }
}
