use std::path::{Path, PathBuf};

use notify::{
    event::{EventKind, ModifyKind},
    Event, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::PerceptionError;

/// Operation reported by a change source before it is mapped onto the wire
/// event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOperation {
    /// Entry created.
    Create,
    /// Contents written.
    Write,
    /// Entry removed.
    Remove,
    /// Entry renamed or moved.
    Rename,
    /// Permissions or other metadata changed.
    Chmod,
    /// Anything the source could not classify.
    Other,
}

/// One raw change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    /// Affected path.
    pub path: PathBuf,
    /// Reported operation.
    pub operation: RawOperation,
}

impl RawChange {
    /// Creates a change record.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, operation: RawOperation) -> Self {
        Self {
            path: path.into(),
            operation,
        }
    }
}

/// Producer of raw filesystem changes.
///
/// The receiver can be taken once; the source keeps feeding it until
/// [`close`](Self::close) is called.
pub trait ChangeSource: Send {
    /// Registers `root` and everything beneath it.
    fn add_root(&mut self, root: &Path) -> Result<(), PerceptionError>;

    /// Hands out the change stream. Returns `None` once taken.
    fn take_events(&mut self) -> Option<mpsc::Receiver<RawChange>>;

    /// Stops producing changes and releases OS resources.
    fn close(&mut self);
}

/// [`ChangeSource`] backed by the platform watcher from `notify`.
pub struct NotifyChangeSource {
    watcher: Option<RecommendedWatcher>,
    events: Option<mpsc::Receiver<RawChange>>,
    roots: Vec<PathBuf>,
}

impl std::fmt::Debug for NotifyChangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyChangeSource")
            .field("open", &self.watcher.is_some())
            .field("roots", &self.roots)
            .finish()
    }
}

impl NotifyChangeSource {
    /// Creates the watcher. `buffer` bounds the number of undelivered changes;
    /// overflow is dropped with a warning.
    pub fn new(buffer: usize) -> Result<Self, PerceptionError> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in translate(&event) {
                    if let Err(err) = tx.try_send(change) {
                        warn!(%err, "raw change dropped");
                    }
                }
            }
            Err(err) => warn!(%err, "watcher error"),
        })?;
        Ok(Self {
            watcher: Some(watcher),
            events: Some(rx),
            roots: Vec::new(),
        })
    }

    /// Roots registered so far.
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

impl ChangeSource for NotifyChangeSource {
    fn add_root(&mut self, root: &Path) -> Result<(), PerceptionError> {
        if !root.exists() {
            return Err(PerceptionError::MissingRoot(root.to_path_buf()));
        }
        let watcher = self.watcher.as_mut().ok_or(PerceptionError::Closed)?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        debug!(root = %root.display(), "watching");
        self.roots.push(root.to_path_buf());
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<RawChange>> {
        self.events.take()
    }

    fn close(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            for root in &self.roots {
                if let Err(err) = watcher.unwatch(root) {
                    debug!(%err, root = %root.display(), "unwatch failed");
                }
            }
        }
    }
}

/// Maps a `notify` event kind onto a raw operation. Access events are not
/// changes and yield `None`.
#[must_use]
pub fn classify(kind: &EventKind) -> Option<RawOperation> {
    match kind {
        EventKind::Access(_) => None,
        EventKind::Create(_) => Some(RawOperation::Create),
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => Some(RawOperation::Write),
        EventKind::Modify(ModifyKind::Name(_)) => Some(RawOperation::Rename),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(RawOperation::Chmod),
        EventKind::Remove(_) => Some(RawOperation::Remove),
        EventKind::Modify(ModifyKind::Other) | EventKind::Any | EventKind::Other => {
            Some(RawOperation::Other)
        }
    }
}

fn translate(event: &Event) -> Vec<RawChange> {
    let Some(operation) = classify(&event.kind) else {
        return Vec::new();
    };
    event
        .paths
        .iter()
        .map(|path| RawChange::new(path.clone(), operation))
        .collect()
}
