use crate::common::FileHash;
use bytes::Bytes;
use std::fmt;

/// What a session task was started for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Download of the file content
    Retrieval,
    /// Download of the metadata behind a bare hash
    Metadata,
    /// Periodic announce to a tracker
    Announce,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Retrieval => "retrieval",
            TaskKind::Metadata => "metadata",
            TaskKind::Announce => "announce",
        };
        f.write_str(name)
    }
}

/// Notifications consumed by the tracker/session layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    TaskStarted { hash: FileHash, task: TaskKind },
    TaskCompleted { hash: FileHash, task: TaskKind },
    MetadataDiscovered { hash: FileHash, metadata: Bytes },
}

impl SessionEvent {
    pub fn hash(&self) -> FileHash {
        match self {
            SessionEvent::TaskStarted { hash, .. }
            | SessionEvent::TaskCompleted { hash, .. }
            | SessionEvent::MetadataDiscovered { hash, .. } => *hash,
        }
    }

    pub fn dispatch<H: SessionHooks + ?Sized>(self, hooks: &H) {
        match self {
            SessionEvent::TaskStarted { hash, task } => hooks.on_task_started(&hash, task),
            SessionEvent::TaskCompleted { hash, task } => hooks.on_task_completed(&hash, task),
            SessionEvent::MetadataDiscovered { hash, metadata } => {
                hooks.on_metadata_discovered(&hash, metadata)
            }
        }
    }
}

pub trait SessionHooks {
    fn on_task_started(&self, _hash: &FileHash, _task: TaskKind) {}

    fn on_task_completed(&self, _hash: &FileHash, _task: TaskKind) {}

    fn on_metadata_discovered(&self, _hash: &FileHash, _metadata: Bytes) {}
}
