//! Error types for pipeline operations.

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A push was attempted on a queue that has been closed.
    #[error("Cannot push to closed queue '{queue}'")]
    QueueClosed {
        /// Name of the queue (the owning node's name)
        queue: String,
    },

    /// An external collaborator (writer, encoder, scorer) failed.
    #[error("Stage '{stage}' failed on '{key}': {reason}")]
    Collaborator {
        /// The stage that owns the collaborator
        stage: String,
        /// The read id or classification key being processed
        key: String,
        /// Explanation of the failure
        reason: String,
    },

    /// A node received a message variant it has no handling for.
    #[error("Stage '{stage}' cannot process {kind} messages")]
    UnexpectedMessage {
        /// The stage that received the message
        stage: String,
        /// The kind of message received
        kind: &'static str,
    },

    /// A node tried to forward a message but has no downstream sink.
    #[error("Stage '{stage}' has no downstream sink to forward {kind} messages to")]
    NoDownstream {
        /// The terminal stage
        stage: String,
        /// The kind of message it tried to forward
        kind: &'static str,
    },

    /// A subread with the same read id was already pending for its parent.
    #[error("Subread '{read_id}' was received twice for parent read '{parent_read_id}'")]
    DuplicateSubread {
        /// The parent read id the group is keyed by
        parent_read_id: String,
        /// The repeated read id
        read_id: String,
    },

    /// A subread arrived for a parent whose group was already full.
    #[error("Subread '{read_id}' arrived after parent read '{parent_read_id}' was already full")]
    LateSubread {
        /// The parent read id the group is keyed by
        parent_read_id: String,
        /// The late read id
        read_id: String,
    },

    /// The tagger drained its input while still holding unmatched reads.
    #[error(
        "Stage '{stage}' finished with {pending_groups} partial and {full_groups} incomplete \
         subread group(s), {duplex_reads} unmatched duplex read(s) and {rejections} unmatched \
         rejection(s)"
    )]
    UnresolvedGroups {
        /// The stage holding the reads
        stage: String,
        /// Number of groups still missing subreads
        pending_groups: usize,
        /// Number of full groups still waiting for duplex reads
        full_groups: usize,
        /// Number of duplex reads that never matched a group
        duplex_reads: usize,
        /// Number of candidate rejections that never matched a group
        rejections: usize,
    },

    /// A worker thread panicked while running a stage.
    #[error("Worker {worker} of stage '{stage}' panicked: {reason}")]
    WorkerPanicked {
        /// The stage the worker belonged to
        stage: String,
        /// Index of the worker within its pool
        worker: usize,
        /// The panic payload, if it was a string
        reason: String,
    },

    /// A row of an input manifest could not be turned into a message.
    #[error("Invalid manifest row {row}: {reason}")]
    InvalidManifest {
        /// One-based data row number, not counting the header
        row: usize,
        /// What was wrong with it
        reason: String,
    },

    /// Underlying I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Failure reading or writing a delimited file
    #[error(transparent)]
    Fg(#[from] fgoxide::FgError),
}

impl PipelineError {
    /// Builds a [`PipelineError::Collaborator`] from anything printable.
    pub fn collaborator(
        stage: impl Into<String>,
        key: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::Collaborator { stage: stage.into(), key: key.into(), reason: reason.to_string() }
    }
}

/// The sending half of the process-wide channel that pipeline workers report fatal errors on.
/// Cheap to clone; every node of a pipeline holds one.
#[derive(Clone)]
pub struct ErrorReporter {
    sender: Sender<PipelineError>,
    failed: Arc<AtomicBool>,
}

impl ErrorReporter {
    /// Logs `err` against `stage` and sends it to whoever owns the receiving end.
    pub fn report(&self, stage: &str, err: PipelineError) {
        error!("Fatal error in {stage}: {err}");
        self.failed.store(true, Ordering::Release);
        // The receiver going away just means nobody is listening any more.
        let _ = self.sender.send(err);
    }

    /// True once any error has been reported on this channel.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

/// Creates a connected reporter and receiver pair.
#[must_use]
pub fn error_channel() -> (ErrorReporter, Receiver<PipelineError>) {
    let (sender, receiver) = unbounded();
    (ErrorReporter { sender, failed: Arc::new(AtomicBool::new(false)) }, receiver)
}

/// Turns a panic payload into a printable message.
#[must_use]
pub fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
