use crate::errors::{PipelineError, Result};
use crate::messages::{Message, Read};
use crate::node::MessageSink;
use crate::stats::NamedStats;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A terminal sink that keeps every message pushed into it, in arrival order.
///
/// Used to end in-memory pipelines and to observe what a node emits.
pub struct CollectingSink {
    name: String,
    messages: Mutex<Vec<Message>>,
    closed: AtomicBool,
    terminations: AtomicUsize,
}

impl CollectingSink {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            messages: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            terminations: AtomicUsize::new(0),
        }
    }

    /// Number of messages received so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times this sink has been terminated.
    #[must_use]
    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    /// Removes and returns everything received so far.
    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock())
    }

    /// Removes and returns the reads received so far, discarding other message kinds.
    pub fn take_reads(&self) -> Vec<Read> {
        self.take()
            .into_iter()
            .filter_map(|m| match m {
                Message::Read(read) => Some(read),
                _ => None,
            })
            .collect()
    }
}

impl MessageSink for CollectingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(&self, message: Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::QueueClosed { queue: self.name.clone() });
        }
        self.messages.lock().push(message);
        Ok(())
    }

    fn terminate(&self) {
        self.closed.store(true, Ordering::Release);
        self.terminations.fetch_add(1, Ordering::SeqCst);
    }

    fn restart(&self) -> Result<()> {
        self.closed.store(false, Ordering::Release);
        Ok(())
    }

    fn sample_stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert("messages_received".to_owned(), self.len() as f64);
        stats.insert("terminations".to_owned(), self.terminations() as f64);
        stats
    }
}
