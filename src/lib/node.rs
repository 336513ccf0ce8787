//! The stage abstraction every pipeline node is built on.
//!
//! A [`PipelineNode`] owns a [`BoundedMessageQueue`] as its input and a pool of worker
//! threads that loop "pop, process, maybe push downstream" until the queue is closed and
//! drained. The behaviour of a stage lives in its [`NodeProcessor`]; the node only deals with
//! the lifecycle:
//!
//! ```text
//!   Stopped --start/restart--> Running --terminate--> Draining --(all workers joined)--> Stopped
//! ```
//!
//! Termination is propagated downstream exactly once per run: every worker decrements a
//! shared live-worker counter as it exits, and only the worker that takes it to zero
//! terminates the downstream sink.

use crate::errors::{ErrorReporter, PipelineError, Result, panic_message};
use crate::messages::Message;
use crate::queue::BoundedMessageQueue;
use crate::stats::NamedStats;
use log::{debug, warn};
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

/// Anything messages can be pushed into: pipeline nodes and terminal sinks.
pub trait MessageSink: Send + Sync {
    /// Name used in logs, stats and diagnostics.
    fn name(&self) -> &str;

    /// Hands `message` to this sink, blocking while its input is full.
    ///
    /// # Errors
    /// - Returns [`PipelineError::QueueClosed`] if the sink has been terminated.
    fn push(&self, message: Message) -> Result<()>;

    /// Stops accepting input, waits for in-flight work to finish and terminates downstream.
    fn terminate(&self);

    /// Makes a terminated sink usable again.
    ///
    /// # Errors
    /// - Returns an error if worker threads cannot be spawned.
    fn restart(&self) -> Result<()>;

    /// A snapshot of this sink's counters.
    fn sample_stats(&self) -> NamedStats;
}

/// Where a processor sends its output. Terminal nodes have no downstream sink.
pub struct NodeOutput<'a> {
    stage: &'a str,
    sink: Option<&'a dyn MessageSink>,
}

impl NodeOutput<'_> {
    /// Forwards `message` downstream.
    ///
    /// # Errors
    /// - Returns [`PipelineError::NoDownstream`] from a terminal node.
    /// - Propagates the downstream push error, e.g. if it was closed.
    pub fn send(&self, message: impl Into<Message>) -> Result<()> {
        let message = message.into();
        match self.sink {
            Some(sink) => sink.push(message),
            None => Err(PipelineError::NoDownstream {
                stage: self.stage.to_owned(),
                kind: message.kind(),
            }),
        }
    }
}

/// The stage-specific half of a node.
///
/// A processor is shared by all workers of its node. State that must not be shared lives in
/// the per-thread [`NodeProcessor::Worker`], which is created when a worker starts and
/// handed back to [`NodeProcessor::finish_worker`] when its input runs dry.
pub trait NodeProcessor: Send + Sync + 'static {
    /// State owned by exactly one worker thread.
    type Worker: Send;

    fn name(&self) -> &str;

    /// The maximum number of workers this stage supports, if it is limited.
    fn max_workers(&self) -> Option<usize> {
        None
    }

    /// Creates the state for worker number `index`.
    ///
    /// # Errors
    /// - Returns an error if per-worker resources cannot be acquired.
    fn new_worker(&self, index: usize) -> Result<Self::Worker>;

    /// Handles one message, forwarding any results through `output`.
    ///
    /// # Errors
    /// - Any error is fatal to the node.
    fn process(
        &self,
        worker: &mut Self::Worker,
        message: Message,
        output: &NodeOutput<'_>,
    ) -> Result<()>;

    /// Called once a worker's input is closed and drained.
    ///
    /// # Errors
    /// - Any error is fatal to the node.
    fn finish_worker(&self, _worker: Self::Worker, _output: &NodeOutput<'_>) -> Result<()> {
        Ok(())
    }

    /// Called by the last worker to exit, before downstream is terminated, unless the node
    /// failed.
    ///
    /// # Errors
    /// - Reported as a fatal error of the node.
    fn on_drained(&self) -> Result<()> {
        Ok(())
    }

    /// Called before the worker pool is re-spawned by a restart.
    fn on_restart(&self) {}

    /// Adds stage-specific counters to `stats`.
    fn sample_stats(&self, _stats: &mut NamedStats) {}
}

/// Lifecycle state of a [`PipelineNode`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Running,
    Draining,
}

/// State shared between the node handle and its worker threads.
struct NodeShared<P: NodeProcessor> {
    processor: P,
    queue: BoundedMessageQueue<Message>,
    sink: Option<Arc<dyn MessageSink>>,
    reporter: ErrorReporter,
    live_workers: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicBool,
}

impl<P: NodeProcessor> NodeShared<P> {
    fn output(&self) -> NodeOutput<'_> {
        NodeOutput { stage: self.processor.name(), sink: self.sink.as_deref() }
    }

    fn run_worker(&self, index: usize) -> Result<()> {
        let output = self.output();
        let mut worker = self.processor.new_worker(index)?;
        while let Some(message) = self.queue.pop() {
            self.processor.process(&mut worker, message, &output)?;
            self.processed.fetch_add(1, Ordering::Relaxed);
            if self.failed.load(Ordering::Acquire) {
                return Ok(());
            }
        }
        self.processor.finish_worker(worker, &output)
    }

    /// Records a fatal error: report it, then refuse and discard further input so upstream
    /// stops too.
    fn fail(&self, err: PipelineError) {
        self.failed.store(true, Ordering::Release);
        self.reporter.report(self.processor.name(), err);
        self.queue.close();
        let dropped = self.queue.clear();
        if dropped > 0 {
            warn!("{} discarded {} queued message(s) after failure", self.processor.name(), dropped);
        }
    }

    /// Runs `f`, turning a panic into a [`PipelineError::WorkerPanicked`].
    fn guarded(&self, index: usize, f: impl FnOnce() -> Result<()>) -> Result<()> {
        catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
            Err(PipelineError::WorkerPanicked {
                stage: self.processor.name().to_owned(),
                worker: index,
                reason: panic_message(payload),
            })
        })
    }

    fn worker_main(&self, index: usize) {
        if let Err(err) = self.guarded(index, || self.run_worker(index)) {
            self.fail(err);
        }

        if self.live_workers.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        // Last worker out.
        if !self.failed.load(Ordering::Acquire) {
            if let Err(err) = self.guarded(index, || self.processor.on_drained()) {
                self.fail(err);
            }
        }
        debug!("{} workers finished, terminating downstream", self.processor.name());
        if let Some(sink) = &self.sink {
            sink.terminate();
        }
    }
}

struct Lifecycle {
    state: NodeState,
    handles: Vec<JoinHandle<()>>,
    pool_size: usize,
}

/// A pipeline stage: an input queue, a worker pool running a [`NodeProcessor`], and an
/// optional downstream sink.
pub struct PipelineNode<P: NodeProcessor> {
    shared: Arc<NodeShared<P>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<P: NodeProcessor> PipelineNode<P> {
    /// Builds a stopped node whose input holds at most `capacity` messages.
    #[must_use]
    pub fn new(
        processor: P,
        sink: Option<Arc<dyn MessageSink>>,
        capacity: usize,
        reporter: ErrorReporter,
    ) -> Self {
        let queue = BoundedMessageQueue::new(processor.name(), capacity);
        Self {
            shared: Arc::new(NodeShared {
                processor,
                queue,
                sink,
                reporter,
                live_workers: AtomicUsize::new(0),
                processed: AtomicU64::new(0),
                failed: AtomicBool::new(false),
            }),
            lifecycle: Mutex::new(Lifecycle {
                state: NodeState::Stopped,
                handles: Vec::new(),
                pool_size: 0,
            }),
        }
    }

    /// Builds a node and starts `pool_size` workers on it.
    ///
    /// # Errors
    /// - Returns an error if the worker threads cannot be spawned.
    pub fn spawn(
        processor: P,
        sink: Option<Arc<dyn MessageSink>>,
        capacity: usize,
        pool_size: usize,
        reporter: ErrorReporter,
    ) -> Result<Arc<Self>> {
        let node = Arc::new(Self::new(processor, sink, capacity, reporter));
        node.start(pool_size)?;
        Ok(node)
    }

    /// Spawns `pool_size` workers. Does nothing if the node is already running.
    ///
    /// # Errors
    /// - Returns an error if a worker thread cannot be spawned.
    ///
    /// # Panics
    /// - Will panic if `pool_size` is zero.
    pub fn start(&self, pool_size: usize) -> Result<()> {
        assert!(pool_size > 0, "A node needs at least one worker thread");
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != NodeState::Stopped {
            warn!("{} is already running, ignoring start", self.shared.processor.name());
            return Ok(());
        }
        lifecycle.pool_size = match self.shared.processor.max_workers() {
            Some(max) if pool_size > max => {
                warn!(
                    "{} supports at most {} worker(s), {} requested",
                    self.shared.processor.name(),
                    max,
                    pool_size
                );
                max
            }
            _ => pool_size,
        };
        self.spawn_workers(&mut lifecycle)
    }

    fn spawn_workers(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        let name = self.shared.processor.name();
        self.shared.failed.store(false, Ordering::Release);
        self.shared.live_workers.store(lifecycle.pool_size, Ordering::Release);
        for index in 0..lifecycle.pool_size {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || shared.worker_main(index));
            match spawned {
                Ok(handle) => lifecycle.handles.push(handle),
                Err(err) => {
                    // Account for the workers that will never run so termination still fires.
                    let missing = lifecycle.pool_size - index;
                    if self.shared.live_workers.fetch_sub(missing, Ordering::AcqRel) == missing {
                        if let Some(sink) = &self.shared.sink {
                            sink.terminate();
                        }
                    }
                    lifecycle.state = NodeState::Running;
                    return Err(err.into());
                }
            }
        }
        lifecycle.state = NodeState::Running;
        debug!("{} started {} worker(s)", name, lifecycle.pool_size);
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        self.lifecycle.lock().state
    }

    /// The processor driving this node, e.g. to attach shared resources.
    #[must_use]
    pub fn processor(&self) -> &P {
        &self.shared.processor
    }
}

impl<P: NodeProcessor> MessageSink for PipelineNode<P> {
    fn name(&self) -> &str {
        self.shared.processor.name()
    }

    fn push(&self, message: Message) -> Result<()> {
        self.shared.queue.push(message)
    }

    fn terminate(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == NodeState::Stopped {
            return;
        }
        lifecycle.state = NodeState::Draining;
        self.shared.queue.close();
        for handle in lifecycle.handles.drain(..) {
            if handle.join().is_err() {
                warn!("A {} worker panicked", self.shared.processor.name());
            }
        }
        lifecycle.state = NodeState::Stopped;
        debug!("{} terminated", self.shared.processor.name());
    }

    fn restart(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != NodeState::Stopped {
            warn!("{} is still running, ignoring restart", self.shared.processor.name());
            return Ok(());
        }
        self.shared.queue.reopen();
        self.shared.processor.on_restart();
        self.spawn_workers(&mut lifecycle)
    }

    fn sample_stats(&self) -> NamedStats {
        let mut stats = self.shared.queue.sample_stats();
        stats.insert(
            "messages_processed".to_owned(),
            self.shared.processed.load(Ordering::Relaxed) as f64,
        );
        stats.insert(
            "live_workers".to_owned(),
            self.shared.live_workers.load(Ordering::Relaxed) as f64,
        );
        self.shared.processor.sample_stats(&mut stats);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::error_channel;
    use crate::messages::Read;
    use crate::sink::CollectingSink;
    use rstest::rstest;

    /// Forwards reads, failing on any read whose id is "poison" and panicking on "explode".
    struct Passthrough {
        finished_workers: AtomicUsize,
        drained: AtomicUsize,
    }

    impl Passthrough {
        fn new() -> Self {
            Self { finished_workers: AtomicUsize::new(0), drained: AtomicUsize::new(0) }
        }
    }

    impl NodeProcessor for Passthrough {
        type Worker = usize;

        fn name(&self) -> &str {
            "Passthrough"
        }

        fn new_worker(&self, _index: usize) -> Result<usize> {
            Ok(0)
        }

        fn process(&self, seen: &mut usize, message: Message, output: &NodeOutput<'_>) -> Result<()> {
            if let Message::Read(read) = &message {
                if read.read_id == "poison" {
                    return Err(PipelineError::collaborator("Passthrough", "poison", "bad read"));
                }
                assert!(read.read_id != "explode", "cannot handle {}", read.read_id);
            }
            *seen += 1;
            output.send(message)
        }

        fn finish_worker(&self, _seen: usize, _output: &NodeOutput<'_>) -> Result<()> {
            self.finished_workers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_drained(&self) -> Result<()> {
            self.drained.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn read(id: &str) -> Message {
        Message::Read(Read::simplex(id, b"ACGT", b"IIII"))
    }

    // ############################################################################################
    // Test lifecycle and exactly-once downstream termination
    // ############################################################################################
    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(16)]
    fn test_terminate_propagates_exactly_once(#[case] pool_size: usize) {
        let (reporter, errors) = error_channel();
        let sink = Arc::new(CollectingSink::new("sink"));
        let node =
            PipelineNode::spawn(Passthrough::new(), Some(sink.clone()), 8, pool_size, reporter)
                .unwrap();
        assert_eq!(node.state(), NodeState::Running);
        for i in 0..100 {
            node.push(read(&format!("r{i}"))).unwrap();
        }
        node.terminate();
        assert_eq!(node.state(), NodeState::Stopped);
        assert_eq!(sink.len(), 100);
        assert_eq!(sink.terminations(), 1);
        assert_eq!(node.processor().finished_workers.load(Ordering::SeqCst), pool_size);
        assert_eq!(node.processor().drained.load(Ordering::SeqCst), 1);
        assert!(errors.try_recv().is_err());
    }

    #[test]
    fn test_terminate_twice_is_a_no_op() {
        let (reporter, _errors) = error_channel();
        let sink = Arc::new(CollectingSink::new("sink"));
        let node = PipelineNode::spawn(Passthrough::new(), Some(sink.clone()), 8, 3, reporter)
            .unwrap();
        node.push(read("r1")).unwrap();
        node.terminate();
        node.terminate();
        assert_eq!(sink.terminations(), 1);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_push_after_terminate_fails() {
        let (reporter, _errors) = error_channel();
        let node = PipelineNode::spawn(Passthrough::new(), None, 8, 1, reporter).unwrap();
        node.terminate();
        assert!(matches!(node.push(read("r1")), Err(PipelineError::QueueClosed { .. })));
    }

    #[test]
    fn test_restart_runs_again() {
        let (reporter, _errors) = error_channel();
        let sink = Arc::new(CollectingSink::new("sink"));
        let node = PipelineNode::spawn(Passthrough::new(), Some(sink.clone()), 8, 2, reporter)
            .unwrap();
        node.push(read("first")).unwrap();
        node.terminate();

        sink.restart().unwrap();
        node.restart().unwrap();
        assert_eq!(node.state(), NodeState::Running);
        node.push(read("second")).unwrap();
        node.terminate();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.terminations(), 2);
        assert_eq!(node.sample_stats()["messages_processed"], 2.0);
    }

    #[test]
    fn test_restart_while_running_is_ignored() {
        let (reporter, _errors) = error_channel();
        let node = PipelineNode::spawn(Passthrough::new(), None, 8, 2, reporter).unwrap();
        node.restart().unwrap();
        assert_eq!(node.sample_stats()["live_workers"], 2.0);
        node.terminate();
        assert_eq!(node.sample_stats()["live_workers"], 0.0);
    }

    #[test]
    fn test_messages_wait_in_queue_until_started() {
        let (reporter, _errors) = error_channel();
        let sink = Arc::new(CollectingSink::new("sink"));
        let node = PipelineNode::new(Passthrough::new(), Some(sink.clone()), 8, reporter);
        node.push(read("early")).unwrap();
        assert_eq!(node.sample_stats()["queue_depth"], 1.0);
        node.start(1).unwrap();
        node.terminate();
        assert_eq!(sink.len(), 1);
    }

    // ############################################################################################
    // Test failure handling
    // ############################################################################################
    #[test]
    fn test_worker_error_is_reported_and_stops_the_node() {
        let (reporter, errors) = error_channel();
        let sink = Arc::new(CollectingSink::new("sink"));
        let node = PipelineNode::spawn(Passthrough::new(), Some(sink.clone()), 8, 2, reporter)
            .unwrap();
        node.push(read("poison")).unwrap();
        // Eventually the failing worker closes the queue and pushes are refused.
        let mut refused = false;
        for i in 0..10_000 {
            if node.push(read(&format!("r{i}"))).is_err() {
                refused = true;
                break;
            }
        }
        assert!(refused);
        node.terminate();

        let err = errors.try_recv().unwrap();
        assert!(err.to_string().contains("poison"));
        assert_eq!(sink.terminations(), 1);
        assert_eq!(node.processor().drained.load(Ordering::SeqCst), 0);
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    fn test_worker_panic_is_reported_and_terminates_downstream(#[case] pool_size: usize) {
        let (reporter, errors) = error_channel();
        let sink = Arc::new(CollectingSink::new("sink"));
        let node =
            PipelineNode::spawn(Passthrough::new(), Some(sink.clone()), 8, pool_size, reporter)
                .unwrap();
        node.push(read("explode")).unwrap();
        let mut refused = false;
        for i in 0..10_000 {
            if node.push(read(&format!("r{i}"))).is_err() {
                refused = true;
                break;
            }
        }
        assert!(refused);
        node.terminate();

        match errors.try_recv().unwrap() {
            PipelineError::WorkerPanicked { stage, reason, .. } => {
                assert_eq!(stage, "Passthrough");
                assert_eq!(reason, "cannot handle explode");
            }
            other => panic!("expected a panic to be reported, got {other}"),
        }
        assert_eq!(sink.terminations(), 1);
        assert_eq!(node.state(), NodeState::Stopped);
        assert_eq!(node.sample_stats()["live_workers"], 0.0);
        assert_eq!(node.processor().drained.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_terminal_node_cannot_forward() {
        let (reporter, errors) = error_channel();
        let node = PipelineNode::spawn(Passthrough::new(), None, 8, 1, reporter).unwrap();
        node.push(read("r1")).unwrap();
        node.terminate();
        assert!(matches!(errors.try_recv().unwrap(), PipelineError::NoDownstream { .. }));
    }

    #[test]
    #[should_panic(expected = "A node needs at least one worker thread")]
    fn test_zero_workers_panics() {
        let (reporter, _errors) = error_channel();
        let node = PipelineNode::new(Passthrough::new(), None, 8, reporter);
        let _ = node.start(0);
    }
}
