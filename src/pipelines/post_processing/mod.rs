// SPDX-License-Identifier: GPL-3.0-only

//! Order-preserving post-processing pipeline
//!
//! ```text
//!  completion ──▶ process() ──▶ ┌────────────────────────────┐
//!                               │ pending: VecDeque<Task>    │
//!                               │  (frame, JoinHandle<bool>) │
//!                               └─────────────┬──────────────┘
//!        blocking pool:  stage chain per frame │ head only
//!                                              ▼
//!                                     delivery thread ──▶ sink
//! ```
//!
//! Every frame gets its own task on the runtime's blocking pool, so a slow
//! stage on one frame does not hold back the chains of later frames. Output
//! order is restored by a single delivery thread that only ever waits on the
//! oldest task.
//!
//! Without stages the pipeline adds nothing: frames go straight to the sink on
//! the caller's thread.

pub mod stage;
pub mod stages;

pub use stage::{Stage, StageFactory, StageRegistry};

use crate::backends::camera::types::StreamConfig;
use crate::capture::frame::{CompletedFrame, FrameHandle};
use crate::errors::{CaptureError, CaptureResult, StageError};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// What the pipeline hands downstream
pub enum Delivery {
    /// A frame every stage kept, in capture order
    Frame(FrameHandle),
    /// A fatal error; no frame follows it until the next start
    Failed(CaptureError),
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Delivery::Frame(frame) => f.debug_tuple("Frame").field(&frame.sequence()).finish(),
            Delivery::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

/// Downstream consumer of the pipeline
pub type FrameSink = Arc<dyn Fn(Delivery) + Send + Sync>;

/// A frame paired with its pending keep/drop outcome
struct PipelineTask {
    frame: FrameHandle,
    outcome: JoinHandle<Result<bool, StageError>>,
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<PipelineTask>,
    /// Head popped by the delivery thread and not yet delivered
    in_flight: usize,
    running: bool,
    stopping: bool,
    /// A stage failed this session; everything after it is dropped
    failed: bool,
    /// Bumped at every start; a delivery thread from an older session exits
    /// instead of taking tasks
    generation: u64,
    runtime: Option<Handle>,
}

struct Inner {
    queue: Mutex<QueueState>,
    ready: Condvar,
    sink: FrameSink,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Post-processing pipeline
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    inner: Arc<Inner>,
    runtime: Mutex<Option<Runtime>>,
    delivery: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Pipeline {
    /// An empty pipeline delivering to `sink`
    pub fn new(sink: FrameSink) -> Self {
        Self {
            stages: Vec::new(),
            inner: Arc::new(Inner {
                queue: Mutex::new(QueueState::default()),
                ready: Condvar::new(),
                sink,
            }),
            runtime: Mutex::new(None),
            delivery: Mutex::new(None),
        }
    }

    // ===== Building =====

    /// Build the stage chain from a post-process document
    ///
    /// The document is a JSON object whose keys name stages in execution
    /// order, each mapped to that stage's parameters.
    pub fn load(&mut self, registry: &StageRegistry, document: &Value) -> CaptureResult<()> {
        let entries = match document {
            Value::Null => return Ok(()),
            Value::Object(entries) => entries,
            _ => {
                return Err(CaptureError::Configuration(
                    "post-process document must be a JSON object".to_string(),
                ));
            }
        };

        for (name, params) in entries {
            let mut stage = registry.create(name).ok_or_else(|| {
                CaptureError::Configuration(format!("unknown post-processing stage \"{}\"", name))
            })?;
            stage.read(params)?;
            debug!(stage = %name, "Loaded post-processing stage");
            self.add_stage(stage);
        }

        info!(stages = ?self.stage_names(), "Post-processing pipeline loaded");
        Ok(())
    }

    /// [`Pipeline::load`] from a JSON file
    pub fn load_file(&mut self, registry: &StageRegistry, path: &Path) -> CaptureResult<()> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CaptureError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let document: Value = serde_json::from_str(&text)?;
        self.load(registry, &document)
    }

    /// Append a stage to the end of the chain
    pub fn add_stage(&mut self, stage: Box<dyn Stage>) {
        self.stages.push(Arc::from(stage));
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    // ===== Configuration =====

    /// Give every stage a chance to adjust a stream before negotiation
    pub fn adjust_config(&self, use_case: &str, config: &mut StreamConfig) {
        for stage in &self.stages {
            stage.adjust_config(use_case, config);
        }
    }

    /// Tell every stage the final stream configuration
    pub fn configure(&self, streams: &[StreamConfig]) -> CaptureResult<()> {
        for stage in &self.stages {
            stage.configure(streams)?;
        }
        Ok(())
    }

    // ===== Session =====

    pub fn start(&self) -> CaptureResult<()> {
        for stage in &self.stages {
            stage.start();
        }

        let handle = if self.stages.is_empty() {
            None
        } else {
            Some(self.runtime_handle()?)
        };

        let generation = {
            let mut queue = self.inner.lock();
            queue.running = true;
            queue.stopping = false;
            queue.failed = false;
            queue.runtime = handle.clone();
            queue.generation += 1;
            queue.generation
        };
        self.inner.ready.notify_all();

        // A thread left behind by a stop from its own sink must be gone before
        // a second one starts taking heads
        let previous = self.delivery.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(previous) = previous {
            if previous.thread().id() == std::thread::current().id() {
                debug!("Restarted from the previous delivery thread, it exits on return");
            } else {
                if previous.join().is_err() {
                    error!("Pipeline delivery thread panicked");
                }
                // Anything it left queued belongs to the new thread now
                self.inner.lock().in_flight = 0;
            }
        }

        if handle.is_some() {
            let inner = Arc::clone(&self.inner);
            let thread = std::thread::Builder::new()
                .name("pipeline-delivery".to_string())
                .spawn(move || run_delivery(inner, generation))
                .map_err(|e| {
                    self.inner.lock().running = false;
                    CaptureError::Resource(format!("spawn delivery thread: {}", e))
                })?;
            *self.delivery.lock().unwrap_or_else(|e| e.into_inner()) = Some(thread);
        }

        debug!(stages = self.stages.len(), "Pipeline started");
        Ok(())
    }

    fn runtime_handle(&self) -> CaptureResult<Handle> {
        let mut runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(runtime) = runtime.as_ref() {
            return Ok(runtime.handle().clone());
        }
        let built = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("camflow-stage")
            .enable_all()
            .build()
            .map_err(|e| CaptureError::Resource(format!("stage runtime: {}", e)))?;
        let handle = built.handle().clone();
        *runtime = Some(built);
        Ok(handle)
    }

    /// Hand a completed frame to the stage chain
    ///
    /// Never blocks on stage work. Frames arriving while the pipeline is not
    /// running are released straight away.
    pub fn process(&self, frame: FrameHandle) {
        if self.stages.is_empty() {
            (self.inner.sink)(Delivery::Frame(frame));
            return;
        }

        let mut queue = self.inner.lock();
        let runtime = match (&queue.runtime, queue.running && !queue.stopping) {
            (Some(runtime), true) => runtime.clone(),
            _ => {
                drop(queue);
                trace!(sequence = frame.sequence(), "Pipeline not running, releasing frame");
                return;
            }
        };

        let stages = self.stages.clone();
        let task_frame = Arc::clone(&frame);
        let outcome = runtime.spawn_blocking(move || run_stages(&stages, &task_frame));
        queue.tasks.push_back(PipelineTask { frame, outcome });
        drop(queue);
        self.inner.ready.notify_one();
    }

    /// Drain every outstanding task, then join the delivery thread
    pub fn stop(&self) {
        {
            let mut queue = self.inner.lock();
            if !queue.running {
                return;
            }
            queue.stopping = true;
        }
        self.inner.ready.notify_all();

        let mut delivery = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
        let mut joined = true;
        if let Some(handle) = delivery.take() {
            if handle.thread().id() == std::thread::current().id() {
                // The thread drains the queue and exits on its own; the next
                // start joins it
                warn!("Pipeline stopped from its own delivery thread, not joining");
                *delivery = Some(handle);
                joined = false;
            } else if handle.join().is_err() {
                error!("Pipeline delivery thread panicked");
            }
        }
        drop(delivery);

        {
            let mut queue = self.inner.lock();
            queue.running = false;
            queue.stopping = !joined;
            queue.runtime = None;
        }

        for stage in &self.stages {
            stage.stop();
        }
        debug!("Pipeline stopped");
    }

    /// Stop, tear the stages down and shut the runtime down
    pub fn teardown(&self) {
        self.stop();
        for stage in &self.stages {
            stage.teardown();
        }
        let runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }

    /// Tasks queued or being delivered
    pub fn pending(&self) -> usize {
        let queue = self.inner.lock();
        queue.tasks.len() + queue.in_flight
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Report a fatal error downstream
    pub fn report(&self, err: CaptureError) {
        (self.inner.sink)(Delivery::Failed(err));
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
        if let Some(runtime) = self.runtime.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            runtime.shutdown_background();
        }
    }
}

/// Run one frame through the chain, stopping at the first stage that drops it
fn run_stages(stages: &[Arc<dyn Stage>], frame: &CompletedFrame) -> Result<bool, StageError> {
    for stage in stages {
        if stage.process(frame)? {
            trace!(stage = stage.name(), sequence = frame.sequence(), "Frame dropped");
            return Ok(true);
        }
    }
    Ok(false)
}

fn run_delivery(inner: Arc<Inner>, generation: u64) {
    debug!(generation, "Pipeline delivery thread started");
    loop {
        let task = {
            let mut queue = inner.lock();
            while queue.generation == generation && queue.tasks.is_empty() && !queue.stopping {
                queue = inner.ready.wait(queue).unwrap_or_else(|e| e.into_inner());
            }
            if queue.generation != generation {
                break;
            }
            match queue.tasks.pop_front() {
                Some(task) => {
                    queue.in_flight = 1;
                    task
                }
                None => break,
            }
        };

        let PipelineTask { frame, outcome } = task;
        let result = futures::executor::block_on(outcome).unwrap_or_else(|e| {
            Err(StageError::new("pipeline", format!("stage task failed: {}", e)))
        });

        let failed = {
            let queue = inner.lock();
            queue.failed && queue.generation == generation
        };
        match result {
            _ if failed => {
                trace!(sequence = frame.sequence(), "Dropping frame after stage failure");
                drop(frame);
            }
            Ok(false) => (inner.sink)(Delivery::Frame(frame)),
            Ok(true) => drop(frame),
            Err(e) => {
                {
                    let mut queue = inner.lock();
                    if queue.generation == generation {
                        queue.failed = true;
                    }
                }
                error!(sequence = frame.sequence(), error = %e, "Post-processing stage failed");
                drop(frame);
                (inner.sink)(Delivery::Failed(CaptureError::Stage(e)));
            }
        }

        let mut queue = inner.lock();
        if queue.generation == generation {
            queue.in_flight = 0;
        }
    }
    debug!(generation, "Pipeline delivery thread exiting");
}
