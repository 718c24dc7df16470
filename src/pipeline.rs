use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument};

use crate::error::{PipelineError, Result, SendStatus};
use crate::hw::{BufferRequirement, DeviceContext};
use crate::io::Writer;
use crate::observability::MetricsCollector;
use crate::output::{Payload, TaskOutput};
use crate::scheduler::StageKind;
use crate::stages::{PipelineTask, StageContext, register_defaults};

pub type StageParameters = Map<String, Value>;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageSpec {
    pub stage: String,
    #[serde(default)]
    pub params: Option<StageParameters>,
}

type StageConstructor = Arc<
    dyn Fn(StageParameters, &StageContext) -> anyhow::Result<Box<dyn PipelineTask>> + Send + Sync,
>;

pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        register_defaults(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters, &StageContext) -> anyhow::Result<Box<dyn PipelineTask>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(
        &self,
        name: &str,
        params: StageParameters,
        ctx: &StageContext,
    ) -> anyhow::Result<Box<dyn PipelineTask>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown stage '{}'. Available stages: {}",
                name,
                self.known_stages().join(", ")
            )
        })?;
        factory(params, ctx)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

pub fn build_pipeline(
    registry: &StageRegistry,
    specs: &[StageSpec],
    ctx: &StageContext,
) -> anyhow::Result<Pipeline> {
    let mut tasks = Vec::with_capacity(specs.len());
    for (idx, spec) in specs.iter().enumerate() {
        let params = spec.params.clone().unwrap_or_default();
        let task = registry
            .create(&spec.stage, params, ctx)
            .map_err(|err| err.context(format!("Stage {} ('{}')", idx + 1, spec.stage)))?;
        tasks.push(task);
    }
    Ok(Pipeline::new(tasks, ctx.device.clone()))
}

/// Pool assigned to one producing stage.
#[derive(Debug, Clone, Serialize)]
pub struct PoolPlan {
    pub producer: usize,
    pub producer_kind: StageKind,
    pub consumer: Option<usize>,
    pub consumer_kind: Option<StageKind>,
    pub request: BufferRequirement,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageSummary {
    pub stage: String,
    pub in_frames: u64,
    pub out_frames: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub frames_written: u64,
    pub bytes_written: u64,
    pub duration_ms: f64,
    pub stages: Vec<StageSummary>,
}

/// Work out the pool of every producing stage.
///
/// Each non-pass-through stage with an output requirement is paired with the
/// next non-pass-through stage. When both declare a requirement the frame
/// description comes from the stage with the higher allocation priority (the
/// consumer on a tie) and the suggested counts add up. The output-queue
/// depths of the producer and of the pass-through stages in between are
/// added on top, plus one frame in flight.
pub fn negotiate_allocation(tasks: &mut [Box<dyn PipelineTask>]) -> Result<Vec<PoolPlan>> {
    let mut plans = Vec::new();
    for producer in 0..tasks.len() {
        if tasks[producer].is_pass_through() {
            continue;
        }
        let Some(output) = tasks[producer].required_output()? else {
            continue;
        };
        let mut queued = tasks[producer].core().queue_depth();
        let mut consumer = None;
        for (idx, task) in tasks.iter().enumerate().skip(producer + 1) {
            if task.is_pass_through() {
                queued += task.core().queue_depth();
            } else {
                consumer = Some(idx);
                break;
            }
        }

        let mut request = output;
        if let Some(idx) = consumer
            && let Some(input) = tasks[idx].required_input()?
        {
            let producer_wins =
                tasks[producer].kind().alloc_priority() > tasks[idx].kind().alloc_priority();
            request = if producer_wins { output } else { input };
            request.suggested_frames = output.suggested_frames.saturating_add(input.suggested_frames);
            request.min_frames = output.min_frames.saturating_add(input.min_frames);
        }
        let extra = u16::try_from(queued + 1).unwrap_or(u16::MAX);
        request.suggested_frames = request.suggested_frames.saturating_add(extra);

        let consumer_kind = consumer.map(|idx| tasks[idx].kind());
        debug!(
            producer = tasks[producer].kind().name(),
            consumer = consumer_kind.map(StageKind::name),
            frames = request.suggested_frames,
            "negotiated work surfaces"
        );
        plans.push(PoolPlan {
            producer,
            producer_kind: tasks[producer].kind(),
            consumer,
            consumer_kind,
            request,
        });
    }
    Ok(plans)
}

/// Drives a chain of stages from the first one to the writer.
pub struct Pipeline {
    tasks: Vec<Box<dyn PipelineTask>>,
    device: DeviceContext,
    external_alloc: bool,
    metrics: MetricsCollector,
}

impl Pipeline {
    pub fn new(tasks: Vec<Box<dyn PipelineTask>>, device: DeviceContext) -> Self {
        Self {
            tasks,
            device,
            external_alloc: false,
            metrics: MetricsCollector::new(),
        }
    }

    /// Keep pool memory unmapped and lock it around every host access.
    pub fn with_external_alloc(mut self, external_alloc: bool) -> Self {
        self.external_alloc = external_alloc;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn tasks(&self) -> &[Box<dyn PipelineTask>] {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut [Box<dyn PipelineTask>] {
        &mut self.tasks
    }

    /// Negotiate and allocate the work-surface pools.
    pub fn allocate(&mut self) -> Result<Vec<PoolPlan>> {
        let plans = negotiate_allocation(&mut self.tasks)?;
        for plan in &plans {
            self.tasks[plan.producer].core_mut().allocate_pool(
                &plan.request,
                self.external_alloc,
                Arc::clone(&self.device.allocator),
            )?;
        }
        Ok(plans)
    }

    /// Release every pool. Fails while any surface is still referenced.
    pub fn release(&mut self) -> Result<()> {
        for task in &mut self.tasks {
            task.core_mut().clear_pool()?;
        }
        Ok(())
    }

    /// Run until the first stage reports end of stream, then flush every
    /// stage in order.
    #[instrument(skip_all, fields(stages = self.tasks.len()))]
    pub fn run(&mut self, writer: &mut dyn Writer) -> Result<RunSummary> {
        match self.tasks.first().map(|t| t.kind()) {
            Some(StageKind::Input | StageKind::Decode) => {}
            Some(kind) => {
                return Err(PipelineError::InvalidConfig(format!(
                    "pipeline must start with an input or decode stage, not {kind}"
                )));
            }
            None => return Err(PipelineError::InvalidConfig("pipeline has no stages".into())),
        }

        let started = Instant::now();
        let mut summary = RunSummary::default();
        let result = self.feed(writer, &mut summary).and_then(|()| self.flush(writer, &mut summary));
        if let Err(err) = &result {
            error!(code = err.error_code(), %err, "pipeline stopped");
        }
        result?;

        let elapsed = started.elapsed();
        summary.duration_ms = elapsed.as_secs_f64() * 1_000.0;
        self.metrics.record_total_duration(elapsed);
        for task in &self.tasks {
            let core = task.core();
            let name = core.kind().name();
            self.metrics.record_stage_frames(name, core.in_frames(), core.out_frames());
            summary.stages.push(StageSummary {
                stage: name.to_string(),
                in_frames: core.in_frames(),
                out_frames: core.out_frames(),
            });
        }
        info!(
            frames = summary.frames_written,
            bytes = summary.bytes_written,
            duration_ms = summary.duration_ms,
            "pipeline finished"
        );
        Ok(summary)
    }

    fn feed(&mut self, writer: &mut dyn Writer, summary: &mut RunSummary) -> Result<()> {
        loop {
            let mut end_of_stream = false;
            let mut data: Vec<Option<TaskOutput>> = vec![None];
            for idx in 0..self.tasks.len() {
                for item in std::mem::take(&mut data) {
                    if self.send(idx, item)? == SendStatus::EndOfStream {
                        end_of_stream = true;
                    }
                }
                data = self.drain(idx)?.into_iter().map(Some).collect();
            }
            self.emit(data.into_iter().flatten(), writer, summary)?;
            if end_of_stream {
                return Ok(());
            }
        }
    }

    fn flush(&mut self, writer: &mut dyn Writer, summary: &mut RunSummary) -> Result<()> {
        for task in &mut self.tasks {
            task.core_mut().set_queue_depth(0);
        }
        for start in 0..self.tasks.len() {
            debug!(stage = self.tasks[start].kind().name(), "flushing");
            loop {
                let mut drained = false;
                let mut data: Vec<Option<TaskOutput>> = vec![None];
                for idx in start..self.tasks.len() {
                    for item in std::mem::take(&mut data) {
                        let flushing = item.is_none();
                        let status = self.send(idx, item)?;
                        if flushing
                            && matches!(status, SendStatus::NeedMoreInput | SendStatus::EndOfStream)
                        {
                            drained = true;
                        }
                    }
                    data = self.drain(idx)?.into_iter().map(Some).collect();
                }
                self.emit(data.into_iter().flatten(), writer, summary)?;
                if drained {
                    break;
                }
            }
        }
        Ok(())
    }

    fn send(&mut self, idx: usize, item: Option<TaskOutput>) -> Result<SendStatus> {
        let task = &mut self.tasks[idx];
        let name = task.kind().name();
        let span = tracing::span!(tracing::Level::DEBUG, "stage", stage = name);
        let _span_guard = span.enter();
        let _timer = self.metrics.start_stage(name);
        task.send_frame(item)
            .inspect_err(|err| error!(stage = name, code = err.error_code(), %err, "stage failed"))
    }

    /// Outputs past the queue depth of stage `idx`, synchronized when they
    /// leave the execution domain (the writer counts as software).
    fn drain(&mut self, idx: usize) -> Result<Vec<TaskOutput>> {
        let sync = match self.tasks.get(idx + 1).map(|next| next.kind()) {
            Some(next) => self.tasks[idx].requires_sync(next),
            None => true,
        };
        self.tasks[idx].drain_outputs(sync)
    }

    fn emit(
        &mut self,
        outputs: impl Iterator<Item = TaskOutput>,
        writer: &mut dyn Writer,
        summary: &mut RunSummary,
    ) -> Result<()> {
        for output in outputs {
            output.write(writer, Some(self.device.allocator.as_ref()))?;
            let bytes = match output.payload() {
                Payload::Bitstream(bitstream) => bitstream.len() as u64,
                Payload::Surface(surface) => surface.info()?.frame_size() as u64,
            };
            summary.frames_written += 1;
            summary.bytes_written += bytes;
            self.metrics.record_output(bytes);
        }
        Ok(())
    }
}
