//! Assembles a runnable pipeline from a recipe on the software device.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::backoff::HybridBackoff;
use crate::io::SharedReader;
use crate::observability::MetricsCollector;
use crate::output::PayloadKind;
use crate::pipeline::{Pipeline, PoolPlan, RunSummary, StageRegistry, build_pipeline};
use crate::recipe::Recipe;
use crate::soft::SoftDevice;
use crate::stages::StageContext;
use crate::timestamp::{TimecodeSink, TimestampTracker};

/// A pipeline plus the device it was built on.
pub struct Session {
    pub pipeline: Pipeline,
    pub device: SoftDevice,
    pub plans: Vec<PoolPlan>,
}

/// Encoded pipelines emit bitstreams, everything else raw surfaces.
pub fn output_kind(recipe: &Recipe) -> PayloadKind {
    match recipe.pipeline.last() {
        Some(spec) if spec.stage == "encode" => PayloadKind::Bitstream,
        _ => PayloadKind::Surface,
    }
}

impl Session {
    /// Build every stage and allocate the pools.
    pub fn open(
        recipe: &Recipe,
        registry: &StageRegistry,
        reader: SharedReader,
        timecode: Option<Box<dyn TimecodeSink>>,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        let device = SoftDevice::new(recipe.input.frame_info(), recipe.input.codec);
        let mut ctx = StageContext::new(
            device.context(),
            Arc::new(device.clone()),
            reader,
            Arc::new(TimestampTracker::new()),
            recipe.retry,
            Arc::new(HybridBackoff::default()),
            recipe.input.source_timebase(),
            recipe.input.fps,
        );
        if let Some(sink) = timecode {
            ctx = ctx.with_timecode(sink);
        }

        let mut pipeline = build_pipeline(registry, &recipe.pipeline, &ctx)?
            .with_external_alloc(recipe.external_alloc)
            .with_metrics(metrics);
        let plans = pipeline.allocate().context("Failed to allocate work surfaces")?;
        info!(
            stages = pipeline.tasks().len(),
            pools = plans.len(),
            "pipeline ready"
        );
        Ok(Self {
            pipeline,
            device,
            plans,
        })
    }
}

/// Written by `run --report`.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub recipe: String,
    pub plans: Vec<PoolPlan>,
    pub summary: RunSummary,
    pub sync_waits: u64,
}

impl RunReport {
    pub fn new(recipe: String, started_at: DateTime<Utc>, session: &Session, summary: RunSummary) -> Self {
        Self {
            started_at,
            finished_at: Utc::now(),
            recipe,
            plans: session.plans.clone(),
            summary,
            sync_waits: session.device.session.wait_count(),
        }
    }
}
