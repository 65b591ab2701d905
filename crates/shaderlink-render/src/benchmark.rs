//! Frame-time measurement on the engine thread.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use shaderlink_core::{check_dimensions, RenderEngine, ShaderlinkError, ShaderlinkResult};

use crate::session::EngineSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BenchmarkRequest {
    pub width: u32,
    pub height: u32,
    pub frames: u32,
    #[serde(rename = "warmup-frames")]
    pub warmup: u32,
}

impl Default for BenchmarkRequest {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            frames: 100,
            warmup: 100,
        }
    }
}

impl BenchmarkRequest {
    pub fn validate(&self) -> ShaderlinkResult<()> {
        check_dimensions(self.width, self.height)?;
        if self.frames == 0 {
            return Err(ShaderlinkError::validation("frames must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BenchmarkReport {
    /// Mean wall-clock nanoseconds per timed frame.
    pub speed: u64,
    pub frames: u32,
    pub total_ns: u64,
}

impl BenchmarkReport {
    pub fn fps(&self) -> f64 {
        if self.speed == 0 {
            return f64::INFINITY;
        }
        1e9 / self.speed as f64
    }
}

/// Draw `warmup` untimed frames, then time `frames` frames.
pub fn run_benchmark<E: RenderEngine>(
    session: &mut EngineSession<E>,
    request: &BenchmarkRequest,
) -> ShaderlinkResult<BenchmarkReport> {
    request.validate()?;
    let BenchmarkRequest {
        width,
        height,
        frames,
        warmup,
    } = *request;

    tracing::info!(
        "benchmark {}x{}: {} warmup + {} timed frames",
        width,
        height,
        warmup,
        frames
    );
    for _ in 0..warmup {
        session.engine_mut().draw(width, height)?;
    }

    let start = Instant::now();
    for _ in 0..frames {
        session.engine_mut().draw(width, height)?;
    }
    let total_ns = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);

    let report = BenchmarkReport {
        speed: total_ns / u64::from(frames),
        frames,
        total_ns,
    };
    tracing::info!("benchmark result: {} ns/frame ({:.1} fps)", report.speed, report.fps());
    Ok(report)
}
