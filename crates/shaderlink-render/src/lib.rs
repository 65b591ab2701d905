//! # shaderlink-render
//!
//! The engine thread of Shaderlink. A [`Dispatcher`] owns an
//! [`EngineSession`] (engine, program cache, uniform snapshots) on one worker
//! thread; every control operation is a task submitted to it. The wgpu
//! engine lives in [`gpu_engine`], batch rendering in [`variants`].

pub mod benchmark;
pub mod dispatcher;
pub mod gpu;
pub mod gpu_engine;
pub mod program_cache;
pub mod session;
pub mod shm;
pub mod uniform_store;
pub mod variants;

#[cfg(test)]
mod test_support;

pub use benchmark::{run_benchmark, BenchmarkReport, BenchmarkRequest};
pub use dispatcher::{Dispatcher, ShutdownMode};
pub use gpu::GpuContext;
pub use gpu_engine::GpuEngine;
pub use program_cache::{ProgramCache, CUSTOM_SLOTS};
pub use session::{
    BindingState, EngineSession, OneOrMany, ResetOptions, ShaderEdit, ShaderReport,
    ShaderUndo, UniformAssignment, UniformDescriptor,
};
pub use uniform_store::UniformStore;
pub use variants::{render_variants, VariantOutput, VariantSpec};

use shaderlink_core::{ShaderlinkConfig, ShaderlinkResult};

/// Dispatcher handle of a GPU engine session.
pub type GpuEngineHandle = Dispatcher<EngineSession<GpuEngine>>;

/// Start the engine thread with a [`GpuEngine`] built from `config`.
pub fn spawn_gpu_engine(config: &ShaderlinkConfig) -> ShaderlinkResult<GpuEngineHandle> {
    let render = config.render.clone();
    let materials = config.materials.clone();
    Dispatcher::spawn("shaderlink-engine", move || {
        GpuEngine::new(&render, &materials).map(EngineSession::new)
    })
}
