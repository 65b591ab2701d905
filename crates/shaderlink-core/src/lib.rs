//! # shaderlink-core
//!
//! Core types and primitives for Shaderlink, the remote control plane for a
//! live render engine. This crate holds what every other crate shares:
//! shader sources, parameter values, rendered images, the render engine
//! boundary, configuration and error types.

pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod hash;
pub mod types;

pub use config::*;

pub use engine::{GeneratedProgram, RenderEngine};
pub use error::{DispatchError, ShaderlinkError, ShaderlinkResult};
pub use frame::{RenderedImage, BYTES_PER_PIXEL};
pub use types::{MaterialId, ParameterInfo, ParameterKind, ShaderSource, UniformValue, Vec3};
