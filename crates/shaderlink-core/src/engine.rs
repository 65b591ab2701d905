use crate::error::ShaderlinkResult;
use crate::frame::RenderedImage;
use crate::types::{MaterialId, ParameterInfo, ShaderSource, UniformValue, Vec3};

// ──────────────────────────────────────────────────────────────────────────────
// Render engine boundary
// ──────────────────────────────────────────────────────────────────────────────

/// A program produced by the engine's own shader generator, together with the
/// source it was built from.
#[derive(Debug, Clone)]
pub struct GeneratedProgram<P> {
    pub program: P,
    pub source: ShaderSource,
}

/// The live rendering engine driven by the control plane.
///
/// Implementations own GPU state and are only ever touched from the engine
/// thread, so the trait requires neither `Send` nor `Sync`.
pub trait RenderEngine {
    /// Compiled program handle. Clones share the same underlying program.
    type Program: Clone;

    /// Compile a vertex/fragment pair. Failures carry the compiler log as a
    /// `ShaderlinkError::Compile`.
    fn compile(&mut self, source: &ShaderSource) -> ShaderlinkResult<Self::Program>;

    /// Make `program` the active program of `material`. Never compiles.
    fn bind(&mut self, material: MaterialId, program: &Self::Program) -> ShaderlinkResult<()>;

    /// Render one frame of the current scene.
    fn render(&mut self, width: u32, height: u32) -> ShaderlinkResult<RenderedImage>;

    /// Render one frame without reading it back. Used for timing.
    fn draw(&mut self, width: u32, height: u32) -> ShaderlinkResult<()> {
        self.render(width, height).map(|_| ())
    }

    /// Recompile the engine-authored program of `material` from its
    /// definition. Does not bind it.
    fn regenerate_default_program(
        &mut self,
        material: MaterialId,
    ) -> ShaderlinkResult<GeneratedProgram<Self::Program>>;

    fn materials(&self) -> Vec<MaterialId>;

    fn selected_material(&self) -> Option<MaterialId>;

    fn material_name(&self, material: MaterialId) -> Option<String>;

    /// Every addressable parameter of `material`, mutable or not.
    fn parameters(&self, material: MaterialId) -> Vec<ParameterInfo>;

    fn parameter_value(&self, material: MaterialId, path: &str) -> ShaderlinkResult<UniformValue>;

    fn set_parameter_value(
        &mut self,
        material: MaterialId,
        path: &str,
        value: UniformValue,
    ) -> ShaderlinkResult<()>;

    fn camera_position(&self) -> Vec3;

    fn set_camera_position(&mut self, position: Vec3);
}
