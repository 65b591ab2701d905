//! The state owned by the engine thread and every control operation on it.
//!
//! An [`EngineSession`] bundles the engine, its [`ProgramCache`], its
//! [`UniformStore`] and the per-material binding state. It is built on the
//! engine thread and only ever reached through the dispatcher.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use shaderlink_core::types::parse_vec3;
use shaderlink_core::{
    MaterialId, ParameterKind, RenderEngine, RenderedImage, ShaderSource, ShaderlinkError,
    ShaderlinkResult, UniformValue, Vec3,
};

use crate::program_cache::ProgramCache;
use crate::uniform_store::UniformStore;

/// Name of the pseudo-parameter that moves the camera.
pub const CAMERA_UNIFORM: &str = "camera";

/// Whether a material shows its engine-authored program or a user edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindingState {
    EngineGenerated,
    UserOverridden,
}

#[derive(Debug, Clone)]
struct Binding<P> {
    source: ShaderSource,
    program: P,
    state: BindingState,
}

/// Bindings replaced by a set of shader edits, in application order.
pub struct ShaderUndo<P> {
    entries: Vec<(MaterialId, Binding<P>)>,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetOptions {
    #[serde(default = "yes")]
    pub reset_shader: bool,
    #[serde(default = "yes")]
    pub reset_uniforms: bool,
}

impl Default for ResetOptions {
    fn default() -> Self {
        Self {
            reset_shader: true,
            reset_uniforms: true,
        }
    }
}

/// One shader replacement. Missing stages keep the currently bound text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ShaderEdit {
    #[serde(rename = "material-idx", default)]
    pub material_idx: Option<usize>,
    #[serde(default)]
    pub vertex: Option<String>,
    #[serde(default)]
    pub fragment: Option<String>,
}

/// A request body that is either a single item or an array of items.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => std::slice::from_ref(item),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UniformAssignment {
    pub name: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterialShader {
    pub index: usize,
    pub name: String,
    pub vertex: String,
    pub fragment: String,
    pub overridden: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShaderReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vertex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment: Option<String>,
    pub materials: Vec<MaterialShader>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UniformDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f32>,
    pub value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

enum PlannedUpdate {
    Camera(Vec3),
    Parameter { path: String, value: UniformValue },
}

pub struct EngineSession<E: RenderEngine> {
    engine: E,
    programs: ProgramCache<E::Program>,
    uniforms: UniformStore,
    bindings: HashMap<MaterialId, Binding<E::Program>>,
}

impl<E: RenderEngine> EngineSession<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            programs: ProgramCache::new(),
            uniforms: UniformStore::new(),
            bindings: HashMap::new(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn programs(&self) -> &ProgramCache<E::Program> {
        &self.programs
    }

    pub fn uniforms(&self) -> &UniformStore {
        &self.uniforms
    }

    pub fn selected_material(&self) -> ShaderlinkResult<MaterialId> {
        self.engine
            .selected_material()
            .ok_or_else(|| ShaderlinkError::state("no material selected"))
    }

    /// The material at `index`, or the selected one when no index is given.
    pub fn resolve_material(&self, index: Option<usize>) -> ShaderlinkResult<MaterialId> {
        match index {
            None => self.selected_material(),
            Some(i) => self
                .engine
                .materials()
                .into_iter()
                .find(|m| m.0 == i)
                .ok_or_else(|| ShaderlinkError::state(format!("material index {} does not exist", i))),
        }
    }

    pub fn binding_state(&self, material: MaterialId) -> BindingState {
        self.bindings
            .get(&material)
            .map_or(BindingState::EngineGenerated, |b| b.state)
    }

    /// Regenerate the engine-authored program, make it the default entry and
    /// bind it.
    fn regenerate_default(&mut self, material: MaterialId) -> ShaderlinkResult<()> {
        let generated = self.engine.regenerate_default_program(material)?;
        self.programs
            .store_default(material, generated.program.clone(), generated.source.clone());
        self.programs.bind(&mut self.engine, material, &generated.program)?;
        tracing::info!("{}: regenerated engine program", material);
        self.bindings.insert(
            material,
            Binding {
                source: generated.source,
                program: generated.program,
                state: BindingState::EngineGenerated,
            },
        );
        Ok(())
    }

    /// Make sure `material` has a default entry and a known binding.
    fn ensure_binding(&mut self, material: MaterialId) -> ShaderlinkResult<&Binding<E::Program>> {
        if !self.bindings.contains_key(&material) {
            self.regenerate_default(material)?;
        }
        self.bindings
            .get(&material)
            .ok_or_else(|| ShaderlinkError::state(format!("{} has no program", material)))
    }

    /// Source of the program currently bound to `material`.
    pub fn bound_source(&mut self, material: MaterialId) -> ShaderlinkResult<ShaderSource> {
        Ok(self.ensure_binding(material)?.source.clone())
    }

    /// Compile (or fetch from cache) and bind `source` on `material`.
    ///
    /// On failure the material keeps, or gets back, its previous program.
    pub fn set_shader_from_source(
        &mut self,
        material: MaterialId,
        source: ShaderSource,
    ) -> ShaderlinkResult<()> {
        let previous = self.ensure_binding(material)?.clone();

        let program = match self.programs.lookup(material, &source) {
            Some(program) => {
                tracing::debug!("{}: program served from cache", material);
                program
            }
            None => {
                let program = self.engine.compile(&source).inspect_err(|e| {
                    tracing::warn!("{}: shader compile failed:\n{}", material, e);
                })?;
                self.programs
                    .store_custom(material, program.clone(), source.clone());
                program
            }
        };

        if let Err(e) = self.programs.bind(&mut self.engine, material, &program) {
            tracing::warn!("{}: bind failed, restoring previous program: {}", material, e);
            self.restore_binding(material, previous);
            return Err(e);
        }

        self.bindings.insert(
            material,
            Binding {
                source,
                program,
                state: BindingState::UserOverridden,
            },
        );
        Ok(())
    }

    fn restore_binding(&mut self, material: MaterialId, binding: Binding<E::Program>) {
        if let Err(e) = self.programs.bind(&mut self.engine, material, &binding.program) {
            tracing::error!("{}: could not restore previous program: {}", material, e);
        }
        self.bindings.insert(material, binding);
    }

    /// Apply every edit or none: a failure rolls back the edits already
    /// applied by this call.
    pub fn apply_shader_edits(&mut self, edits: &[ShaderEdit]) -> ShaderlinkResult<()> {
        self.apply_shader_edits_with_undo(edits).map(|_| ())
    }

    /// Like [`apply_shader_edits`](Self::apply_shader_edits), but hands back
    /// the previous bindings so the caller can revert the edits later.
    pub fn apply_shader_edits_with_undo(
        &mut self,
        edits: &[ShaderEdit],
    ) -> ShaderlinkResult<ShaderUndo<E::Program>> {
        let mut undo = ShaderUndo {
            entries: Vec::with_capacity(edits.len()),
        };

        for edit in edits {
            let result = self.resolve_material(edit.material_idx).and_then(|material| {
                let previous = self.ensure_binding(material)?.clone();
                let source = previous
                    .source
                    .with_overrides(edit.vertex.as_deref(), edit.fragment.as_deref());
                self.set_shader_from_source(material, source)?;
                Ok((material, previous))
            });

            match result {
                Ok(applied) => undo.entries.push(applied),
                Err(e) => {
                    self.undo_shader_edits(undo);
                    return Err(e);
                }
            }
        }
        Ok(undo)
    }

    /// Rebind what was bound before the edits behind `undo`, newest first.
    pub fn undo_shader_edits(&mut self, undo: ShaderUndo<E::Program>) {
        for (material, binding) in undo.entries.into_iter().rev() {
            self.restore_binding(material, binding);
        }
    }

    /// Return every material to its default program and/or its captured
    /// parameter values.
    pub fn reset(&mut self, options: ResetOptions) -> ShaderlinkResult<()> {
        for material in self.engine.materials() {
            if options.reset_shader {
                match self.programs.default_entry(material).cloned() {
                    Some(default) => {
                        self.programs.bind(&mut self.engine, material, &default.program)?;
                        self.bindings.insert(
                            material,
                            Binding {
                                source: default.source,
                                program: default.program,
                                state: BindingState::EngineGenerated,
                            },
                        );
                    }
                    None => self.regenerate_default(material)?,
                }
            }
            if options.reset_uniforms {
                self.uniforms.restore_defaults(&mut self.engine, material)?;
            }
        }
        tracing::info!(
            "reset (shader: {}, uniforms: {})",
            options.reset_shader,
            options.reset_uniforms
        );
        Ok(())
    }

    /// Full regenerate-and-reset: restore captured values, forget them, and
    /// rebuild every default program from the engine.
    pub fn regenerate(&mut self) -> ShaderlinkResult<()> {
        for material in self.engine.materials() {
            self.uniforms.restore_defaults(&mut self.engine, material)?;
            self.uniforms.clear(material);
            self.regenerate_default(material)?;
        }
        Ok(())
    }

    pub fn shader_report(&mut self) -> ShaderlinkResult<ShaderReport> {
        let mut materials = Vec::new();
        for material in self.engine.materials() {
            let binding = self.ensure_binding(material)?;
            let (source, overridden) = (
                binding.source.clone(),
                binding.state == BindingState::UserOverridden,
            );
            materials.push(MaterialShader {
                index: material.0,
                name: self.engine.material_name(material).unwrap_or_default(),
                vertex: source.vertex,
                fragment: source.fragment,
                overridden,
            });
        }

        let selected = self
            .engine
            .selected_material()
            .and_then(|m| materials.iter().find(|s| s.index == m.0));
        Ok(ShaderReport {
            vertex: selected.map(|s| s.vertex.clone()),
            fragment: selected.map(|s| s.fragment.clone()),
            materials,
        })
    }

    /// Describe the camera and every mutable parameter of the selected
    /// material. Listing captures default snapshots.
    pub fn uniform_report(&mut self) -> ShaderlinkResult<Vec<UniformDescriptor>> {
        let mut report = vec![UniformDescriptor {
            name: CAMERA_UNIFORM.to_string(),
            kind: "vec",
            dimensions: Some(3),
            min: Some(-5.0),
            max: Some(5.0),
            value: serde_json::json!(self.engine.camera_position()),
            default: None,
        }];

        let Some(material) = self.engine.selected_material() else {
            return Ok(report);
        };

        for info in self.engine.parameters(material) {
            let (kind, dimensions, min, max) = match &info.kind {
                ParameterKind::Float => (
                    "vec",
                    Some(1),
                    Some(info.ui_min.unwrap_or(-10.0)),
                    Some(info.ui_max.unwrap_or(10.0)),
                ),
                ParameterKind::Color3 => ("vec", Some(3), Some(0.0), Some(1.0)),
                ParameterKind::Boolean => ("boolean", None, None, None),
                ParameterKind::String => {
                    tracing::debug!("{}: skipping read-only parameter {}", material, info.path);
                    continue;
                }
                ParameterKind::Unsupported(name) => {
                    tracing::warn!("{}: unknown parameter type '{}' for {}", material, name, info.path);
                    continue;
                }
            };
            let current = self.engine.parameter_value(material, &info.path)?;
            let default = self.uniforms.observe_or_capture(material, &info.path, current);
            report.push(UniformDescriptor {
                name: info.path,
                kind,
                dimensions,
                min,
                max,
                value: current.to_json(),
                default: Some(default.to_json()),
            });
        }
        Ok(report)
    }

    fn plan_uniforms(&self, assignments: &[UniformAssignment]) -> ShaderlinkResult<Vec<PlannedUpdate>> {
        let mut selected = None;
        let mut plan = Vec::with_capacity(assignments.len());

        for assignment in assignments {
            if assignment.name == CAMERA_UNIFORM {
                let position = parse_vec3(&assignment.value).ok_or_else(|| {
                    ShaderlinkError::validation("Invalid camera value (expected [x, y, z])")
                })?;
                plan.push(PlannedUpdate::Camera(position));
                continue;
            }

            let material = match selected {
                Some(m) => m,
                None => {
                    let m = self.selected_material()?;
                    selected = Some(m);
                    m
                }
            };
            let info = self
                .engine
                .parameters(material)
                .into_iter()
                .find(|p| p.path == assignment.name)
                .ok_or_else(|| {
                    ShaderlinkError::validation(format!("Unknown uniform {}", assignment.name))
                })?;
            let value = UniformValue::from_json(&info.kind, &assignment.value).map_err(|e| {
                ShaderlinkError::validation(format!("Invalid {} value for {}: {}", info.kind, info.path, e))
            })?;
            plan.push(PlannedUpdate::Parameter {
                path: info.path,
                value,
            });
        }
        Ok(plan)
    }

    /// Validate every assignment against its parameter type, then apply them
    /// all. Nothing is applied if any assignment is invalid.
    pub fn set_uniforms(&mut self, assignments: &[UniformAssignment]) -> ShaderlinkResult<()> {
        let plan = self.plan_uniforms(assignments)?;
        for update in plan {
            match update {
                PlannedUpdate::Camera(position) => self.engine.set_camera_position(position),
                PlannedUpdate::Parameter { path, value } => {
                    let material = self.selected_material()?;
                    self.uniforms
                        .apply_override(&mut self.engine, material, &path, value)?;
                }
            }
        }
        Ok(())
    }

    /// Render one frame of the current state.
    pub fn render(&mut self, width: u32, height: u32) -> ShaderlinkResult<RenderedImage> {
        let image = self.engine.render(width, height)?;
        if image.width != width || image.height != height || !image.is_well_formed() {
            return Err(ShaderlinkError::Render(format!(
                "engine returned a {}x{} image with {} bytes for a {}x{} request",
                image.width,
                image.height,
                image.pixels.len(),
                width,
                height
            )));
        }
        Ok(image)
    }

    /// Legacy screenshot: optionally move the camera, then render once.
    pub fn screenshot(
        &mut self,
        width: u32,
        height: u32,
        camera: Option<Vec3>,
    ) -> ShaderlinkResult<RenderedImage> {
        if let Some(position) = camera {
            self.engine.set_camera_position(position);
        }
        self.render(width, height)
    }
}
