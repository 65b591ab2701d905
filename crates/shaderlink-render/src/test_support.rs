//! In-memory render engine for tests.
//!
//! Counts compiles, fails any source containing `#error`, and renders
//! solid images whose color is derived from everything that should affect a
//! frame: bound sources, parameter values and the camera.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use shaderlink_core::{
    GeneratedProgram, MaterialId, ParameterInfo, ParameterKind, RenderEngine, RenderedImage,
    ShaderSource, ShaderlinkError, ShaderlinkResult, UniformValue, Vec3,
};

#[derive(Debug, Clone, PartialEq)]
pub struct MockProgram {
    pub id: u64,
    pub source: ShaderSource,
}

struct MockMaterial {
    name: String,
    generated: ShaderSource,
    parameters: Vec<ParameterInfo>,
    values: BTreeMap<String, UniformValue>,
    bound: Option<MockProgram>,
}

pub struct MockEngine {
    materials: Vec<MockMaterial>,
    pub selected: Option<usize>,
    camera: Vec3,
    next_program: u64,
    pub compiles: usize,
    pub regenerations: usize,
    pub renders: usize,
    pub draws: usize,
    pub fail_bind: bool,
    pub fail_render: bool,
}

fn info(path: &str, kind: ParameterKind, range: Option<(f32, f32)>) -> ParameterInfo {
    ParameterInfo {
        path: path.to_string(),
        kind,
        ui_min: range.map(|r| r.0),
        ui_max: range.map(|r| r.1),
    }
}

impl MockEngine {
    /// Two materials: `wood` (selected) and `steel`.
    pub fn new() -> Self {
        let wood = MockMaterial {
            name: "wood".into(),
            generated: ShaderSource::new("// wood vertex", "// wood fragment"),
            parameters: vec![
                info("base_color", ParameterKind::Color3, None),
                info("roughness", ParameterKind::Float, Some((0.0, 1.0))),
                info("glossy", ParameterKind::Boolean, None),
                info("albedo_map", ParameterKind::String, None),
                info("transform", ParameterKind::Unsupported("matrix44".into()), None),
            ],
            values: BTreeMap::from([
                ("base_color".to_string(), UniformValue::Color3([0.5, 0.3, 0.1])),
                ("roughness".to_string(), UniformValue::Float(0.4)),
                ("glossy".to_string(), UniformValue::Boolean(false)),
            ]),
            bound: None,
        };
        let steel = MockMaterial {
            name: "steel".into(),
            generated: ShaderSource::new("// steel vertex", "// steel fragment"),
            parameters: vec![info("roughness", ParameterKind::Float, None)],
            values: BTreeMap::from([("roughness".to_string(), UniformValue::Float(0.2))]),
            bound: None,
        };
        Self {
            materials: vec![wood, steel],
            selected: Some(0),
            camera: [0.0, 0.0, 3.0],
            next_program: 1,
            compiles: 0,
            regenerations: 0,
            renders: 0,
            draws: 0,
            fail_bind: false,
            fail_render: false,
        }
    }

    pub fn bound(&self, material: MaterialId) -> Option<&MockProgram> {
        self.materials.get(material.0)?.bound.as_ref()
    }

    fn material(&self, material: MaterialId) -> ShaderlinkResult<&MockMaterial> {
        self.materials
            .get(material.0)
            .ok_or_else(|| ShaderlinkError::state(format!("no {}", material)))
    }

    fn new_program(&mut self, source: &ShaderSource) -> MockProgram {
        let id = self.next_program;
        self.next_program += 1;
        MockProgram {
            id,
            source: source.clone(),
        }
    }

    fn frame_color(&self) -> [u8; 3] {
        let mut hasher = DefaultHasher::new();
        for material in &self.materials {
            if let Some(bound) = &material.bound {
                bound.source.hash(&mut hasher);
            }
            format!("{:?}", material.values).hash(&mut hasher);
        }
        format!("{:?}", self.camera).hash(&mut hasher);
        let h = hasher.finish().to_le_bytes();
        [h[0], h[1], h[2]]
    }
}

impl RenderEngine for MockEngine {
    type Program = MockProgram;

    fn compile(&mut self, source: &ShaderSource) -> ShaderlinkResult<MockProgram> {
        if source.vertex.contains("#error") || source.fragment.contains("#error") {
            return Err(ShaderlinkError::compile([
                "ERROR: 0:1: '#error' : user error",
                "ERROR: 1 compilation errors.  No code generated.",
            ]));
        }
        self.compiles += 1;
        Ok(self.new_program(source))
    }

    fn bind(&mut self, material: MaterialId, program: &MockProgram) -> ShaderlinkResult<()> {
        if self.fail_bind {
            self.fail_bind = false;
            return Err(ShaderlinkError::Render("link failed".into()));
        }
        self.material(material)?;
        self.materials[material.0].bound = Some(program.clone());
        Ok(())
    }

    fn render(&mut self, width: u32, height: u32) -> ShaderlinkResult<RenderedImage> {
        if self.fail_render {
            return Err(ShaderlinkError::Render("device lost".into()));
        }
        self.renders += 1;
        Ok(RenderedImage::solid(width, height, self.frame_color()))
    }

    fn draw(&mut self, _width: u32, _height: u32) -> ShaderlinkResult<()> {
        self.draws += 1;
        Ok(())
    }

    fn regenerate_default_program(
        &mut self,
        material: MaterialId,
    ) -> ShaderlinkResult<GeneratedProgram<MockProgram>> {
        let source = self.material(material)?.generated.clone();
        self.regenerations += 1;
        Ok(GeneratedProgram {
            program: self.new_program(&source),
            source,
        })
    }

    fn materials(&self) -> Vec<MaterialId> {
        (0..self.materials.len()).map(MaterialId).collect()
    }

    fn selected_material(&self) -> Option<MaterialId> {
        self.selected.map(MaterialId)
    }

    fn material_name(&self, material: MaterialId) -> Option<String> {
        self.materials.get(material.0).map(|m| m.name.clone())
    }

    fn parameters(&self, material: MaterialId) -> Vec<ParameterInfo> {
        self.materials
            .get(material.0)
            .map(|m| m.parameters.clone())
            .unwrap_or_default()
    }

    fn parameter_value(&self, material: MaterialId, path: &str) -> ShaderlinkResult<UniformValue> {
        self.material(material)?
            .values
            .get(path)
            .copied()
            .ok_or_else(|| ShaderlinkError::state(format!("unknown parameter '{}'", path)))
    }

    fn set_parameter_value(
        &mut self,
        material: MaterialId,
        path: &str,
        value: UniformValue,
    ) -> ShaderlinkResult<()> {
        self.parameter_value(material, path)?;
        self.materials[material.0].values.insert(path.to_string(), value);
        Ok(())
    }

    fn camera_position(&self) -> Vec3 {
        self.camera
    }

    fn set_camera_position(&mut self, position: Vec3) {
        self.camera = position;
    }
}
