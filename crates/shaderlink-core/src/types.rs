use serde::{Deserialize, Serialize};

/// Engine-side handle of a material: its index in the engine's material list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MaterialId(pub usize);

impl std::fmt::Display for MaterialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "material#{}", self.0)
    }
}

/// A vertex + fragment source pair. Equality is exact text equality; this is
/// the program cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShaderSource {
    pub vertex: String,
    pub fragment: String,
}

impl ShaderSource {
    pub fn new(vertex: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self {
            vertex: vertex.into(),
            fragment: fragment.into(),
        }
    }

    /// Replace the stages that are given, keep the others.
    pub fn with_overrides(&self, vertex: Option<&str>, fragment: Option<&str>) -> Self {
        Self {
            vertex: vertex.map_or_else(|| self.vertex.clone(), str::to_string),
            fragment: fragment.map_or_else(|| self.fragment.clone(), str::to_string),
        }
    }
}

/// A three component vector (camera position, colors).
pub type Vec3 = [f32; 3];

/// A mutable material parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum UniformValue {
    Float(f32),
    Color3(Vec3),
    Boolean(bool),
}

impl UniformValue {
    pub fn kind(&self) -> ParameterKind {
        match self {
            UniformValue::Float(_) => ParameterKind::Float,
            UniformValue::Color3(_) => ParameterKind::Color3,
            UniformValue::Boolean(_) => ParameterKind::Boolean,
        }
    }

    /// The value as it appears in control-surface JSON: floats and colors as
    /// number arrays, booleans as a bare bool.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            UniformValue::Float(v) => serde_json::json!([v]),
            UniformValue::Color3(c) => serde_json::json!(c),
            UniformValue::Boolean(b) => serde_json::json!(b),
        }
    }

    /// Parse a control-surface JSON value for a parameter of `kind`.
    ///
    /// Floats are accepted both bare and as a one element array.
    pub fn from_json(kind: &ParameterKind, value: &serde_json::Value) -> Result<Self, String> {
        match kind {
            ParameterKind::Float => {
                let number = match value {
                    serde_json::Value::Array(items) if items.len() == 1 => items[0].as_f64(),
                    other => other.as_f64(),
                };
                number
                    .map(|v| UniformValue::Float(v as f32))
                    .ok_or_else(|| "expected a number or [number]".to_string())
            }
            ParameterKind::Color3 => parse_vec3(value)
                .map(UniformValue::Color3)
                .ok_or_else(|| "expected [r, g, b]".to_string()),
            ParameterKind::Boolean => value
                .as_bool()
                .map(UniformValue::Boolean)
                .ok_or_else(|| "expected a boolean".to_string()),
            ParameterKind::String => Err("string parameters are read-only".to_string()),
            ParameterKind::Unsupported(name) => Err(format!("unsupported parameter type '{name}'")),
        }
    }
}

/// Parse a JSON array of exactly three numbers.
pub fn parse_vec3(value: &serde_json::Value) -> Option<Vec3> {
    let items = value.as_array()?;
    if items.len() != 3 {
        return None;
    }
    Some([
        items[0].as_f64()? as f32,
        items[1].as_f64()? as f32,
        items[2].as_f64()? as f32,
    ])
}

/// The declared type of a material parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterKind {
    Float,
    Color3,
    Boolean,
    /// Resource references (file names and the like). Listed, never mutated.
    String,
    /// Any engine type this control plane does not model.
    Unsupported(String),
}

impl ParameterKind {
    /// Map an engine type name onto a kind. Unknown names are kept verbatim.
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "float" => ParameterKind::Float,
            "color3" => ParameterKind::Color3,
            "boolean" | "bool" => ParameterKind::Boolean,
            "string" | "filename" => ParameterKind::String,
            other => ParameterKind::Unsupported(other.to_string()),
        }
    }

    pub fn is_mutable(&self) -> bool {
        matches!(
            self,
            ParameterKind::Float | ParameterKind::Color3 | ParameterKind::Boolean
        )
    }
}

impl std::fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterKind::Float => write!(f, "float"),
            ParameterKind::Color3 => write!(f, "color3"),
            ParameterKind::Boolean => write!(f, "boolean"),
            ParameterKind::String => write!(f, "string"),
            ParameterKind::Unsupported(name) => write!(f, "{name}"),
        }
    }
}

/// Description of one addressable material parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub path: String,
    pub kind: ParameterKind,
    /// UI range hints, when the material declares them.
    pub ui_min: Option<f32>,
    pub ui_max: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shader_source_overrides() {
        let base = ShaderSource::new("v0", "f0");
        assert_eq!(base.with_overrides(None, Some("f1")), ShaderSource::new("v0", "f1"));
        assert_eq!(base.with_overrides(Some("v1"), None), ShaderSource::new("v1", "f0"));
    }

    #[test]
    fn test_float_accepts_bare_and_array() {
        let kind = ParameterKind::Float;
        assert_eq!(UniformValue::from_json(&kind, &json!(0.5)), Ok(UniformValue::Float(0.5)));
        assert_eq!(UniformValue::from_json(&kind, &json!([2.0])), Ok(UniformValue::Float(2.0)));
        assert!(UniformValue::from_json(&kind, &json!([1.0, 2.0])).is_err());
        assert!(UniformValue::from_json(&kind, &json!("1.0")).is_err());
    }

    #[test]
    fn test_color_requires_three_numbers() {
        let kind = ParameterKind::Color3;
        assert_eq!(
            UniformValue::from_json(&kind, &json!([1, 0.5, 0])),
            Ok(UniformValue::Color3([1.0, 0.5, 0.0]))
        );
        assert!(UniformValue::from_json(&kind, &json!([1, 0.5])).is_err());
        assert!(UniformValue::from_json(&kind, &json!([1, "x", 0])).is_err());
    }

    #[test]
    fn test_read_only_kinds_rejected() {
        assert!(UniformValue::from_json(&ParameterKind::String, &json!("a.png")).is_err());
        let err = UniformValue::from_json(&ParameterKind::Unsupported("matrix44".into()), &json!([]))
            .unwrap_err();
        assert!(err.contains("matrix44"));
    }

    #[test]
    fn test_to_json_shapes() {
        assert_eq!(UniformValue::Float(1.5).to_json(), json!([1.5]));
        assert_eq!(UniformValue::Boolean(true).to_json(), json!(true));
        assert_eq!(UniformValue::Color3([0.0, 1.0, 0.0]).to_json(), json!([0.0, 1.0, 0.0]));
    }
}
