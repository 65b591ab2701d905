use serde::{Deserialize, Serialize};

use crate::error::{ShaderlinkError, ShaderlinkResult};
use crate::types::{ParameterInfo, ParameterKind, UniformValue};

/// Largest accepted render dimension, per axis.
pub const MAX_DIMENSION: u32 = 8192;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RenderConfig {
    /// Default output size when a request does not specify one.
    pub width: u32,
    pub height: u32,
    /// Upper bound on the number of variants in one batch screenshot.
    pub max_variants: usize,
    pub power_preference: String, // "high" | "low"
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            max_variants: 64,
            power_preference: "high".to_string(),
        }
    }
}

/// One declared material parameter.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParameterConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub min: Option<f32>,
    #[serde(default)]
    pub max: Option<f32>,
}

impl ParameterConfig {
    pub fn info(&self) -> ParameterInfo {
        ParameterInfo {
            path: self.name.clone(),
            kind: ParameterKind::from_type_name(&self.kind),
            ui_min: self.min,
            ui_max: self.max,
        }
    }

    /// The authored value, or the zero value of the kind when none is given.
    /// `None` for kinds that carry no mutable value.
    pub fn initial_value(&self) -> ShaderlinkResult<Option<UniformValue>> {
        let kind = ParameterKind::from_type_name(&self.kind);
        let zero = match kind {
            ParameterKind::Float => UniformValue::Float(0.0),
            ParameterKind::Color3 => UniformValue::Color3([0.0; 3]),
            ParameterKind::Boolean => UniformValue::Boolean(false),
            ParameterKind::String | ParameterKind::Unsupported(_) => return Ok(None),
        };
        match &self.default {
            None => Ok(Some(zero)),
            Some(value) => UniformValue::from_json(&kind, value).map(Some).map_err(|e| {
                ShaderlinkError::Config(format!("parameter '{}': {}", self.name, e))
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MaterialConfig {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterConfig>,
}

impl Default for MaterialConfig {
    fn default() -> Self {
        let param = |name: &str, kind: &str, default: serde_json::Value, min, max| ParameterConfig {
            name: name.to_string(),
            kind: kind.to_string(),
            default: Some(default),
            min,
            max,
        };
        Self {
            name: "standard_surface".to_string(),
            parameters: vec![
                param("base_color", "color3", serde_json::json!([0.8, 0.8, 0.8]), Some(0.0), Some(1.0)),
                param("roughness", "float", serde_json::json!(0.5), Some(0.0), Some(1.0)),
                param("emission", "float", serde_json::json!(0.0), Some(0.0), Some(10.0)),
                param("checker", "boolean", serde_json::json!(false), None, None),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShaderlinkConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default = "default_materials")]
    pub materials: Vec<MaterialConfig>,
}

fn default_materials() -> Vec<MaterialConfig> {
    vec![MaterialConfig::default()]
}

impl Default for ShaderlinkConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            render: RenderConfig::default(),
            materials: default_materials(),
        }
    }
}

impl ShaderlinkConfig {
    pub fn load_from_file(path: &std::path::Path) -> ShaderlinkResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ShaderlinkConfig =
            toml::from_str(&contents).map_err(|e| ShaderlinkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &std::path::Path) -> ShaderlinkResult<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ShaderlinkError::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> ShaderlinkResult<()> {
        if self.materials.is_empty() {
            return Err(ShaderlinkError::Config("at least one material is required".into()));
        }
        check_dimensions(self.render.width, self.render.height)
            .map_err(|e| ShaderlinkError::Config(e.to_string()))?;
        for material in &self.materials {
            for param in &material.parameters {
                param.initial_value()?;
            }
        }
        Ok(())
    }
}

/// Reject render sizes outside `[1, MAX_DIMENSION]`.
pub fn check_dimensions(width: u32, height: u32) -> ShaderlinkResult<()> {
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(ShaderlinkError::validation(format!(
            "dimensions {}x{} outside [1, {}]",
            width, height, MAX_DIMENSION
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: ShaderlinkConfig = toml::from_str(
            r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.render.width, 512);
        assert_eq!(config.materials.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_materials() {
        let config: ShaderlinkConfig = toml::from_str(
            r#"
            [[materials]]
            name = "glass"

            [[materials.parameters]]
            name = "ior"
            type = "float"
            default = 1.5
            min = 1.0
            max = 3.0

            [[materials.parameters]]
            name = "tint"
            type = "color3"
            default = [0.9, 1.0, 0.9]

            [[materials.parameters]]
            name = "albedo_map"
            type = "filename"
            "#,
        )
        .unwrap();
        let glass = &config.materials[0];
        assert_eq!(glass.parameters.len(), 3);
        assert_eq!(glass.parameters[0].initial_value().unwrap(), Some(UniformValue::Float(1.5)));
        assert_eq!(glass.parameters[1].info().kind, ParameterKind::Color3);
        assert_eq!(glass.parameters[2].initial_value().unwrap(), None);
    }

    #[test]
    fn test_bad_default_rejected() {
        let config: ShaderlinkConfig = toml::from_str(
            r#"
            [[materials]]
            name = "m"
            [[materials.parameters]]
            name = "tint"
            type = "color3"
            default = [1.0]
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ShaderlinkError::Config(_))));
    }

    #[test]
    fn test_dimension_bounds() {
        assert!(check_dimensions(1, 8192).is_ok());
        assert!(check_dimensions(0, 10).is_err());
        assert!(check_dimensions(10, 8193).is_err());
    }
}
