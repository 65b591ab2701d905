//! First-seen parameter values, kept so that reset is exact.
//!
//! The engine's authored defaults go stale once live edits happen, so the
//! store remembers the value each parameter had the first time the control
//! plane saw it and restores exactly that.

use std::collections::{BTreeMap, HashMap};

use shaderlink_core::{MaterialId, RenderEngine, ShaderlinkError, ShaderlinkResult, UniformValue};

#[derive(Debug, Default)]
pub struct UniformStore {
    snapshots: HashMap<MaterialId, BTreeMap<String, UniformValue>>,
}

impl UniformStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the snapshot for `path`, capturing `current` if there is none.
    pub fn observe_or_capture(
        &mut self,
        material: MaterialId,
        path: &str,
        current: UniformValue,
    ) -> UniformValue {
        *self
            .snapshots
            .entry(material)
            .or_default()
            .entry(path.to_string())
            .or_insert(current)
    }

    pub fn snapshot(&self, material: MaterialId, path: &str) -> Option<UniformValue> {
        self.snapshots.get(&material)?.get(path).copied()
    }

    /// Set `path` to `value`, capturing the pre-override value first.
    pub fn apply_override<E: RenderEngine>(
        &mut self,
        engine: &mut E,
        material: MaterialId,
        path: &str,
        value: UniformValue,
    ) -> ShaderlinkResult<()> {
        let current = engine.parameter_value(material, path)?;
        if current.kind() != value.kind() {
            return Err(ShaderlinkError::validation(format!(
                "Invalid {} value for {}",
                current.kind(),
                path
            )));
        }
        self.observe_or_capture(material, path, current);
        engine.set_parameter_value(material, path, value)
    }

    /// Re-apply every captured value of `material`. Snapshots are kept, so
    /// repeated resets return to the same baseline. Returns how many
    /// parameters were restored.
    pub fn restore_defaults<E: RenderEngine>(
        &self,
        engine: &mut E,
        material: MaterialId,
    ) -> ShaderlinkResult<usize> {
        let Some(captured) = self.snapshots.get(&material) else {
            return Ok(0);
        };
        for (path, value) in captured {
            engine.set_parameter_value(material, path, *value)?;
        }
        tracing::debug!("{}: restored {} parameters", material, captured.len());
        Ok(captured.len())
    }

    /// Forget every snapshot of `material`. The next observation re-derives
    /// them from the engine.
    pub fn clear(&mut self, material: MaterialId) {
        self.snapshots.remove(&material);
    }

    pub fn captured_count(&self, material: MaterialId) -> usize {
        self.snapshots.get(&material).map_or(0, BTreeMap::len)
    }
}
