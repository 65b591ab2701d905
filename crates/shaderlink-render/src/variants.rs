//! Batch rendering of variants.
//!
//! Each variant optionally overrides shaders and uniforms, then renders one
//! frame. A variant whose overrides fail is skipped and the batch goes on.
//! Output is either base64 inline in the response or written back to back
//! into a caller-owned shared-memory segment.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use shaderlink_core::{
    check_dimensions, RenderEngine, RenderedImage, ShaderlinkError, ShaderlinkResult,
};

use crate::session::{EngineSession, OneOrMany, ShaderEdit, UniformAssignment};
use crate::shm::SharedSegment;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VariantSpec {
    #[serde(default)]
    pub shader: Option<OneOrMany<ShaderEdit>>,
    #[serde(default)]
    pub uniforms: Option<Vec<UniformAssignment>>,
}

/// Metadata of one rendered variant. `data` is present only for inline output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantOutput {
    pub variant: usize,
    pub width: u32,
    pub height: u32,
    pub offset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

enum Sink {
    Inline,
    Mapped(SharedSegment),
}

impl Sink {
    fn write(&mut self, offset: usize, image: &RenderedImage) -> ShaderlinkResult<Option<String>> {
        match self {
            Sink::Inline => Ok(Some(STANDARD.encode(&image.pixels))),
            Sink::Mapped(segment) => {
                segment.write_at(offset, &image.pixels)?;
                Ok(None)
            }
        }
    }
}

/// Apply a variant's shader edits, then its uniforms. When the uniforms are
/// rejected the shader edits are reverted, so a skipped variant leaves the
/// session as it found it.
fn apply_overrides<E: RenderEngine>(
    session: &mut EngineSession<E>,
    spec: &VariantSpec,
) -> ShaderlinkResult<()> {
    let undo = match &spec.shader {
        Some(edits) => Some(session.apply_shader_edits_with_undo(edits.as_slice())?),
        None => None,
    };
    if let Some(assignments) = &spec.uniforms {
        if let Err(e) = session.set_uniforms(assignments) {
            if let Some(undo) = undo {
                session.undo_shader_edits(undo);
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Render `variants` in order at `width`x`height`.
///
/// With `mapfile`, exactly `width*height*3*variants.len()` bytes of it are
/// mapped and the pixels of successful variants are packed from offset 0.
/// The mapping is released before this returns, whatever the outcome.
/// Overrides applied by a variant stay in effect after the batch.
pub fn render_variants<E: RenderEngine>(
    session: &mut EngineSession<E>,
    width: u32,
    height: u32,
    variants: &[VariantSpec],
    mapfile: Option<&str>,
) -> ShaderlinkResult<Vec<VariantOutput>> {
    check_dimensions(width, height)?;
    if variants.is_empty() {
        return Err(ShaderlinkError::validation("variants must not be empty"));
    }
    let frame_len = RenderedImage::byte_len(width, height);

    let mut sink = match mapfile {
        Some(name) => {
            let total = frame_len
                .checked_mul(variants.len())
                .ok_or_else(|| ShaderlinkError::validation("batch output size overflows"))?;
            Sink::Mapped(SharedSegment::open(name, total)?)
        }
        None => Sink::Inline,
    };

    let mut outputs = Vec::with_capacity(variants.len());
    let mut offset = 0;
    for (index, spec) in variants.iter().enumerate() {
        if let Err(e) = apply_overrides(session, spec) {
            if !e.is_variant_local() {
                return Err(e);
            }
            tracing::warn!("variant {} skipped: {}", index, e);
            continue;
        }

        let image = session.render(width, height)?;
        let data = sink.write(offset, &image)?;
        outputs.push(VariantOutput {
            variant: index,
            width,
            height,
            offset,
            data,
        });
        offset += frame_len;
    }

    if let Sink::Mapped(segment) = &sink {
        segment.flush()?;
    }
    tracing::info!(
        "rendered {}/{} variants at {}x{}",
        outputs.len(),
        variants.len(),
        width,
        height
    );
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ResetOptions;
    use crate::test_support::MockEngine;
    use serde_json::json;

    fn session() -> EngineSession<MockEngine> {
        EngineSession::new(MockEngine::new())
    }

    fn specs() -> Vec<VariantSpec> {
        serde_json::from_value(json!([
            {"shader": {"fragment": "f1"}},
            {"shader": {"fragment": "#error broken"}},
            {"uniforms": [{"name": "roughness", "value": "rough"}]},
            {"uniforms": [{"name": "roughness", "value": 0.75}]},
        ]))
        .unwrap()
    }

    #[test]
    fn test_inline_batch_skips_failed_variants() {
        let mut s = session();
        let out = render_variants(&mut s, 4, 2, &specs(), None).unwrap();

        assert_eq!(out.iter().map(|o| o.variant).collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(out.iter().map(|o| o.offset).collect::<Vec<_>>(), vec![0, 24]);
        for entry in &out {
            let decoded = STANDARD.decode(entry.data.as_ref().unwrap()).unwrap();
            assert_eq!(decoded.len(), (entry.width * entry.height * 3) as usize);
        }
        assert_eq!(s.engine().renders, 2);
    }

    #[test]
    fn test_overrides_persist_after_batch() {
        let mut s = session();
        render_variants(&mut s, 1, 1, &specs(), None).unwrap();
        let report = s.shader_report().unwrap();
        assert_eq!(report.fragment.as_deref(), Some("f1"));
        let roughness = s
            .engine()
            .parameter_value(shaderlink_core::MaterialId(0), "roughness")
            .unwrap();
        assert_eq!(roughness, shaderlink_core::UniformValue::Float(0.75));
    }

    #[test]
    fn test_skipped_variant_reverts_its_shader_edit() {
        let mut s = session();
        s.reset(ResetOptions::default()).unwrap();
        let before = s.engine().bound(shaderlink_core::MaterialId(0)).cloned();
        let variants: Vec<VariantSpec> = serde_json::from_value(json!([
            {"shader": {"fragment": "leaked"}, "uniforms": [{"name": "roughness", "value": "bad"}]},
            {},
        ]))
        .unwrap();

        let out = render_variants(&mut s, 2, 2, &variants, None).unwrap();
        assert_eq!(out.iter().map(|o| o.variant).collect::<Vec<_>>(), vec![1]);

        let after = s.engine().bound(shaderlink_core::MaterialId(0)).cloned();
        assert_eq!(after, before);
        assert_ne!(s.shader_report().unwrap().fragment.as_deref(), Some("leaked"));

        // Same frame as a session that never saw the skipped variant.
        let mut clean = session();
        clean.reset(ResetOptions::default()).unwrap();
        let expected = render_variants(&mut clean, 2, 2, &[VariantSpec::default()], None).unwrap();
        assert_eq!(out[0].data, expected[0].data);
    }

    #[test]
    fn test_mapped_batch_packs_successful_variants() {
        let path = std::env::temp_dir().join("shaderlink_test_variants.bin");
        let frame = RenderedImage::byte_len(4, 2);
        std::fs::write(&path, vec![0xAAu8; frame * 4]).unwrap();

        let mut mapped = session();
        let out =
            render_variants(&mut mapped, 4, 2, &specs(), Some(path.to_str().unwrap())).unwrap();
        assert!(out.iter().all(|o| o.data.is_none()));

        let mut inline = session();
        let expected = render_variants(&mut inline, 4, 2, &specs(), None).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let mut packed = Vec::new();
        for entry in &expected {
            packed.extend(STANDARD.decode(entry.data.as_ref().unwrap()).unwrap());
        }
        assert_eq!(&bytes[..packed.len()], packed.as_slice());
        // Slots of skipped variants at the tail are left untouched.
        assert!(bytes[packed.len()..].iter().all(|b| *b == 0xAA));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_bad_mapfile_renders_nothing() {
        let mut s = session();
        let err = render_variants(&mut s, 2, 2, &specs(), Some("/nonexistent/shaderlink.bin"))
            .unwrap_err();
        assert!(matches!(err, ShaderlinkError::Resource(_)));
        assert_eq!(s.engine().renders, 0);
        assert_eq!(s.engine().compiles, 0);
    }

    #[test]
    fn test_render_failure_aborts_batch() {
        let path = std::env::temp_dir().join("shaderlink_test_variants_fail.bin");
        std::fs::write(&path, vec![0u8; 2 * 2 * 3 * 4]).unwrap();
        let mut s = session();
        s.engine_mut().fail_render = true;
        let err = render_variants(&mut s, 2, 2, &specs(), Some(path.to_str().unwrap()))
            .unwrap_err();
        assert!(matches!(err, ShaderlinkError::Render(_)));
        // The segment was released; the file can be replaced and read back.
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_empty_batch_and_bad_dimensions_are_rejected() {
        let mut s = session();
        assert!(matches!(
            render_variants(&mut s, 2, 2, &[], None),
            Err(ShaderlinkError::Validation(_))
        ));
        assert!(matches!(
            render_variants(&mut s, 0, 2, &[VariantSpec::default()], None),
            Err(ShaderlinkError::Validation(_))
        ));
    }
}
