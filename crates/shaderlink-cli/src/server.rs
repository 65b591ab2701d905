// ─── shaderlink control server ──────────────────────────────────────
//
// HTTP surface of the engine thread. Every route parses and validates its
// body here, then submits exactly one task to the dispatcher and maps the
// outcome to a status code. Routes answer both GET and POST.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{AppendHeaders, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use shaderlink_core::{
    check_dimensions, DispatchError, RenderEngine, RenderedImage, ShaderlinkConfig,
    ShaderlinkError, ShaderlinkResult, Vec3,
};
use shaderlink_render::{
    render_variants, run_benchmark, BenchmarkRequest, EngineSession, GpuEngineHandle, OneOrMany,
    ResetOptions, ShaderEdit, ShutdownMode, UniformAssignment, VariantSpec,
};

// ── Shared state ────────────────────────────────────────────────────

#[derive(Clone)]
struct AppState {
    engine: Arc<GpuEngineHandle>,
    default_size: (u32, u32),
    max_variants: usize,
}

// ── Errors ──────────────────────────────────────────────────────────

/// A failed request: status from the error kind, plain-text body.
#[derive(Debug)]
pub struct ApiError(pub ShaderlinkError);

impl From<ShaderlinkError> for ApiError {
    fn from(error: ShaderlinkError) -> Self {
        Self(error)
    }
}

pub fn status_for(error: &ShaderlinkError) -> StatusCode {
    match error {
        ShaderlinkError::Validation(_) | ShaderlinkError::Resource(_) => StatusCode::BAD_REQUEST,
        ShaderlinkError::Compile { .. } => StatusCode::IM_A_TEAPOT,
        ShaderlinkError::State(_) => StatusCode::CONFLICT,
        ShaderlinkError::Dispatch(DispatchError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!("request failed ({}): {}", status, self.0);
        } else {
            tracing::warn!("request rejected ({}): {}", status, self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

// ── Request bodies ──────────────────────────────────────────────────

pub fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ShaderlinkError::validation(format!("malformed JSON body: {}", e)).into())
}

/// Like [`parse_json`], but an empty body means all defaults.
pub fn parse_json_or_default<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_json(body)
}

#[derive(Debug, Default, Deserialize)]
pub struct ScreenshotRequest {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub z: Option<f32>,
    pub variants: Option<Vec<VariantSpec>>,
    pub mapfile: Option<String>,
}

impl ScreenshotRequest {
    /// Camera position after applying the given coordinates to `current`, or
    /// `None` when the request names no coordinate.
    pub fn camera(&self, current: Vec3) -> Option<Vec3> {
        if self.x.is_none() && self.y.is_none() && self.z.is_none() {
            return None;
        }
        Some([
            self.x.unwrap_or(current[0]),
            self.y.unwrap_or(current[1]),
            self.z.unwrap_or(current[2]),
        ])
    }
}

// ── Entry point ─────────────────────────────────────────────────────

fn router(state: AppState) -> Router {
    Router::new()
        .route("/reset", get(reset).post(reset))
        .route("/regenerate", get(regenerate).post(regenerate))
        .route("/getshader", get(get_shader).post(get_shader))
        .route("/getuniforms", get(get_uniforms).post(get_uniforms))
        .route("/setuniforms", get(set_uniforms).post(set_uniforms))
        .route("/setshader", get(set_shader).post(set_shader))
        .route("/screenshot", get(screenshot).post(screenshot))
        .route("/metrics", get(metrics).post(metrics))
        .with_state(state)
}

pub async fn run_server(engine: Arc<GpuEngineHandle>, config: &ShaderlinkConfig) -> Result<()> {
    let state = AppState {
        engine: engine.clone(),
        default_size: (config.render.width, config.render.height),
        max_variants: config.render.max_variants,
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!("invalid listen address {}:{}", config.server.host, config.server.port)
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    println!("📡 Shaderlink listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    println!("   Draining engine queue...");
    tokio::task::spawn_blocking(move || engine.shutdown(ShutdownMode::Drain))
        .await
        .context("engine shutdown task failed")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown requested");
}

// ── Handlers ────────────────────────────────────────────────────────

async fn reset(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ApiError> {
    let options: ResetOptions = parse_json_or_default(&body)?;
    state.engine.call(move |s| s.reset(options)).await?;
    Ok(StatusCode::OK)
}

async fn regenerate(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.engine.call(|s| s.regenerate()).await?;
    Ok(StatusCode::OK)
}

async fn get_shader(State(state): State<AppState>) -> Result<Response, ApiError> {
    let report = state.engine.call(|s| s.shader_report()).await?;
    Ok(Json(report).into_response())
}

async fn get_uniforms(State(state): State<AppState>) -> Result<Response, ApiError> {
    let uniforms = state.engine.call(|s| s.uniform_report()).await?;
    Ok(Json(uniforms).into_response())
}

async fn set_uniforms(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ApiError> {
    let assignments: Vec<UniformAssignment> = parse_json(&body)?;
    state
        .engine
        .call(move |s| s.set_uniforms(&assignments))
        .await?;
    Ok(StatusCode::OK)
}

async fn set_shader(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ApiError> {
    let edits: OneOrMany<ShaderEdit> = parse_json(&body)?;
    state
        .engine
        .call(move |s| s.apply_shader_edits(edits.as_slice()))
        .await?;
    Ok(StatusCode::OK)
}

async fn screenshot(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let mut request: ScreenshotRequest = parse_json_or_default(&body)?;
    let width = request.width.unwrap_or(state.default_size.0);
    let height = request.height.unwrap_or(state.default_size.1);
    check_dimensions(width, height)?;

    if let Some(variants) = request.variants.take() {
        if variants.len() > state.max_variants {
            return Err(ShaderlinkError::validation(format!(
                "{} variants requested, at most {} allowed",
                variants.len(),
                state.max_variants
            ))
            .into());
        }
        let mapfile = request.mapfile.take();
        let outputs = state
            .engine
            .call(move |s| render_variants(s, width, height, &variants, mapfile.as_deref()))
            .await?;
        return Ok(Json(outputs).into_response());
    }

    let image = state
        .engine
        .call(move |s| legacy_screenshot(s, &request, width, height))
        .await?;
    Ok(raw_image_response(image))
}

/// Single-frame screenshot: move the camera to whatever coordinates the
/// request names, then render.
fn legacy_screenshot<E: RenderEngine>(
    session: &mut EngineSession<E>,
    request: &ScreenshotRequest,
    width: u32,
    height: u32,
) -> ShaderlinkResult<RenderedImage> {
    let camera = request.camera(session.engine().camera_position());
    session.screenshot(width, height, camera)
}

fn raw_image_response(image: RenderedImage) -> Response {
    (
        AppendHeaders([
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::SET_COOKIE, format!("width={}", image.width)),
            (header::SET_COOKIE, format!("height={}", image.height)),
        ]),
        image.pixels,
    )
        .into_response()
}

async fn metrics(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request: BenchmarkRequest = parse_json_or_default(&body)?;
    request.validate()?;
    let report = state
        .engine
        .call(move |s| run_benchmark(s, &request))
        .await?;
    Ok(Json(serde_json::json!({ "speed": report.speed })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shaderlink_core::{GeneratedProgram, MaterialId, ParameterInfo, ShaderSource, UniformValue};
    use shaderlink_render::Dispatcher;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ShaderlinkError::validation("x"), StatusCode::BAD_REQUEST),
            (ShaderlinkError::resource("x"), StatusCode::BAD_REQUEST),
            (ShaderlinkError::compile(["a", "b"]), StatusCode::IM_A_TEAPOT),
            (ShaderlinkError::state("x"), StatusCode::CONFLICT),
            (DispatchError::Closed.into(), StatusCode::SERVICE_UNAVAILABLE),
            (DispatchError::Abandoned.into(), StatusCode::INTERNAL_SERVER_ERROR),
            (ShaderlinkError::Render("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(status_for(&error), status, "{error}");
        }
    }

    #[test]
    fn test_compile_error_is_teapot() {
        let response = ApiError(ShaderlinkError::compile(["line one", "line two"])).into_response();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }

    #[test]
    fn test_empty_body_means_defaults() {
        let options: ResetOptions = parse_json_or_default(b"").unwrap();
        assert_eq!(options, ResetOptions::default());
        let bench: BenchmarkRequest = parse_json_or_default(b"  \n").unwrap();
        assert_eq!(bench, BenchmarkRequest::default());
    }

    #[test]
    fn test_malformed_body_is_validation_error() {
        let err = parse_json::<Vec<UniformAssignment>>(b"{not json").unwrap_err();
        assert!(matches!(err.0, ShaderlinkError::Validation(_)));
        let err = parse_json::<Vec<UniformAssignment>>(b"").unwrap_err();
        assert!(matches!(err.0, ShaderlinkError::Validation(_)));
        let err = parse_json::<Vec<UniformAssignment>>(br#"[{"value": 1}]"#).unwrap_err();
        assert!(matches!(err.0, ShaderlinkError::Validation(_)));
    }

    #[test]
    fn test_set_shader_body_forms() {
        let one: OneOrMany<ShaderEdit> = parse_json(br#"{"vertex": "v"}"#).unwrap();
        assert_eq!(one.as_slice()[0].vertex.as_deref(), Some("v"));
        let many: OneOrMany<ShaderEdit> =
            parse_json(br#"[{"material-idx": 0, "fragment": "a"}, {"material-idx": 1}]"#).unwrap();
        assert_eq!(many.as_slice().len(), 2);
    }

    #[test]
    fn test_screenshot_camera_fills_missing_axes() {
        let request: ScreenshotRequest = parse_json(br#"{"x": 1.5, "width": 64}"#).unwrap();
        assert_eq!(request.width, Some(64));
        assert_eq!(request.camera([0.0, 2.0, 3.0]), Some([1.5, 2.0, 3.0]));

        let request: ScreenshotRequest = parse_json_or_default(b"").unwrap();
        assert_eq!(request.camera([0.0, 2.0, 3.0]), None);
    }

    #[test]
    fn test_screenshot_batch_body() {
        let request: ScreenshotRequest = parse_json(
            br#"{
                "width": 8, "height": 8, "mapfile": "/shaderlink-frames",
                "variants": [
                    {"shader": {"fragment": "f"}},
                    {"shader": [{"material-idx": 1, "vertex": "v"}]},
                    {"uniforms": [{"name": "roughness", "value": [0.3]}]},
                    {}
                ]
            }"#,
        )
        .unwrap();
        let variants = request.variants.unwrap();
        assert_eq!(variants.len(), 4);
        assert_eq!(variants[1].shader.as_ref().unwrap().as_slice()[0].material_idx, Some(1));
        assert!(variants[3].shader.is_none() && variants[3].uniforms.is_none());
        assert_eq!(request.mapfile.as_deref(), Some("/shaderlink-frames"));
    }

    /// One material, no parameters; frames are tinted by the camera position.
    struct StubEngine {
        camera: Vec3,
    }

    impl RenderEngine for StubEngine {
        type Program = ();

        fn compile(&mut self, _source: &ShaderSource) -> ShaderlinkResult<()> {
            Ok(())
        }

        fn bind(&mut self, _material: MaterialId, _program: &()) -> ShaderlinkResult<()> {
            Ok(())
        }

        fn render(&mut self, width: u32, height: u32) -> ShaderlinkResult<RenderedImage> {
            let [x, y, z] = self.camera.map(|c| (c * 10.0) as u8);
            Ok(RenderedImage::solid(width, height, [x, y, z]))
        }

        fn regenerate_default_program(
            &mut self,
            _material: MaterialId,
        ) -> ShaderlinkResult<GeneratedProgram<()>> {
            Ok(GeneratedProgram {
                program: (),
                source: ShaderSource::new("// vertex", "// fragment"),
            })
        }

        fn materials(&self) -> Vec<MaterialId> {
            vec![MaterialId(0)]
        }

        fn selected_material(&self) -> Option<MaterialId> {
            Some(MaterialId(0))
        }

        fn material_name(&self, _material: MaterialId) -> Option<String> {
            Some("plain".into())
        }

        fn parameters(&self, _material: MaterialId) -> Vec<ParameterInfo> {
            Vec::new()
        }

        fn parameter_value(&self, _material: MaterialId, path: &str) -> ShaderlinkResult<UniformValue> {
            Err(ShaderlinkError::state(format!("unknown parameter '{}'", path)))
        }

        fn set_parameter_value(
            &mut self,
            _material: MaterialId,
            path: &str,
            _value: UniformValue,
        ) -> ShaderlinkResult<()> {
            Err(ShaderlinkError::state(format!("unknown parameter '{}'", path)))
        }

        fn camera_position(&self) -> Vec3 {
            self.camera
        }

        fn set_camera_position(&mut self, position: Vec3) {
            self.camera = position;
        }
    }

    #[tokio::test]
    async fn test_legacy_screenshot_moves_named_axes_only() {
        let engine = Dispatcher::spawn("test-engine", || {
            Ok(EngineSession::new(StubEngine {
                camera: [1.0, 2.0, 3.0],
            }))
        })
        .unwrap();

        let request: ScreenshotRequest = parse_json(br#"{"width": 3, "height": 2, "y": 5.0}"#).unwrap();
        let image = engine
            .call(move |s| legacy_screenshot(s, &request, 3, 2))
            .await
            .unwrap();
        assert_eq!((image.width, image.height), (3, 2));
        assert_eq!(image.get_pixel(0, 0), Some([10, 50, 30]));

        let request = ScreenshotRequest::default();
        let camera = engine
            .call(move |s| {
                legacy_screenshot(s, &request, 1, 1)?;
                Ok(s.engine().camera_position())
            })
            .await
            .unwrap();
        assert_eq!(camera, [1.0, 5.0, 3.0]);

        engine.shutdown(ShutdownMode::Drain);
    }

    #[test]
    fn test_raw_image_response_sets_size_cookies() {
        let response = raw_image_response(RenderedImage::solid(3, 2, [1, 2, 3]));
        let cookies: Vec<_> = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(cookies, vec!["width=3", "height=2"]);
    }
}
