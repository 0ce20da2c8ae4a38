use axum::{
    extract::{Json, Query},
    http::StatusCode,
    response::Json as ResponseJson,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::config::{is_positive, ConfigLoader, ConfigOverrides, CounterConfig};
use crate::engine::CountingEngine;
use crate::error::CounterError;
use crate::report::{call_webhook, ReportSummary};
use crate::video_source::{probe_video, VideoHealth};

/// Body of `POST /count`, also accepted as the query string of `GET /count/query`.
#[derive(Debug, Clone, Deserialize)]
pub struct CountRequest {
    /// Path of a video readable by the server
    pub input: String,
    /// Calibration record, defaults to the configured one
    pub coords: Option<String>,
    /// Reference directory, defaults to the configured one
    pub refs: Option<String>,
    pub idle_skip_frames: Option<u32>,
    pub cooldown_frames: Option<u32>,
    pub seconds_per_beer: Option<f64>,
}

impl CountRequest {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            idle_skip_frames: self.idle_skip_frames,
            cooldown_frames: self.cooldown_frames,
            seconds_per_beer: self.seconds_per_beer,
            coords_file: self.coords.as_ref().map(PathBuf::from),
            refs_dir: self.refs.as_ref().map(PathBuf::from),
            ..ConfigOverrides::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ReportSummary>,
}

#[derive(Debug, Deserialize)]
pub struct ProbeParams {
    pub input: String,
}

pub async fn health_check() -> &'static str {
    "OK"
}

/// Counts pours in a video that already sits on the server's filesystem.
pub async fn handle_count(
    Json(request): Json<CountRequest>,
) -> Result<ResponseJson<CountResponse>, (StatusCode, String)> {
    info!("📥 [service] count request: {:?}", request);

    let input = PathBuf::from(&request.input);
    if !input.exists() {
        return Err((
            StatusCode::NOT_FOUND,
            format!("input video not found: {}", request.input),
        ));
    }

    if let Some(seconds_per_beer) = request.seconds_per_beer {
        if !is_positive(seconds_per_beer) {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("seconds_per_beer must be a positive number, got {}", seconds_per_beer),
            ));
        }
    }

    let config = ConfigLoader::load_config(None, request.overrides()).map_err(|e| {
        error!("❌ [service] failed to load config: {:#}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to load config: {}", e))
    })?;

    let summary = run_count(input, &config).await?;

    if let Some(webhook_url) = &config.webhook_url {
        if let Err(e) = call_webhook(webhook_url, &request.input, &summary).await {
            warn!("⚠️  [service] webhook failed: {:#}", e);
        }
    }

    Ok(ResponseJson(CountResponse {
        success: true,
        message: format!(
            "counted {} beer(s) (A: {}, B: {})",
            summary.total, summary.count_a, summary.count_b
        ),
        result: Some(summary),
    }))
}

/// `GET` form of [`handle_count`], handy for quick manual checks.
pub async fn handle_count_query(
    Query(request): Query<CountRequest>,
) -> Result<ResponseJson<CountResponse>, (StatusCode, String)> {
    handle_count(Json(request)).await
}

pub async fn handle_probe(
    Query(params): Query<ProbeParams>,
) -> Result<ResponseJson<VideoHealth>, (StatusCode, String)> {
    let input = PathBuf::from(&params.input);
    if !input.exists() {
        return Err((
            StatusCode::NOT_FOUND,
            format!("input video not found: {}", params.input),
        ));
    }

    let health = tokio::task::spawn_blocking(move || probe_video(&input))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("probe task failed: {}", e)))?
        .map_err(|e| (status_for(&e), format!("probe failed: {}", e)))?;

    Ok(ResponseJson(health))
}

/// Runs one counting pass on a blocking worker thread.
async fn run_count(input: PathBuf, config: &CounterConfig) -> Result<ReportSummary, (StatusCode, String)> {
    let engine = CountingEngine::from_files(&config.coords_file, &config.refs_dir, config.engine())
        .map_err(|e| {
            error!(
                "❌ [service] cannot load calibration {}: {}",
                config.coords_file.display(),
                e
            );
            (
                status_for(&e),
                format!("cannot load calibration {}: {}", config.coords_file.display(), e),
            )
        })?;

    let report = tokio::task::spawn_blocking(move || engine.process_video(&input, |_| {}))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("counting task failed: {}", e)))?
        .map_err(|e| {
            error!("❌ [service] counting failed: {}", e);
            (status_for(&e), format!("counting failed: {}", e))
        })?;

    Ok(report.summary())
}

fn status_for(err: &CounterError) -> StatusCode {
    match err {
        CounterError::VideoOpen { .. } | CounterError::NoVideoStream => StatusCode::UNPROCESSABLE_ENTITY,
        CounterError::Calibration { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(input: &str) -> CountRequest {
        CountRequest {
            input: input.to_string(),
            coords: None,
            refs: None,
            idle_skip_frames: None,
            cooldown_frames: None,
            seconds_per_beer: None,
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        assert_eq!(health_check().await, "OK");
    }

    #[tokio::test]
    async fn test_missing_video_is_not_found() {
        let missing = std::env::temp_dir()
            .join(uuid::Uuid::new_v4().to_string())
            .join("clip.mp4");
        let err = handle_count(Json(request(&missing.display().to_string())))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let err = handle_probe(Query(ProbeParams {
            input: missing.display().to_string(),
        }))
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    /// A temp dir holding a stand-in video file, which only has to exist.
    fn temp_input() -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir()
            .join("pour-counter-handler")
            .join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir).unwrap();
        let input = dir.join("clip.mp4");
        std::fs::write(&input, b"not a video").unwrap();
        (dir, input)
    }

    #[tokio::test]
    async fn test_malformed_calibration_is_bad_request() {
        let (dir, input) = temp_input();
        let coords = dir.join("coords_dual.txt");
        std::fs::write(&coords, "10,10,abc,20|1,2,3,4|1920,1080\n").unwrap();

        let mut req = request(&input.display().to_string());
        req.coords = Some(coords.display().to_string());
        req.refs = Some(dir.display().to_string());
        let err = handle_count(Json(req)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST, "{}", err.1);
        assert!(err.1.contains("calibration"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_unusable_seconds_per_beer_is_bad_request() {
        let (dir, input) = temp_input();
        for bad in [0.0, -12.0] {
            let mut req = request(&input.display().to_string());
            req.seconds_per_beer = Some(bad);
            let err = handle_count(Json(req)).await.unwrap_err();
            assert_eq!(err.0, StatusCode::BAD_REQUEST);
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_request_fields_become_overrides() {
        let mut req = request("clip.mp4");
        req.refs = Some("/srv/refs".to_string());
        req.idle_skip_frames = Some(5);

        let overrides = req.overrides();
        assert_eq!(overrides.refs_dir, Some(PathBuf::from("/srv/refs")));
        assert_eq!(overrides.idle_skip_frames, Some(5));
        assert_eq!(overrides.coords_file, None);
        assert_eq!(overrides.webhook_url, None);
    }

    #[test]
    fn test_optional_request_fields() {
        let req: CountRequest =
            serde_json::from_value(serde_json::json!({ "input": "a.mp4", "cooldown_frames": 12 })).unwrap();
        assert_eq!(req.cooldown_frames, Some(12));
        assert!(req.coords.is_none());
    }

    #[test]
    fn test_error_status_mapping() {
        let open = CounterError::VideoOpen {
            path: "x.mp4".to_string(),
            reason: "Invalid data".to_string(),
        };
        assert_eq!(status_for(&open), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(&CounterError::Decode("bad".to_string())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
