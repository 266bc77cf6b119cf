use actix_web::web::Bytes;
use actix_web::http::{header, StatusCode};
use actix_web::{web, App, HttpResponse, HttpServer};
use async_stream::stream;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{ConfigStore, SettingsUpdate};
use crate::snapshot::LiveState;
use crate::supervisor::JobSupervisor;
use crate::sync::{sync_once, SettingsSource};
use crate::video::sanitize_filename;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub live: Arc<LiveState>,
    pub supervisor: Arc<JobSupervisor>,
    pub settings_source: Option<Arc<dyn SettingsSource>>,
    pub upload_dir: PathBuf,
    pub stream_interval: Duration,
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/live-data", web::get().to(live_data))
        .route("/heatmap_data", web::get().to(heatmap_data))
        .route("/processed-video", web::get().to(processed_video))
        .route("/frame.jpg", web::get().to(frame_handler))
        .route("/analytics-data", web::get().to(analytics_data))
        .route("/status", web::get().to(status_handler))
        .route("/api/system-settings", web::get().to(get_settings))
        .route("/api/system-settings", web::post().to(update_settings))
        .route("/bridge/system-settings", web::get().to(bridge_settings))
        .route("/upload", web::post().to(upload));
}

pub async fn run(state: AppState, bind: &str, max_upload_bytes: usize) -> std::io::Result<()> {
    let data = web::Data::new(state);
    info!(%bind, "HTTP server listening");
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .app_data(web::PayloadConfig::new(max_upload_bytes))
            .configure(routes)
    })
    .bind(bind)?
    .run()
    .await
}

fn error_body(status: StatusCode, msg: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(json!({ "error": msg.into() }))
}

async fn live_data(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.live.counts())
}

async fn heatmap_data(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.live.heatmap())
}

async fn analytics_data(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.live.analytics())
}

async fn status_handler(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.supervisor.status())
}

async fn frame_handler(state: web::Data<AppState>) -> HttpResponse {
    match state.live.frame() {
        Some(jpeg) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .body(jpeg.as_ref().clone()),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn processed_video(state: web::Data<AppState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(state.stream_interval);
        let mut last: Option<Arc<Vec<u8>>> = None;
        loop {
            interval.tick().await;
            let Some(jpeg) = state.live.frame() else {
                continue;
            };
            if last.as_ref().is_some_and(|prev| Arc::ptr_eq(prev, &jpeg)) {
                continue;
            }
            let mut payload = Vec::with_capacity(jpeg.len() + 64);
            payload.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            payload.extend_from_slice(&jpeg);
            payload.extend_from_slice(b"\r\n");
            last = Some(jpeg);
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

async fn get_settings(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.config.get())
}

async fn update_settings(
    state: web::Data<AppState>,
    body: web::Json<SettingsUpdate>,
) -> HttpResponse {
    match state.config.update(&body) {
        Ok(cfg) => {
            info!(
                confidence = cfg.detection.confidence,
                sample_rate = cfg.detection.sample_rate,
                max_occupancy = cfg.detection.max_occupancy,
                "live config updated directly"
            );
            HttpResponse::Ok().json(json!({ "status": "success", "settings": cfg }))
        }
        Err(err) => error_body(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

async fn bridge_settings(state: web::Data<AppState>) -> HttpResponse {
    let Some(source) = state.settings_source.clone() else {
        return error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "settings sync is disabled",
        );
    };
    let config = Arc::clone(&state.config);
    match web::block(move || sync_once(source.as_ref(), &config)).await {
        Ok(Ok(cfg)) => HttpResponse::Ok().json(json!({ "status": "synced", "settings": cfg })),
        Ok(Err(err)) => {
            warn!("manual settings sync failed: {err:#}");
            error_body(StatusCode::BAD_GATEWAY, format!("{err:#}"))
        }
        Err(err) => error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    filename: Option<String>,
}

async fn upload(
    state: web::Data<AppState>,
    query: web::Query<UploadQuery>,
    body: Bytes,
) -> HttpResponse {
    if body.is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "empty upload");
    }
    let Some(name) = query.filename.as_deref().and_then(sanitize_filename) else {
        return error_body(StatusCode::BAD_REQUEST, "missing or invalid filename");
    };
    let file_name = format!("{}_{}", Utc::now().format("%Y%m%d%H%M%S%3f"), name);
    let path = state.upload_dir.join(&file_name);
    let dir = state.upload_dir.clone();
    let supervisor = Arc::clone(&state.supervisor);

    let res = web::block(move || -> anyhow::Result<u64> {
        std::fs::create_dir_all(&dir)?;
        std::fs::write(&path, &body)?;
        supervisor.submit(path)
    })
    .await;

    match res {
        Ok(Ok(job_id)) => HttpResponse::Ok().json(json!({
            "status": "processing",
            "job_id": job_id,
            "file": file_name,
        })),
        Ok(Err(err)) => {
            warn!("upload handling failed: {err:#}");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
        }
        Err(err) => error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeatmapConfig, JobConfig, LiveConfig};
    use crate::detector::Detector;
    use crate::job::{JobContext, PipelineFactory};
    use crate::persist::NullSink;
    use crate::sync::SettingEntry;
    use crate::tracker::Tracker;
    use crate::video::FrameSource;
    use actix_web::test;
    use anyhow::{anyhow, Result};
    use std::path::Path;

    struct NoVideo;

    impl PipelineFactory for NoVideo {
        fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
            Err(anyhow!("Could not open video {}", path.display()))
        }
        fn detector(&self) -> Result<Box<dyn Detector>> {
            Err(anyhow!("unused"))
        }
        fn tracker(&self) -> Result<Box<dyn Tracker>> {
            Err(anyhow!("unused"))
        }
    }

    struct Offline;

    impl SettingsSource for Offline {
        fn fetch_grouped(&self) -> Result<Vec<SettingEntry>> {
            Err(anyhow!("connection refused"))
        }
    }

    fn state(source: Option<Arc<dyn SettingsSource>>) -> AppState {
        let config = Arc::new(ConfigStore::new(LiveConfig::default()));
        let live = Arc::new(LiveState::new(&HeatmapConfig::default()));
        let ctx = JobContext {
            config: config.clone(),
            live: live.clone(),
            sink: Arc::new(NullSink),
            factory: Arc::new(NoVideo),
            heatmap: HeatmapConfig::default(),
            job: JobConfig::default(),
            target_class: 0,
        };
        let upload_dir = std::env::temp_dir().join(format!(
            "crowd-analytics-test-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or(0)
        ));
        AppState {
            config,
            live,
            supervisor: Arc::new(JobSupervisor::new(ctx)),
            settings_source: source,
            upload_dir,
            stream_interval: Duration::from_millis(10),
        }
    }

    #[actix_web::test]
    async fn polls_start_from_zero() {
        let data = web::Data::new(state(None));
        let app = test::init_service(App::new().app_data(data.clone()).configure(routes)).await;

        let req = test::TestRequest::get().uri("/live-data").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!({"entered": 0, "exited": 0, "inside": 0}));

        let req = test::TestRequest::get().uri("/heatmap_data").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["rows"], 5);
        assert_eq!(body["cols"], 8);
        assert_eq!(body["zones"].as_array().map(|z| z.len()), Some(40));

        let req = test::TestRequest::get().uri("/frame.jpg").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let req = test::TestRequest::get().uri("/status").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["phase"], "idle");
    }

    #[actix_web::test]
    async fn settings_update_validates_before_applying() {
        let data = web::Data::new(state(None));
        let app = test::init_service(App::new().app_data(data.clone()).configure(routes)).await;
        let before = data.config.get();

        let req = test::TestRequest::post()
            .uri("/api/system-settings")
            .set_json(json!({"confidence": 0.3, "fps": 2}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(data.config.get(), before);

        let req = test::TestRequest::post()
            .uri("/api/system-settings")
            .set_json(json!({"confidence": "0.3", "fps": 2, "max_people": 40}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let req = test::TestRequest::get().uri("/api/system-settings").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["sample_rate"], 2);
        assert_eq!(body["max_occupancy"], 40);
        assert_eq!(body["alerts"]["email"], true);
    }

    #[actix_web::test]
    async fn manual_sync_reports_upstream_failure() {
        let data = web::Data::new(state(None));
        let app = test::init_service(App::new().app_data(data.clone()).configure(routes)).await;
        let req = test::TestRequest::get().uri("/bridge/system-settings").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let data = web::Data::new(state(Some(Arc::new(Offline))));
        let app = test::init_service(App::new().app_data(data.clone()).configure(routes)).await;
        let req = test::TestRequest::get().uri("/bridge/system-settings").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[actix_web::test]
    async fn upload_rejects_empty_and_starts_job() {
        let data = web::Data::new(state(None));
        let app = test::init_service(App::new().app_data(data.clone()).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/upload?filename=clip.mp4")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/upload")
            .set_payload("not really a video")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/upload?filename=../clip.mp4")
            .set_payload("not really a video")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["job_id"], 1);
        assert!(body["file"].as_str().unwrap().ends_with("_clip.mp4"));

        // the bogus file cannot be opened; the job ends and leaves the reset state
        let summary = data.supervisor.wait().unwrap();
        assert!(matches!(summary.outcome, crate::job::JobOutcome::OpenFailed(_)));
        assert_eq!(data.live.counts().inside, 0);
        assert_eq!(data.live.generation(), 1);
        let _ = std::fs::remove_dir_all(&data.upload_dir);
    }
}
