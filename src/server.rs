//! HTTP サーバー（フロントエンドからの推論・設定リクエストを受け付ける）

use std::sync::Arc;

use actix_cors::Cors;
use actix_multipart::Multipart;
use actix_web::{get, http::StatusCode, post, web, App, HttpResponse, HttpServer, ResponseError};
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::error::{PipelineError, SettingsError};
use crate::model::{ServerSettings, Settings, SettingsStore};
use crate::pipeline::InferencePipeline;
use crate::types::PredictionResult;

/// リクエスト間で共有する状態
#[derive(Debug, Clone)]
pub struct AppState {
    pub pipeline: InferencePipeline,
    pub settings: Arc<SettingsStore>,
}

impl AppState {
    pub fn new(pipeline: InferencePipeline, settings: Arc<SettingsStore>) -> Self {
        Self { pipeline, settings }
    }
}

/// ハンドラのエラー（`{"error": "..."}` として返す）
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("No file part")]
    NoFilePart,

    #[error("No selected file")]
    NoSelectedFile,

    #[error("failed to read upload: {0}")]
    Upload(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("inference worker failed: {0}")]
    Worker(String),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NoFilePart
            | ApiError::NoSelectedFile
            | ApiError::Upload(_)
            | ApiError::Settings(_) => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(_) | ApiError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

/// multipart の `file` フィールドを読み込む
async fn read_file_field(mut payload: Multipart) -> Result<Vec<u8>, ApiError> {
    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|e| ApiError::Upload(e.to_string()))?;
        if field.name() != Some("file") {
            continue;
        }

        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .unwrap_or_default();
        if filename.is_empty() {
            return Err(ApiError::NoSelectedFile);
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| ApiError::Upload(e.to_string()))?;
            bytes.extend_from_slice(&chunk);
        }
        return Ok(bytes);
    }
    Err(ApiError::NoFilePart)
}

fn log_failure(endpoint: &str, err: &ApiError) {
    if err.status_code().is_server_error() {
        log::error!("{} failed: {}", endpoint, err);
    } else {
        log::warn!("{} rejected: {}", endpoint, err);
    }
}

#[get("/")]
pub async fn index(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "running",
        "message": "SmartCattle AI Backend is Active",
        "models_loaded": state.pipeline.status(),
    }))
}

#[get("/settings")]
pub async fn get_settings(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.settings.get().as_ref())
}

#[post("/settings")]
pub async fn update_settings(
    state: web::Data<AppState>,
    body: web::Json<Value>,
) -> Result<HttpResponse, ApiError> {
    let updated = state.settings.update(&body).map_err(|e| {
        let err = ApiError::from(e);
        log_failure("/settings", &err);
        err
    })?;
    Ok(HttpResponse::Ok().json(json!({ "status": "success", "config": updated.as_ref() })))
}

/// アップロードされた画像に対してパイプラインを実行する
///
/// `settings` はアップロードの受信前に取得したスナップショット。
async fn classify_upload(
    pipeline: InferencePipeline,
    settings: Arc<Settings>,
    payload: Multipart,
) -> Result<PredictionResult, ApiError> {
    let image = read_file_field(payload).await?;
    let result = tokio::task::spawn_blocking(move || pipeline.run(&image, &settings))
        .await
        .map_err(|e| ApiError::Worker(e.to_string()))??;
    Ok(result)
}

#[post("/predict")]
pub async fn predict(state: web::Data<AppState>, payload: Multipart) -> Result<HttpResponse, ApiError> {
    // 閾値はリクエスト開始時点のスナップショットを使う
    let settings = state.settings.get();
    let result = classify_upload(state.pipeline.clone(), settings, payload)
        .await
        .inspect_err(|e| log_failure("/predict", e))?;

    Ok(HttpResponse::Ok().json(result))
}

#[post("/predict_weight")]
pub async fn predict_weight(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let result = async {
        let image = read_file_field(payload).await?;
        let pipeline = state.pipeline.clone();
        let result = tokio::task::spawn_blocking(move || pipeline.predict_weight(&image))
            .await
            .map_err(|e| ApiError::Worker(e.to_string()))??;
        Ok::<_, ApiError>(result)
    }
    .await
    .inspect_err(|e| log_failure("/predict_weight", e))?;

    Ok(HttpResponse::Ok().json(result))
}

/// ルーティング
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(index)
        .service(get_settings)
        .service(update_settings)
        .service(predict)
        .service(predict_weight);
}

pub async fn startup(server: &ServerSettings, state: AppState) -> std::io::Result<()> {
    let app_state = web::Data::new(state);

    log::info!("Starting server at {}:{}", server.host, server.port);

    HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .wrap(Cors::permissive())
            .app_data(app_state.clone())
            .configure(configure)
    })
    .bind((server.host.as_str(), server.port))?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::preprocess::tests::solid_png;
    use crate::model::{Capability, ModelRegistry};
    use crate::pipeline::tests::{logits_for_confidence, Fixed};
    use crate::types::{Breed, DetectionStatus};
    use actix_web::error::PayloadError;
    use actix_web::http::header::{HeaderMap, HeaderValue};
    use actix_web::web::Bytes;
    use actix_web::{http::header, test};

    const BOUNDARY: &str = "smartcattleboundary";

    fn multipart_body(field: &str, filename: &str, data: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: image/png\r\n\r\n",
            BOUNDARY, field, filename
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn upload(uri: &str, field: &str, filename: &str, data: &[u8]) -> test::TestRequest {
        test::TestRequest::post()
            .uri(uri)
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(multipart_body(field, filename, data))
    }

    fn state(validator: Capability, breed: Capability, weight: Capability) -> AppState {
        let registry = ModelRegistry::new(validator, breed, weight);
        AppState::new(
            InferencePipeline::new(Arc::new(registry)),
            Arc::new(SettingsStore::default()),
        )
    }

    fn non_bovine_state() -> AppState {
        let mut logits = vec![0.0; 1000];
        logits[1] = 10.0;
        state(
            Capability::Available(Arc::new(Fixed(logits))),
            Capability::unavailable("missing"),
            Capability::Available(Arc::new(Fixed(vec![0.5]))),
        )
    }

    #[actix_web::test]
    async fn test_index_reports_models() {
        let app = test::init_service(
            App::new().app_data(web::Data::new(non_bovine_state())).configure(configure),
        )
        .await;
        let resp: Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/").to_request()).await;

        assert_eq!(resp["status"], "running");
        assert_eq!(resp["models_loaded"]["validator"], true);
        assert_eq!(resp["models_loaded"]["breed"], false);
        assert_eq!(resp["models_loaded"]["weight"], true);
    }

    #[actix_web::test]
    async fn test_settings_update_merges_known_keys() {
        let app = test::init_service(
            App::new().app_data(web::Data::new(non_bovine_state())).configure(configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/settings")
            .set_json(json!({ "ai_threshold": 90, "bogus_key": 1 }))
            .to_request();
        let resp: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["status"], "success");
        assert_eq!(resp["config"]["ai_threshold"], 90.0);
        assert!(resp["config"].get("bogus_key").is_none());

        let current: Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/settings").to_request()).await;
        assert_eq!(current["ai_threshold"], 90.0);
        assert_eq!(current["language"], "English");
    }

    #[actix_web::test]
    async fn test_settings_invalid_value_is_bad_request() {
        let app = test::init_service(
            App::new().app_data(web::Data::new(non_bovine_state())).configure(configure),
        )
        .await;
        let req = test::TestRequest::post()
            .uri("/settings")
            .set_json(json!({ "ai_threshold": 150 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_predict_non_cattle() {
        let app = test::init_service(
            App::new().app_data(web::Data::new(non_bovine_state())).configure(configure),
        )
        .await;
        let png = solid_png(32, 32, [0, 128, 255]);
        let resp: Value = test::call_and_read_body_json(&app, upload("/predict", "file", "cow.png", &png).to_request()).await;

        assert_eq!(resp["is_cow"], false);
        assert_eq!(resp["status"], "Non-Cattle Detected");
        assert_eq!(resp["breed"], "Undefined");
        assert!(resp.get("estimated_weight").is_none());
    }

    #[actix_web::test]
    async fn test_predict_requires_file_part() {
        let app = test::init_service(
            App::new().app_data(web::Data::new(non_bovine_state())).configure(configure),
        )
        .await;

        let resp = test::call_service(&app, upload("/predict", "image", "cow.png", b"x").to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "No file part");

        let resp = test::call_service(&app, upload("/predict", "file", "", b"x").to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "No selected file");
    }

    #[actix_web::test]
    async fn test_predict_invalid_image_is_bad_request() {
        let app = test::init_service(
            App::new().app_data(web::Data::new(non_bovine_state())).configure(configure),
        )
        .await;
        let resp = test::call_service(&app, upload("/predict", "file", "cow.png", b"not an image").to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_predict_weight_without_model() {
        let app_state = AppState::new(
            InferencePipeline::new(Arc::new(ModelRegistry::unavailable("missing"))),
            Arc::new(SettingsStore::default()),
        );
        let app = test::init_service(App::new().app_data(web::Data::new(app_state)).configure(configure)).await;
        let png = solid_png(16, 16, [10, 10, 10]);

        let resp = test::call_service(&app, upload("/predict_weight", "file", "cow.png", &png).to_request()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "Weight model not loaded");
    }

    #[actix_web::test]
    async fn test_predict_weight() {
        let app = test::init_service(
            App::new().app_data(web::Data::new(non_bovine_state())).configure(configure),
        )
        .await;
        let png = solid_png(16, 16, [10, 10, 10]);
        let resp: Value =
            test::call_and_read_body_json(&app, upload("/predict_weight", "file", "cow.png", &png).to_request()).await;
        assert_eq!(resp["estimated_weight"], 500.0);
        assert_eq!(resp["unit"], "kg");
    }

    #[actix_web::test]
    async fn test_predict_keeps_snapshot_taken_before_upload() {
        let store = Arc::new(SettingsStore::default());
        let registry = ModelRegistry::new(
            Capability::unavailable("missing"),
            Capability::Available(Arc::new(Fixed(logits_for_confidence(0, 0.95)))),
            Capability::unavailable("missing"),
        );
        let pipeline = InferencePipeline::new(Arc::new(registry));

        let snapshot = store.get();
        // アップロード受信中に閾値が変更される
        let body = multipart_body("file", "cow.png", &solid_png(16, 16, [90, 60, 30]));
        let updater = Arc::clone(&store);
        let stream = futures_util::stream::once(async move {
            updater.update(&json!({ "ai_threshold": 99 })).unwrap();
            Ok::<_, PayloadError>(Bytes::from(body))
        });
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&format!("multipart/form-data; boundary={}", BOUNDARY)).unwrap(),
        );

        let result = classify_upload(pipeline, snapshot, Multipart::new(&headers, stream))
            .await
            .unwrap();
        assert_eq!(store.get().ai_threshold, 99.0);
        assert_eq!(result.status, DetectionStatus::CattleDetected);
        assert_eq!(result.breed, Some(Breed::Gir));
    }
}
