use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::cloud::Cloud;
use crate::config::Config;
use crate::copywriter::{self, CopyRequest};
use crate::debounce::{CommitFn, Debouncer};
use crate::error::{ApiError, GenerationError};
use crate::gallery::{self, CloudGallery, GalleryView, LocalGallery};
use crate::gemini::GenerationGateway;
use crate::models::{Ad, AdCopyVariant, GeneratedImage, GeneratedImageRecord, StyleError, UserSettings};
use crate::storage::ObjectStore;
use crate::{fanout, prompts, store, styles};

/// A not-yet-committed edit of an ad's image instructions.
#[derive(Debug, Clone)]
pub struct InstructionsEdit {
    pub text: Option<String>,
    pub override_global: bool,
}

pub type InstructionsDebouncer = Debouncer<String, InstructionsEdit>;

/// Debouncer that writes instruction edits to the `ads` table, keyed by ad id.
pub fn instructions_debouncer(pool: SqlitePool, delay: Duration) -> InstructionsDebouncer {
    let commit: CommitFn<String, InstructionsEdit> =
        Arc::new(move |ad_id: String, edit: InstructionsEdit| -> BoxFuture<'static, anyhow::Result<()>> {
            let pool = pool.clone();
            Box::pin(async move {
                store::update_ad_image_instructions(&pool, &ad_id, edit.text.as_deref(), edit.override_global).await?;
                debug!(ad_id = %ad_id, "image instructions committed");
                Ok(())
            })
        });
    Debouncer::new(delay, commit)
}

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub gateway: Arc<dyn GenerationGateway>,
    pub objects: Arc<ObjectStore>,
    pub local_gallery: Arc<LocalGallery>,
    /// Present only when a cloud identity is configured.
    pub cloud: Option<Arc<Cloud>>,
    pub instructions: InstructionsDebouncer,
}

impl AppState {
    fn cloud(&self) -> Result<&Arc<Cloud>, ApiError> {
        self.cloud.as_ref().ok_or(ApiError::Unauthenticated)
    }

    fn user_id(&self) -> Result<&str, ApiError> {
        Ok(self.cloud()?.user_id())
    }

    async fn owned_ad(&self, ad_id: &str) -> Result<Ad, ApiError> {
        let user_id = self.user_id()?;
        store::get_ad(&self.pool, user_id, ad_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Ad not found".to_string()))
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/styles", get(list_styles))
        .route("/api/generate-text", post(generate_text))
        .route("/api/generate-images", post(generate_images))
        .route("/api/ads", get(list_ads).post(create_ad))
        .route("/api/ads/{id}", get(get_ad).delete(delete_ad))
        .route("/api/ads/{id}/image-instructions", put(update_image_instructions))
        .route("/api/ads/{id}/batches", get(list_batches).post(create_batch))
        .route("/api/ads/{id}/approve", post(approve_copy))
        .route("/api/ads/{id}/approved", get(get_approved))
        .route("/api/ads/{id}/images", get(list_ad_images).post(generate_ad_images))
        .route("/api/ads/{id}/images/save", post(save_ad_image))
        .route("/api/gallery", get(get_gallery))
        .route("/api/gallery/local", post(save_local_image))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/objects/{*path}", get(get_object))
        .with_state(state)
}

async fn list_styles() -> Json<&'static [styles::AdStyle]> {
    Json(styles::AD_STYLES)
}

// ── Generation ────────────────────────────────────────────────────────

fn text_failure(err: GenerationError) -> ApiError {
    error!(error = %err, "text generation failed");
    ApiError::Internal("حدث خطأ في توليد النص الروسي".to_string())
}

async fn generate_text(
    State(state): State<AppState>,
    Json(request): Json<CopyRequest>,
) -> Result<Json<Vec<AdCopyVariant>>, ApiError> {
    request.validate().map_err(ApiError::BadRequest)?;
    let Some(instructions) = request.instructions() else {
        return Err(ApiError::BadRequest("التعليمات مطلوبة".to_string()));
    };

    let variants = copywriter::generate_variants(
        state.gateway.as_ref(),
        &request,
        instructions,
        state.config.gemini.text_batch_size,
    )
    .await
    .map_err(text_failure)?;

    Ok(Json(variants))
}

#[derive(Debug, Deserialize)]
pub struct GenerateImagesRequest {
    #[serde(default)]
    pub russian_text: Option<String>,
    #[serde(default)]
    pub styles: Option<Vec<Value>>,
    #[serde(default)]
    pub count_per_style: Value,
    #[serde(default)]
    pub visual_instructions: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ImagesResponse<T> {
    pub images: Vec<T>,
    pub style_errors: Vec<StyleError>,
}

/// Non-string entries are ignored; they can never name a catalog style.
fn style_ids(raw: &[Value]) -> Vec<String> {
    raw.iter().filter_map(Value::as_str).map(str::to_string).collect()
}

async fn run_fanout(
    state: &AppState,
    style_ids: &[String],
    raw_count: &Value,
    russian_text: &str,
    instructions: &str,
) -> Result<fanout::FanoutOutcome, ApiError> {
    let limits = &state.config.generation;
    let count = fanout::normalize_count(raw_count, limits.max_count_per_style);
    let plan = fanout::plan(style_ids, count, russian_text, instructions, limits)?;
    let outcome = fanout::run(state.gateway.clone(), plan, limits.mode, limits.max_concurrency)
        .await
        .into_result()?;
    Ok(outcome)
}

async fn generate_images(
    State(state): State<AppState>,
    Json(request): Json<GenerateImagesRequest>,
) -> Result<Json<ImagesResponse<GeneratedImage>>, ApiError> {
    let russian_text = request.russian_text.as_deref().map(str::trim).unwrap_or_default();
    let raw_styles = request.styles.as_deref().unwrap_or_default();
    if russian_text.is_empty() || raw_styles.is_empty() {
        return Err(ApiError::BadRequest("Russian text and styles are required".to_string()));
    }

    let instructions = match request.visual_instructions.as_deref().filter(|i| !i.trim().is_empty()) {
        Some(own) => own.to_string(),
        None => {
            let settings = match &state.cloud {
                Some(cloud) => store::get_user_settings(&state.pool, cloud.user_id()).await?,
                None => None,
            };
            prompts::effective_image_instructions(settings.as_ref(), None)
        }
    };

    let outcome = run_fanout(&state, &style_ids(raw_styles), &request.count_per_style, russian_text, &instructions).await?;
    Ok(Json(ImagesResponse {
        images: outcome.images,
        style_errors: outcome.style_errors,
    }))
}

// ── Ads ───────────────────────────────────────────────────────────────

async fn list_ads(State(state): State<AppState>) -> Result<Json<Vec<Ad>>, ApiError> {
    let ads = store::list_ads(&state.pool, state.user_id()?).await?;
    Ok(Json(ads))
}

#[derive(Debug, Deserialize)]
pub struct CreateAdRequest {
    #[serde(default)]
    pub title: String,
}

async fn create_ad(
    State(state): State<AppState>,
    Json(request): Json<CreateAdRequest>,
) -> Result<(StatusCode, Json<Ad>), ApiError> {
    let title = request.title.trim();
    if title.is_empty() {
        return Err(ApiError::BadRequest("Title is required".to_string()));
    }
    let ad = store::create_ad(&state.pool, state.user_id()?, title).await?;
    info!(ad_id = %ad.id, "ad created");
    Ok((StatusCode::CREATED, Json(ad)))
}

/// The stored ad with any uncommitted instruction edit applied on top.
async fn get_ad(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Ad>, ApiError> {
    let mut ad = state.owned_ad(&id).await?;
    if let Some(edit) = state.instructions.pending(&id) {
        ad.image_instructions = edit.text;
        ad.override_global_image_instructions = edit.override_global;
    }
    Ok(Json(ad))
}

async fn delete_ad(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    // Drop any pending edit so it is not written to a deleted row.
    let _guard = state.instructions.lock_key(&id).await;
    state.instructions.take(&id);
    if !store::delete_ad(&state.pool, state.user_id()?, &id).await? {
        return Err(ApiError::NotFound("Ad not found".to_string()));
    }
    info!(ad_id = %id, "ad deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ImageInstructionsRequest {
    #[serde(default)]
    pub image_instructions: Option<String>,
    #[serde(default)]
    pub override_global: Option<bool>,
}

/// Text edits are debounced; toggling the override flag is written at once together
/// with the latest text, pending or not.
async fn update_image_instructions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ImageInstructionsRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.user_id()?;
    // Read the row only after any in-flight commit for this ad has landed.
    let _guard = state.instructions.lock_key(&id).await;
    let ad = state.owned_ad(&id).await?;

    if let Some(override_global) = request.override_global {
        let pending = state.instructions.take(&id);
        let text = request
            .image_instructions
            .or_else(|| pending.and_then(|edit| edit.text))
            .or(ad.image_instructions);
        store::update_ad_image_instructions(&state.pool, &id, text.as_deref(), override_global).await?;
        info!(ad_id = %id, override_global, "image instructions override updated");
        return Ok((StatusCode::OK, Json(json!({ "status": "saved" }))));
    }

    let Some(text) = request.image_instructions else {
        return Err(ApiError::BadRequest("image_instructions or override_global is required".to_string()));
    };
    let override_global = state
        .instructions
        .pending(&id)
        .map(|edit| edit.override_global)
        .unwrap_or(ad.override_global_image_instructions);
    let text = if text.trim().is_empty() { None } else { Some(text) };
    state.instructions.push(id, InstructionsEdit { text, override_global });
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "pending" }))))
}

// ── Copy batches ──────────────────────────────────────────────────────

async fn list_batches(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<crate::models::CopyBatch>>, ApiError> {
    let ad = state.owned_ad(&id).await?;
    Ok(Json(store::list_copy_batches(&state.pool, &ad.id).await?))
}

/// Generate variants with the request's instructions, falling back to the stored
/// setting and then the default, and keep them as a new batch.
async fn create_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CopyRequest>,
) -> Result<(StatusCode, Json<crate::models::CopyBatch>), ApiError> {
    let ad = state.owned_ad(&id).await?;
    request.validate().map_err(ApiError::BadRequest)?;

    let instructions = match request.instructions() {
        Some(own) => own.to_string(),
        None => {
            let settings = store::get_user_settings(&state.pool, &ad.user_id).await?;
            prompts::effective_text_instructions(settings.as_ref())
        }
    };

    let variants = copywriter::generate_variants(
        state.gateway.as_ref(),
        &request,
        &instructions,
        state.config.gemini.text_batch_size,
    )
    .await
    .map_err(text_failure)?;

    let batch = store::create_copy_batch(
        &state.pool,
        &ad.id,
        &ad.user_id,
        &request.hook,
        &request.offer,
        &request.cta,
        &variants,
    )
    .await?;
    info!(ad_id = %ad.id, batch_id = %batch.id, copies = batch.copies.len(), "copy batch stored");
    Ok((StatusCode::CREATED, Json(batch)))
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub batch_id: String,
    pub copy_index: i64,
}

async fn approve_copy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ApproveRequest>,
) -> Result<Json<Option<crate::models::ApprovedCopy>>, ApiError> {
    let ad = state.owned_ad(&id).await?;
    store::approve_copy(&state.pool, &ad.id, &request.batch_id, request.copy_index).await?;
    info!(ad_id = %ad.id, batch_id = %request.batch_id, index = request.copy_index, "copy approved");
    Ok(Json(store::get_approved_copy(&state.pool, &ad.id).await?))
}

async fn get_approved(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Option<crate::models::ApprovedCopy>>, ApiError> {
    let ad = state.owned_ad(&id).await?;
    Ok(Json(store::get_approved_copy(&state.pool, &ad.id).await?))
}

// ── Ad images ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AdImagesRequest {
    #[serde(default)]
    pub styles: Vec<Value>,
    #[serde(default)]
    pub count_per_style: Value,
}

/// Render the approved copy in the requested styles. Results are drafts until saved.
async fn generate_ad_images(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AdImagesRequest>,
) -> Result<Json<ImagesResponse<GeneratedImageRecord>>, ApiError> {
    let mut ad = state.owned_ad(&id).await?;
    if request.styles.is_empty() {
        return Err(ApiError::BadRequest("Russian text and styles are required".to_string()));
    }
    let Some(approved) = store::get_approved_copy(&state.pool, &ad.id).await? else {
        return Err(ApiError::BadRequest("Approve a copy before generating images".to_string()));
    };

    if let Some(edit) = state.instructions.pending(&id) {
        ad.image_instructions = edit.text;
        ad.override_global_image_instructions = edit.override_global;
    }
    let settings = store::get_user_settings(&state.pool, &ad.user_id).await?;
    let instructions = prompts::effective_image_instructions(settings.as_ref(), Some(&ad));

    let outcome = run_fanout(
        &state,
        &style_ids(&request.styles),
        &request.count_per_style,
        &approved.copy.full_copy_ru,
        &instructions,
    )
    .await?;

    Ok(Json(ImagesResponse {
        images: outcome
            .images
            .iter()
            .map(|img| gallery::create_draft_image(&img.style, &img.url))
            .collect(),
        style_errors: outcome.style_errors,
    }))
}

async fn list_ad_images(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<GeneratedImageRecord>>, ApiError> {
    let ad = state.owned_ad(&id).await?;
    let cloud = state.cloud()?;
    let rows = cloud.list_images(Some(&ad.id)).await?;
    let records = gallery::resolve_remote(rows, &**cloud).await?;
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
pub struct SaveImageRequest {
    pub style: String,
    pub url: String,
    #[serde(default)]
    pub generation_id: Option<String>,
}

async fn save_ad_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SaveImageRequest>,
) -> Result<Json<crate::models::CloudSaveResult>, ApiError> {
    let ad = state.owned_ad(&id).await?;
    let saved = state
        .cloud()?
        .save_image(Some(&ad.id), &request.style, &request.url, request.generation_id.as_deref())
        .await?;
    Ok(Json(saved))
}

// ── Gallery ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GalleryQuery {
    pub ad: Option<String>,
}

async fn get_gallery(State(state): State<AppState>, Query(query): Query<GalleryQuery>) -> Json<GalleryView> {
    let remote = state.cloud.as_deref().map(|c| c as &dyn CloudGallery);
    Json(gallery::load_gallery(&state.local_gallery, remote, query.ad.as_deref()).await)
}

async fn save_local_image(
    State(state): State<AppState>,
    Json(mut record): Json<GeneratedImageRecord>,
) -> Result<Json<Vec<GeneratedImageRecord>>, ApiError> {
    record.is_local_saved = true;
    let id = record.id.clone();
    let all = state.local_gallery.upsert(record)?;
    debug!(id = %id, total = all.len(), "image saved locally");
    Ok(Json(all))
}

// ── Settings ──────────────────────────────────────────────────────────

async fn get_settings(State(state): State<AppState>) -> Result<Json<UserSettings>, ApiError> {
    let user_id = state.user_id()?;
    let settings = store::get_user_settings(&state.pool, user_id).await?.unwrap_or_else(|| UserSettings {
        user_id: user_id.to_string(),
        ..Default::default()
    });
    Ok(Json(settings))
}

#[derive(Debug, Deserialize)]
pub struct SettingsRequest {
    #[serde(default)]
    pub russian_instructions: Option<String>,
    #[serde(default)]
    pub global_image_instructions: Option<String>,
}

async fn put_settings(
    State(state): State<AppState>,
    Json(request): Json<SettingsRequest>,
) -> Result<Json<UserSettings>, ApiError> {
    let settings = store::upsert_user_settings(
        &state.pool,
        state.user_id()?,
        request.russian_instructions.as_deref(),
        request.global_image_instructions.as_deref(),
    )
    .await?;
    Ok(Json(settings))
}

// ── Objects ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ObjectQuery {
    expires: i64,
    sig: String,
}

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()).as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

async fn get_object(State(state): State<AppState>, Path(path): Path<String>, Query(query): Query<ObjectQuery>) -> Response {
    if state.objects.verify(&path, query.expires, &query.sig, Utc::now()).is_err() {
        debug!(path = %path, "rejected object request with bad signature");
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    match state.objects.get(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type_for(&path)),
                (header::CACHE_CONTROL, "private, max-age=3600"),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => {
            warn!(path = %path, error = %e, "signed object not readable");
            (StatusCode::NOT_FOUND, "Not found").into_response()
        }
    }
}
