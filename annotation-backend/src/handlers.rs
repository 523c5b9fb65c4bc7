use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{header, request::Parts, StatusCode},
    response::IntoResponse,
    Json,
};
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use unified_detector::AnnotationKind;
use uuid::Uuid;

use crate::annotations::{self, AnnotationPatch, NewAnnotation};
use crate::error::{AppError, AppResult, PipelineError};
use crate::materials::{self, LinkPatch, LinkReport, LinkRequest};
use crate::models::{AnnotationRecord, BlueprintImage, Material, MaterialLink, PipelineState, PipelineStatus, Role, User};
use crate::store::CalibrationUpdate;
use crate::units::DEFAULT_SCALE;
use crate::AppState;

pub const REQUESTER_HEADER: &str = "x-user-id";

/// Identity of the caller, taken from the `x-user-id` header
#[derive(Debug, Clone, Copy)]
pub struct Requester(pub Uuid);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Requester {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(REQUESTER_HEADER)
            .ok_or_else(|| AppError::Unauthorized(format!("missing {} header", REQUESTER_HEADER)))?;

        raw.to_str()
            .ok()
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .map(Requester)
            .ok_or_else(|| AppError::Unauthorized(format!("malformed {} header", REQUESTER_HEADER)))
    }
}

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
    pub role: Role,
}

pub async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> AppResult<(StatusCode, Json<User>)> {
    let user = User {
        id: Uuid::new_v4(),
        name: req.name,
        email: req.email,
        role: req.role,
    };
    state.store.insert_user(user.clone())?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Debug, Deserialize)]
pub struct CreateMaterialRequest {
    pub name: String,
    pub unit: String,
}

pub async fn create_material(
    State(state): State<AppState>,
    Json(req): Json<CreateMaterialRequest>,
) -> AppResult<(StatusCode, Json<Material>)> {
    if req.name.trim().is_empty() {
        return Err(PipelineError::Validation("material name is required".to_string()).into());
    }

    let material = Material {
        id: Uuid::new_v4(),
        name: req.name,
        unit: req.unit,
        created_at: Utc::now(),
    };
    state.store.insert_material(material.clone())?;
    Ok((StatusCode::CREATED, Json(material)))
}

#[derive(Debug, Deserialize)]
pub struct RegisterImageRequest {
    pub title: String,
    pub owner_id: Uuid,
    #[serde(default)]
    pub dpi: Option<u32>,
    #[serde(default)]
    pub scale: Option<f64>,
    /// Base64-encoded PNG or JPEG
    pub image: String,
}

pub async fn register_image(
    State(state): State<AppState>,
    Json(req): Json<RegisterImageRequest>,
) -> AppResult<(StatusCode, Json<BlueprintImage>)> {
    state.store.user(req.owner_id)?;
    if req.dpi == Some(0) {
        return Err(PipelineError::Validation("dpi must be positive".to_string()).into());
    }
    let scale = req.scale.unwrap_or(DEFAULT_SCALE);
    if !(scale.is_finite() && scale > 0.0) {
        return Err(PipelineError::Validation("scale must be positive".to_string()).into());
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(req.image.as_bytes())
        .map_err(|e| AppError::BadRequest(format!("Failed to decode base64: {}", e)))?;
    let decoded = image::load_from_memory(&bytes)
        .map_err(|e| AppError::BadRequest(format!("Failed to decode image: {}", e)))?;

    let now = Utc::now();
    let image = BlueprintImage {
        id: Uuid::new_v4(),
        title: req.title,
        owner_id: req.owner_id,
        dpi: req.dpi,
        scale: Some(scale),
        width: decoded.width(),
        height: decoded.height(),
        is_verified: false,
        pipeline: PipelineStatus::default(),
        created_at: now,
        updated_at: now,
    };
    state.store.insert_image(image.clone(), bytes)?;

    info!(
        image_id = %image.id,
        "Registered blueprint image '{}' ({}x{}, dpi={:?}, scale={})",
        image.title, image.width, image.height, image.dpi, scale
    );
    Ok((StatusCode::CREATED, Json(image)))
}

pub async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<BlueprintImage>> {
    Ok(Json(state.store.image(id)?))
}

pub async fn delete_image(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let image = state.store.image(id)?;
    crate::access::authorize(state.store.as_ref(), &image, requester)?;
    state.store.delete_image(id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub image_id: Uuid,
    pub status: String,
    pub state: PipelineState,
}

pub async fn trigger_annotation(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Path(id): Path<Uuid>,
) -> AppResult<(StatusCode, Json<TriggerResponse>)> {
    let pipeline_state = state.pipeline.trigger(id, requester)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            image_id: id,
            status: "queued".to_string(),
            state: pipeline_state,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct CalibrationRequest {
    #[serde(default)]
    pub dpi: Option<u32>,
    #[serde(default)]
    pub scale: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct CalibrationResponse {
    #[serde(flatten)]
    pub update: CalibrationUpdate,
    pub image: BlueprintImage,
}

pub async fn update_calibration(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Path(id): Path<Uuid>,
    Json(req): Json<CalibrationRequest>,
) -> AppResult<Json<CalibrationResponse>> {
    let update = state
        .pipeline
        .orchestrator()
        .update_calibration(id, requester, req.dpi, req.scale)?;

    Ok(Json(CalibrationResponse {
        update,
        image: state.store.image(id)?,
    }))
}

pub async fn verify_image(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Path(id): Path<Uuid>,
) -> AppResult<Json<BlueprintImage>> {
    Ok(Json(state.pipeline.orchestrator().verify(id, requester)?))
}

#[derive(Debug, Serialize)]
pub struct ImageAnnotations {
    pub room: Vec<AnnotationRecord>,
    pub wall: Vec<AnnotationRecord>,
    pub window_door: Vec<AnnotationRecord>,
}

pub async fn list_annotations(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ImageAnnotations>> {
    state.store.image(id)?;
    Ok(Json(ImageAnnotations {
        room: state.store.annotations(id, AnnotationKind::Room)?,
        wall: state.store.annotations(id, AnnotationKind::Wall)?,
        window_door: state.store.annotations(id, AnnotationKind::WindowDoor)?,
    }))
}

pub async fn get_export(
    State(state): State<AppState>,
    Path((id, kind)): Path<(Uuid, AnnotationKind)>,
) -> AppResult<impl IntoResponse> {
    let artifact = state.store.export(id, kind)?;
    let disposition = format!("attachment; filename=\"{}\"", artifact.file_name);

    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        artifact.content,
    ))
}

pub async fn create_annotation(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Path(kind): Path<AnnotationKind>,
    Json(input): Json<NewAnnotation>,
) -> AppResult<(StatusCode, Json<AnnotationRecord>)> {
    let record = annotations::create_annotation(state.store.as_ref(), kind, requester, input)?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn update_annotation(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Path((kind, id)): Path<(AnnotationKind, Uuid)>,
    Json(patch): Json<AnnotationPatch>,
) -> AppResult<Json<AnnotationRecord>> {
    let record = annotations::update_annotation(state.store.as_ref(), kind, id, requester, patch)?;
    Ok(Json(record))
}

pub async fn delete_annotation(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Path((kind, id)): Path<(AnnotationKind, Uuid)>,
) -> AppResult<StatusCode> {
    annotations::delete_annotation(state.store.as_ref(), kind, id, requester)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_materials(
    State(state): State<AppState>,
    Path((kind, id)): Path<(AnnotationKind, Uuid)>,
) -> AppResult<Json<Vec<MaterialLink>>> {
    Ok(Json(materials::list_links(state.store.as_ref(), kind, id)?))
}

/// Accepts a single link request or a list of them
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum LinkPayload {
    Many(Vec<LinkRequest>),
    One(LinkRequest),
}

pub async fn link_materials(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Path((kind, id)): Path<(AnnotationKind, Uuid)>,
    Json(payload): Json<LinkPayload>,
) -> AppResult<(StatusCode, Json<LinkReport>)> {
    let requests = match payload {
        LinkPayload::Many(requests) => requests,
        LinkPayload::One(request) => vec![request],
    };

    let report = materials::link_materials(state.store.as_ref(), kind, id, requester, requests)?;
    let status = if report.created.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(report)))
}

pub async fn update_material_link(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Path((kind, id, material_id)): Path<(AnnotationKind, Uuid, Uuid)>,
    Json(patch): Json<LinkPatch>,
) -> AppResult<Json<MaterialLink>> {
    let link = materials::update_link(state.store.as_ref(), kind, id, material_id, requester, patch)?;
    Ok(Json(link))
}

pub async fn unlink_material(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Path((kind, id, material_id)): Path<(AnnotationKind, Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    materials::unlink(state.store.as_ref(), kind, id, material_id, requester)?;
    Ok(StatusCode::NO_CONTENT)
}
