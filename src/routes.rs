use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    routing::{get, post},
    Json,
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    http_objects::{JobQueueStatus, ZipAccepted, ZipRequestBody, ZipperAPIError},
    zipper::Zipper,
};

#[derive(OpenApi)]
#[openapi(
        paths(
            create_zip,
            disk_space_check,
            list_downloadable,
            job_queue,
        ),
        components(
            schemas(
                ZipRequestBody,
                ZipAccepted,
                JobQueueStatus,
                ZipperAPIError,
            )
        ),
        tags(
            (name = "zipper", description = "Zipper API")
        )
    )]
struct ApiDoc;

#[derive(Clone)]
pub struct RouteState {
    pub zipper: Arc<Zipper>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/docs/swagger").url("/docs/openapi.json", ApiDoc::openapi()))
        .route("/", get(index))
        .route(
            "/zipping",
            post(create_zip).with_state(route_state.clone()),
        )
        .route(
            "/disk-space-check",
            post(disk_space_check).with_state(route_state.clone()),
        )
        .route(
            "/downloadable/{user_id}",
            get(list_downloadable).with_state(route_state.clone()),
        )
        .route(
            "/job-queue/{user_id}",
            get(job_queue).with_state(route_state.clone()),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn index() -> &'static str {
    "zipper server"
}

/// Queue an archive of the requested files
#[utoipa::path(
    post,
    path = "/zipping",
    tag = "zipper",
    request_body = ZipRequestBody,
    responses(
        (status = 202, description = "Archive job accepted", body = ZipAccepted),
        (status = BAD_REQUEST, description = "Invalid request"),
        (status = INSUFFICIENT_STORAGE, description = "Not enough scratch space"),
        (status = SERVICE_UNAVAILABLE, description = "Worker queue is full"),
        (status = BAD_GATEWAY, description = "Object store unavailable")
    ),
)]
async fn create_zip(
    State(state): State<RouteState>,
    Json(body): Json<ZipRequestBody>,
) -> Result<(StatusCode, Json<ZipAccepted>), ZipperAPIError> {
    let job_id = state.zipper.submit(body.into()).await?;
    Ok((StatusCode::ACCEPTED, Json(job_id.into())))
}

/// Check whether the requested files fit into the scratch space
#[utoipa::path(
    post,
    path = "/disk-space-check",
    tag = "zipper",
    request_body = ZipRequestBody,
    responses(
        (status = 200, description = "True when the archive fits", body = bool),
        (status = BAD_REQUEST, description = "Invalid request"),
        (status = NOT_FOUND, description = "A requested object does not exist")
    ),
)]
async fn disk_space_check(
    State(state): State<RouteState>,
    Json(body): Json<ZipRequestBody>,
) -> Result<Json<bool>, ZipperAPIError> {
    let fits = state.zipper.check_capacity(&body.into()).await?;
    Ok(Json(fits))
}

/// List the archives ready for download
#[utoipa::path(
    get,
    path = "/downloadable/{user_id}",
    tag = "zipper",
    params(("user_id" = String, Path, description = "Owner of the archives")),
    responses(
        (status = 200, description = "Archive names", body = Vec<String>),
        (status = BAD_GATEWAY, description = "Object store unavailable")
    ),
)]
async fn list_downloadable(
    State(state): State<RouteState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<String>>, ZipperAPIError> {
    let names = state.zipper.downloadable(&user_id).await?;
    Ok(Json(names))
}

/// Status of the user's oldest archive job. A finished job is reported once.
#[utoipa::path(
    get,
    path = "/job-queue/{user_id}",
    tag = "zipper",
    params(("user_id" = String, Path, description = "Owner of the jobs")),
    responses(
        (status = 200, description = "Oldest job, or an empty object", body = JobQueueStatus)
    ),
)]
async fn job_queue(
    State(state): State<RouteState>,
    Path(user_id): Path<String>,
) -> Json<JobQueueStatus> {
    Json(state.zipper.poll(&user_id).into())
}
