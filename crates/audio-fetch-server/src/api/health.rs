use actix_web::{HttpResponse, Responder, get};
use audio_fetch_types::HealthResponse;

/// Liveness check.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Server is up", body = HealthResponse)
    )
)]
#[get("/health")]
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse::ok())
}
