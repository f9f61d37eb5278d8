use utoipa::OpenApi;

use crate::api;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::download::download_audio,
        api::health::health_check,
    ),
    components(
        schemas(
            audio_fetch_types::DownloadRequest,
            audio_fetch_types::ErrorResponse,
            audio_fetch_types::HealthResponse,
        )
    ),
    tags(
        (name = "audio-fetch-server", description = "Audio extraction API")
    )
)]
pub struct ApiDoc;
