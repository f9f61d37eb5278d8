//! Audio download handler.

use actix_web::body::SizedStream;
use actix_web::http::header::{self, ContentDisposition, DispositionParam, DispositionType};
use actix_web::{HttpResponse, Responder, post, web};
use audio_fetch_types::{DownloadRequest, ErrorResponse};

use crate::artifact::Artifact;
use crate::extractor::AUDIO_EXTENSION;
use crate::job::JobId;
use crate::response_gate::JobReply;
use crate::state::AppState;

/// Header carrying the sanitized media title.
pub const TITLE_HEADER: &str = "X-Video-Title";

/// Download the audio track of a media URL as 16-bit 44.1 kHz WAV.
///
/// The request stays open for the whole extraction; the response is the
/// file itself, or a JSON error body.
#[utoipa::path(
    post,
    path = "/download",
    request_body = DownloadRequest,
    responses(
        (status = 200, description = "WAV audio stream (audio/wav)"),
        (status = 400, description = "Missing URL or malformed body", body = ErrorResponse),
        (status = 500, description = "Extraction or delivery failed", body = ErrorResponse)
    )
)]
#[post("/download")]
pub async fn download_audio(
    state: web::Data<AppState>,
    body: web::Json<DownloadRequest>,
) -> impl Responder {
    let (job_id, reply_rx) = match state.jobs.start(body.url.as_deref()) {
        Ok(started) => started,
        Err(err) => {
            tracing::warn!(kind = err.kind(), error = %err, "rejected download request");
            return err.into_response();
        }
    };

    match reply_rx.await {
        Ok(JobReply::Audio { artifact, title }) => audio_response(job_id, artifact, &title),
        Ok(JobReply::Failed(err)) => err.into_response(),
        Err(_) => {
            tracing::error!(job_id = %job_id, "job ended without a reply");
            HttpResponse::InternalServerError().json(ErrorResponse::new("Internal server error"))
        }
    }
}

fn audio_response(job_id: JobId, artifact: Artifact, title: &str) -> HttpResponse {
    let len = artifact.size();
    tracing::info!(job_id = %job_id, title, bytes = len, "sending audio");
    let disposition = ContentDisposition {
        disposition: DispositionType::Attachment,
        parameters: vec![DispositionParam::Filename(format!("{title}.{AUDIO_EXTENSION}"))],
    };
    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "audio/wav"))
        .insert_header((TITLE_HEADER, title))
        .insert_header(disposition)
        .body(SizedStream::new(len, artifact.into_stream()))
}
