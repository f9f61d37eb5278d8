//! HTTP API handlers.
//!
//! Defines the Actix routes for downloads and liveness.

pub mod download;
pub mod health;

use actix_web::{HttpResponse, error, web};
use audio_fetch_types::ErrorResponse;

pub use download::download_audio;
pub use health::health_check;

/// JSON extractor config that reports unparsable bodies as a 400 with the
/// usual `{ "error": ... }` shape.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        tracing::warn!(error = %err, "rejected request body");
        let response =
            HttpResponse::BadRequest().json(ErrorResponse::new(format!("Invalid JSON body: {err}")));
        error::InternalError::from_response(err, response).into()
    })
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use actix_web::http::{StatusCode, header};
    use actix_web::{App, test};
    use audio_fetch_types::{DownloadRequest, ErrorResponse, HealthResponse};

    use crate::api;
    use crate::artifact::{ArtifactPoller, PollPolicy};
    use crate::cookies::CookieConfig;
    use crate::job::{JobContext, TITLE_TIMEOUT};
    use crate::profiles::ProfileSequencer;
    use crate::state::AppState;
    use crate::supervisor::ProcessSupervisor;
    use crate::test_support::temp_dir;

    fn make_state(work_dir: &Path, extractor: PathBuf) -> actix_web::web::Data<AppState> {
        let ctx = JobContext {
            extractor,
            work_dir: work_dir.to_path_buf(),
            cookies: std::sync::Arc::new(CookieConfig::none()),
            sequencer: ProfileSequencer::default(),
            supervisor: ProcessSupervisor::new(Duration::from_millis(200), 64 * 1024),
            poller: ArtifactPoller::new(PollPolicy {
                interval: Duration::from_millis(10),
                max_attempts: 5,
                io_retry_interval: Duration::from_millis(10),
                io_max_attempts: 2,
            }),
            timeout: Duration::from_secs(20),
            title_timeout: TITLE_TIMEOUT,
        };
        actix_web::web::Data::new(AppState::new(ctx))
    }

    macro_rules! download_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state.clone())
                    .app_data(api::json_config())
                    .service(api::download_audio)
                    .service(api::health_check),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn health_reports_ok() {
        let dir = temp_dir("api-health");
        let state = make_state(&dir, PathBuf::from("yt-dlp"));
        let app = download_app!(state);

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp: HealthResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp, HealthResponse::ok());
    }

    #[actix_web::test]
    async fn missing_url_is_bad_request() {
        let dir = temp_dir("api-missing-url");
        let state = make_state(&dir, PathBuf::from("yt-dlp"));
        let app = download_app!(state);

        let req = test::TestRequest::post()
            .uri("/download")
            .set_json(DownloadRequest::default())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.error, "URL is required");
    }

    #[actix_web::test]
    async fn malformed_json_is_bad_request() {
        let dir = temp_dir("api-bad-json");
        let state = make_state(&dir, PathBuf::from("yt-dlp"));
        let app = download_app!(state);

        let req = test::TestRequest::post()
            .uri("/download")
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .set_payload("{\"url\": ")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert!(body.error.starts_with("Invalid JSON body"), "{}", body.error);
    }

    #[cfg(unix)]
    #[actix_web::test]
    async fn download_streams_wav_with_title_headers() {
        let work = temp_dir("api-download");
        let bin = temp_dir("api-download-bin");
        let script = crate::test_support::fake_extractor(
            &bin,
            r#"
out=""
title=0
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift ;;
    --get-title) title=1 ;;
  esac
  shift
done
if [ $title = 1 ]; then echo "Night Drive (Remix)"; exit 0; fi
printf 'RIFF0000WAVEfmt ' > "$(printf '%s' "$out" | sed 's/%(ext)s/wav/')"
"#,
        );
        let state = make_state(&work, script);
        let app = download_app!(state);

        let req = test::TestRequest::post()
            .uri("/download")
            .set_json(DownloadRequest {
                url: Some("https://www.youtube.com/shorts/abc123".to_string()),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let headers = resp.headers().clone();
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "audio/wav");
        assert_eq!(headers.get("X-Video-Title").unwrap(), "Night Drive _Remix_");
        let disposition = headers
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(disposition.starts_with("attachment"));
        assert!(disposition.contains("Night Drive _Remix_.wav"));

        let body = test::read_body(resp).await;
        assert_eq!(&body[..], b"RIFF0000WAVEfmt ");
        let leftovers: Vec<_> = std::fs::read_dir(&work)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".wav"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[actix_web::test]
    async fn extractor_failure_is_reported_as_json() {
        let work = temp_dir("api-fail");
        let bin = temp_dir("api-fail-bin");
        let script = crate::test_support::fake_extractor(
            &bin,
            "echo 'ERROR: [generic] Unsupported URL: https://example.com/page' >&2\nexit 1",
        );
        let state = make_state(&work, script);
        let app = download_app!(state);

        let req = test::TestRequest::post()
            .uri("/download")
            .set_json(DownloadRequest {
                url: Some("https://example.com/page".to_string()),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.error, "[generic] Unsupported URL: https://example.com/page");
    }
}
