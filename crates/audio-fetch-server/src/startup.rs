//! Actix server startup + app wiring.
//!
//! Prepares the work dir, provisions cookies, builds the shared state and
//! starts the HTTP server with its middleware and OpenAPI endpoints.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::task::{Context, Poll};

use actix_cors::Cors;
use actix_files::Files;
use actix_web::dev::{Service, ServiceRequest, ServiceResponse};
use actix_web::http::header;
use actix_web::{App, Error, HttpServer, web};
use anyhow::{Context as _, Result};
use futures_util::future::{LocalBoxFuture, Ready, ok};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api;
use crate::artifact::{ArtifactPoller, cleanup_stale_artifacts};
use crate::cli::Args;
use crate::config::{self, Settings};
use crate::cookies::{self, COOKIE_FILE_NAME};
use crate::extractor::resolve_extractor_path;
use crate::job::{JobContext, TITLE_TIMEOUT};
use crate::openapi;
use crate::profiles::ProfileSequencer;
use crate::state::AppState;
use crate::supervisor::ProcessSupervisor;

/// Resolve settings, prepare the work dir and run the HTTP server.
pub(crate) async fn run(args: Args) -> Result<()> {
    let cfg = config::load_config(args.config.as_ref())?;
    let settings = config::resolve_settings(&args, &cfg)?;
    let ctx = build_job_context(&settings)?;
    tracing::info!(
        bind = %settings.bind,
        work_dir = %ctx.work_dir.display(),
        public_dir = %settings.public_dir.display(),
        extractor = %ctx.extractor.display(),
        cookies = ?ctx.cookies.source(),
        cookie_file = ?ctx.cookies.path(),
        timeout_secs = settings.timeout.as_secs(),
        "starting audio-fetch-server"
    );

    setup_shutdown(ctx.work_dir.clone());
    let public_dir = settings.public_dir.is_dir().then(|| settings.public_dir.clone());
    if public_dir.is_none() {
        tracing::info!(
            public_dir = %settings.public_dir.display(),
            "static directory missing; not serving static files"
        );
    }
    let state = web::Data::new(AppState::new(ctx));

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec![header::CONTENT_TYPE])
            .expose_headers(vec![
                header::HeaderName::from_static("x-video-title"),
                header::CONTENT_DISPOSITION,
            ])
            .max_age(3600);

        let mut app = App::new()
            .app_data(state.clone())
            .app_data(api::json_config())
            .wrap(cors)
            .wrap(FilteredLogger)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-doc/openapi.json", openapi::ApiDoc::openapi()),
            )
            .service(api::health_check)
            .service(api::download_audio);

        // Registered last so it never shadows the API routes.
        if let Some(dir) = public_dir.clone() {
            app = app.service(Files::new("/", dir).index_file("index.html"));
        }

        app
    })
    .bind(settings.bind)
    .with_context(|| format!("bind {}", settings.bind))?
    .run()
    .await?;

    Ok(())
}

/// Prepare the work dir and everything a job needs.
fn build_job_context(settings: &Settings) -> Result<JobContext> {
    std::fs::create_dir_all(&settings.work_dir)
        .with_context(|| format!("create work dir {:?}", settings.work_dir))?;
    let work_dir = settings
        .work_dir
        .canonicalize()
        .with_context(|| format!("resolve work dir {:?}", settings.work_dir))?;
    remove_stale_artifacts(&work_dir);

    let extractor = resolve_extractor_path(settings.extractor_override.as_deref());
    let default_cookies = PathBuf::from(COOKIE_FILE_NAME);
    let cookies = cookies::provision(&settings.cookie_sources, &work_dir, &default_cookies);

    Ok(JobContext {
        extractor,
        work_dir,
        cookies: Arc::new(cookies),
        sequencer: ProfileSequencer::default(),
        supervisor: ProcessSupervisor::default(),
        poller: ArtifactPoller::default(),
        timeout: settings.timeout,
        title_timeout: TITLE_TIMEOUT,
    })
}

fn remove_stale_artifacts(work_dir: &Path) {
    match cleanup_stale_artifacts(work_dir) {
        Ok(0) => {}
        Ok(count) => tracing::info!(count, dir = %work_dir.display(), "removed stale artifacts"),
        Err(e) => tracing::warn!(error = %e, dir = %work_dir.display(), "stale artifact cleanup failed"),
    }
}

/// Return true when the request path should be logged.
fn should_log_path(path: &str) -> bool {
    path != "/health"
}

/// Actix middleware that filters noisy paths from logging.
struct FilteredLogger;

impl<S, B> actix_web::dev::Transform<S, ServiceRequest> for FilteredLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = FilteredLoggerMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(FilteredLoggerMiddleware { service })
    }
}

/// Service wrapper that applies the logging filter.
struct FilteredLoggerMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for FilteredLoggerMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, ctx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let path = req.path().to_string();
        let should_log = should_log_path(&path);
        let method = req.method().clone();
        let peer = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("-")
            .to_string();
        let start = std::time::Instant::now();
        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            if should_log {
                tracing::info!(
                    method = %method,
                    path = %path,
                    status = %res.status().as_u16(),
                    peer = %peer,
                    elapsed_ms = %start.elapsed().as_millis(),
                    "http request"
                );
            }
            Ok(res)
        })
    }
}

/// Install Ctrl+C handler that clears leftover artifacts and stops the server.
fn setup_shutdown(work_dir: PathBuf) {
    let system = actix_web::rt::System::try_current();
    let result = ctrlc::set_handler(move || {
        tracing::info!("shutting down");
        remove_stale_artifacts(&work_dir);
        match system.as_ref() {
            Some(system) => system.stop(),
            None => std::process::exit(0),
        }
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to install Ctrl+C handler");
    }
}
