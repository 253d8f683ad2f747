use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use lumen_core::{
    list_adapters, loader_for_model, AdapterCatalog, FluxLoader, GenerationError,
    GenerationRequest, Loader, Orchestrator, RunSummary, Settings,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Lumen image generation server")]
struct Args {
    /// Model repository. Overrides the settings file.
    #[arg(long)]
    model: Option<String>,

    /// Settings file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

/// One generation at a time: the orchestrator owns the only pipeline.
struct AppState {
    orchestrator: Arc<Mutex<Orchestrator<FluxLoader>>>,
    adapters: AdapterCatalog,
}

#[derive(Serialize, Debug)]
struct EncodedImage {
    index: usize,
    seed: u64,
    b64_json: String,
}

#[derive(Serialize, Debug)]
struct GenerationResponse {
    info: String,
    #[serde(flatten)]
    summary: RunSummary,
    images: Vec<EncodedImage>,
}

#[derive(Serialize, Debug)]
struct LorasResponse {
    loras: Vec<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<GenerationError> for ApiError {
    fn from(err: GenerationError) -> Self {
        let status = if err.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("request failed: {}", self.message);
        }
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

/// Reads back every written image of a run as base64.
fn encode_images(summary: &RunSummary) -> Result<Vec<EncodedImage>> {
    summary
        .outcomes
        .iter()
        .filter(|outcome| outcome.is_ok())
        .map(|outcome| {
            let bytes = std::fs::read(&outcome.path)
                .map_err(|err| anyhow!("failed to read {}: {err}", outcome.path.display()))?;
            Ok(EncodedImage {
                index: outcome.index,
                seed: outcome.seed,
                b64_json: BASE64_STANDARD.encode(bytes),
            })
        })
        .collect()
}

/// Locks the orchestrator. A generation that panicked may have left the
/// pipeline half-updated, so its session is dropped and reloaded.
fn lock_orchestrator<L: Loader>(
    orchestrator: &Mutex<Orchestrator<L>>,
) -> MutexGuard<'_, Orchestrator<L>> {
    match orchestrator.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("a previous generation panicked, reloading the pipeline");
            orchestrator.clear_poison();
            let mut guard = PoisonError::into_inner(poisoned);
            guard.reset();
            guard
        }
    }
}

fn generate<L: Loader>(
    orchestrator: &Mutex<Orchestrator<L>>,
    request: &GenerationRequest,
) -> Result<GenerationResponse, ApiError> {
    let mut orchestrator = lock_orchestrator(orchestrator);
    let summary = orchestrator.run(request)?;
    let images = encode_images(&summary)?;
    Ok(GenerationResponse {
        info: summary.info(),
        summary,
        images,
    })
}

async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let orchestrator = state.orchestrator.clone();
    let response = tokio::task::spawn_blocking(move || generate(&orchestrator, &request))
        .await
        .map_err(|err| anyhow!("generation task failed: {err}"))??;
    Ok(Json(response))
}

async fn list_loras_handler(State(state): State<Arc<AppState>>) -> Json<LorasResponse> {
    Json(LorasResponse {
        loras: list_adapters(&state.adapters),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(model) = args.model {
        settings.model = model;
    }

    // Weights are fetched and loaded on the first request.
    let loader = loader_for_model(&settings.model)?;
    let shared_state = Arc::new(AppState {
        adapters: settings.adapters.clone(),
        orchestrator: Arc::new(Mutex::new(Orchestrator::new(loader, settings))),
    });

    let app = Router::new()
        .route("/v1/images/generations", post(generate_image_handler))
        .route("/v1/loras", get(list_loras_handler))
        .with_state(shared_state);

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
