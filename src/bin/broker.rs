/// Databroker service - live source connections plus an HTTP fetch API
///
/// Connects every configured source over NATS, keeps the entity cache warm
/// and answers translator fetch requests from it.

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use databroker::{
    BrokerConfig, ConnectionError, ConsumerRegistry, Dispatcher, HandlerRegistry, LiveTransport,
    LogConsumer, NatsPublishConsumer, NatsPublisher, NatsTransport, SchemaCatalog, SourceConfig,
    Transformer,
};

#[derive(Parser, Debug)]
#[command(name = "broker")]
#[command(about = "Live data broker with schema-based output mapping", version)]
struct Cli {
    /// Path to the broker configuration file
    #[arg(short, long, default_value = "broker.yaml")]
    config: PathBuf,

    /// HTTP port (overrides config and BROKER_PORT)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Clone)]
struct AppState {
    dispatcher: Dispatcher,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = BrokerConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    let mut schemas = SchemaCatalog::new();
    if let Some(dir) = &config.schema_dir {
        let count = schemas.load_from_dir(dir)?;
        tracing::info!("Loaded {} schemas from {}", count, dir.display());
    }

    let transformer = Transformer::new(Arc::new(HandlerRegistry::with_builtins()));

    let mut consumers = ConsumerRegistry::new();
    consumers.register(Arc::new(LogConsumer));
    let wants_publish = config
        .sources
        .iter()
        .any(|source| source.consumers.iter().any(|name| name == NatsPublishConsumer::NAME));
    if wants_publish {
        let publisher = NatsPublisher::connect(config.nats_config())
            .await
            .context("Failed to connect NATS publisher")?;
        consumers.register(Arc::new(NatsPublishConsumer::new(publisher)));
    }

    let factory = |source: &SourceConfig| -> Arc<dyn LiveTransport> {
        Arc::new(NatsTransport::new(source.url.clone()))
    };

    let dispatcher = Dispatcher::new(
        Arc::new(schemas),
        transformer,
        Arc::new(consumers),
        Arc::new(factory),
        config.dispatcher_options(),
    );
    for source in &config.sources {
        dispatcher.add_source(source.clone());
    }

    for (id, result) in dispatcher.connect_all().await {
        if result.is_err() {
            tracing::warn!("{}: Not connected; retry with POST /translator/v1/reconnect/{}", id, id);
        }
    }

    let state = Arc::new(AppState { dispatcher });

    // Build router
    let app = Router::new()
        .route("/translator/v1/fetch", post(fetch))
        .route("/translator/v1/reconnect/:source", post(reconnect))
        .route("/translator/v1/sources", get(list_sources))
        .route("/health", get(health_check))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Databroker listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct FetchRequest {
    source: String,
    #[serde(default)]
    ids: Vec<String>,
}

/// Fetch cached entities, mapped onto the source's schema
async fn fetch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FetchRequest>,
) -> Result<Json<JsonValue>, AppError> {
    let data = state.dispatcher.get_data(&request.source, &request.ids)?;

    Ok(Json(json!({
        "@context": state.dispatcher.schema_id(&request.source),
        "data": data,
    })))
}

/// Re-run connect for one source (serialized with other reconnects)
async fn reconnect(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
) -> Result<Json<JsonValue>, AppError> {
    state.dispatcher.connect(&source).await?;

    Ok(Json(json!({
        "source": source,
        "state": state.dispatcher.state(&source),
    })))
}

/// Connection state and cache size per source
async fn list_sources(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
    let sources: Vec<JsonValue> = state
        .dispatcher
        .source_ids()
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "state": state.dispatcher.state(&id),
                "cached": state.dispatcher.cache().len(&id),
            })
        })
        .collect();

    Json(json!({ "sources": sources }))
}

/// Health check endpoint (liveness)
async fn health_check() -> Json<JsonValue> {
    Json(json!({
        "status": "healthy",
        "service": "databroker",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// Error handling

#[derive(Debug)]
enum AppError {
    NotFound(String),
    Unavailable(String),
    Upstream(String),
    Timeout(String),
}

impl From<ConnectionError> for AppError {
    fn from(error: ConnectionError) -> Self {
        let message = error.to_string();
        match error {
            ConnectionError::UnknownSource(_) => AppError::NotFound(message),
            ConnectionError::NotConnected(_) => AppError::Unavailable(message),
            ConnectionError::Timeout(_) => AppError::Timeout(message),
            ConnectionError::Transport { .. } | ConnectionError::Handshake { .. } => {
                AppError::Upstream(message)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
        };

        (status, Json(json!({
            "error": message
        }))).into_response()
    }
}
