use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::get};
use octofhir_core::events::{EventBroadcaster, HookSystemBuilder};
use octofhir_db_memory::InMemoryStorage;
use octofhir_storage::{DynStorage, EventedStorage};
use octofhir_subscriptions::SubscriptionEngine;
use octofhir_terminology::TerminologyGateway;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{config::AppConfig, handlers, websocket};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Evented store: every committed write reaches the hook dispatcher.
    pub storage: DynStorage,
    pub engine: Arc<SubscriptionEngine>,
    pub terminology: Arc<TerminologyGateway>,
    pub config: Arc<AppConfig>,
}

/// Running services behind the router.
pub struct AppServices {
    pub state: AppState,
    hook_task: JoinHandle<()>,
}

impl AppServices {
    /// Wire storage, the write feed, the subscription engine and the
    /// terminology gateway. Must run inside a tokio runtime.
    pub async fn start(cfg: &AppConfig) -> anyhow::Result<Self> {
        let broadcaster = EventBroadcaster::new_shared();
        let storage: DynStorage = Arc::new(EventedStorage::new(
            InMemoryStorage::new(),
            broadcaster.clone(),
        ));

        let engine = Arc::new(SubscriptionEngine::start(
            storage.clone(),
            cfg.subscriptions.clone(),
        ));

        let mut hooks = HookSystemBuilder::new();
        for hook in engine.hooks() {
            hooks = hooks.register(hook).await;
        }
        let (_registry, hook_task) = hooks.start(broadcaster.subscribe());
        engine.start_background();

        let terminology = Arc::new(TerminologyGateway::from_settings(
            storage.clone(),
            &cfg.terminology,
        )?);

        tracing::info!(
            backend = storage.backend_name(),
            remote_terminology_services = cfg.terminology.remote_services.len(),
            "Services started"
        );

        Ok(Self {
            state: AppState {
                storage,
                engine,
                terminology,
                config: Arc::new(cfg.clone()),
            },
            hook_task,
        })
    }

    /// Stop the engine's background work and the hook dispatcher.
    pub async fn shutdown(self) {
        self.state.engine.shutdown().await;
        self.hook_task.abort();
        let _ = self.hook_task.await;
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit_bytes;
    let mut router = Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/fhir/metadata", get(handlers::metadata))
        .route(
            "/fhir/CodeSystem/$validate-code",
            get(handlers::code_system_validate_code_get)
                .post(handlers::code_system_validate_code_post),
        )
        .route(
            "/fhir/ValueSet/$validate-code",
            get(handlers::value_set_validate_code_get)
                .post(handlers::value_set_validate_code_post),
        )
        .route(
            "/fhir/Subscription/{id}/$status",
            get(handlers::subscription_status),
        )
        .route(
            "/fhir/{resource_type}",
            get(handlers::search_resource).post(handlers::create_resource),
        )
        .route(
            "/fhir/{resource_type}/{id}",
            get(handlers::read_resource)
                .put(handlers::update_resource)
                .delete(handlers::delete_resource),
        );

    if state.config.subscriptions.websocket_enabled {
        router = router.route("/websocket", get(websocket::websocket_handler));
    }

    router.with_state(state).layer(
        ServiceBuilder::new()
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(|req: &axum::http::Request<_>| {
                        tracing::info_span!(
                            "http.request",
                            http.method = %req.method(),
                            http.target = %req.uri(),
                            http.status_code = tracing::field::Empty,
                        )
                    })
                    .on_response(
                        |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                            span.record(
                                "http.status_code",
                                tracing::field::display(res.status().as_u16()),
                            );
                            tracing::info!(
                                http.status = %res.status().as_u16(),
                                elapsed_ms = %latency.as_millis(),
                                "request handled"
                            );
                        },
                    ),
            )
            .layer(CorsLayer::permissive())
            .layer(CompressionLayer::new())
            .layer(axum::extract::DefaultBodyLimit::max(body_limit)),
    )
}

pub struct OctofhirServer {
    addr: SocketAddr,
    app: Router,
    services: AppServices,
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    pub async fn build(self) -> anyhow::Result<OctofhirServer> {
        let services = AppServices::start(&self.config).await?;
        let app = build_router(services.state.clone());
        Ok(OctofhirServer {
            addr: self.addr,
            app,
            services,
        })
    }
}

impl OctofhirServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        tracing::info!("listening on {}", listener.local_addr()?);
        let result = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await;
        self.services.shutdown().await;
        result?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
