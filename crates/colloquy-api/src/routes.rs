//! Router setup with all API routes and middleware.

use std::future::Future;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use colloquy_core::error::Result;

use crate::handlers;
use crate::state::AppState;

/// Build the router with every route and the shared middleware.
pub fn create_router(state: AppState) -> Router {
    // Allow the server's own origin on localhost, plus port+1 for a dev UI.
    let port = state.config.lock().map(|c| c.general.port).unwrap_or(8501);
    let origins: Vec<HeaderValue> = [port, port.saturating_add(1)]
        .iter()
        .flat_map(|p| [format!("http://127.0.0.1:{}", p), format!("http://localhost:{}", p)])
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    let session_routes = Router::new()
        .route("/sessions", post(handlers::create_session))
        .route(
            "/sessions/{id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route(
            "/sessions/{id}/messages",
            post(handlers::post_message).delete(handlers::clear_messages),
        )
        .route(
            "/sessions/{id}/image",
            put(handlers::attach_image).delete(handlers::clear_image),
        )
        .route("/sessions/{id}/camera", post(handlers::capture_camera))
        .route("/sessions/{id}/voice", post(handlers::voice_input))
        .route(
            "/sessions/{id}/settings",
            put(handlers::update_session_settings),
        )
        .route(
            "/sessions/{id}/messages/{msg}/play",
            post(handlers::play_message),
        )
        .route(
            "/sessions/{id}/playback/stop",
            post(handlers::stop_playback),
        );

    let history_routes = Router::new()
        .route(
            "/history",
            get(handlers::history).delete(handlers::clear_history),
        )
        .route("/history/search", get(handlers::search_history))
        .route("/history/stats", get(handlers::history_stats))
        .route("/history/export", get(handlers::export_history))
        .route("/history/{id}", delete(handlers::delete_record));

    let device_routes = Router::new()
        .route(
            "/voice/settings",
            get(handlers::get_voice_settings).put(handlers::update_voice_settings),
        )
        .route("/voice/test/microphone", post(handlers::test_microphone))
        .route("/voice/test/speakers", post(handlers::test_speakers))
        .route("/camera", get(handlers::camera_status));

    let settings_routes = Router::new()
        .route(
            "/settings/generation",
            get(handlers::get_generation_settings).put(handlers::update_generation_settings),
        )
        .route("/model", get(handlers::model_info));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(session_routes)
        .merge(history_routes)
        .merge(device_routes)
        .merge(settings_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve on 127.0.0.1:`port` until `shutdown` resolves.
pub async fn start_server<F>(port: u16, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("127.0.0.1:{}", port);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Serving on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
