use chat_relay::api::build_router;
use chat_relay::*;
use clap::Parser;
use futures_util::FutureExt;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _log_guards = chat_relay::logging::init_tracing(&args.log_dir, args.log_json);
    chat_relay::logging::setup_panic_hook();

    let state = match AppState::from_args(args).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            eprintln!("Startup failed: {}", e.inner);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Models: {} (default '{}'), sessions: {}",
        state.registry.names().join(", "),
        state.registry.default_name(),
        state.store.len().await
    );

    let addr = format!("{}:{}", state.args.host, state.args.port);
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("chat-relay listening on {}", addr);
    let server_future = async move { axum::serve(listener, app).await };

    match std::panic::AssertUnwindSafe(server_future)
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => tracing::info!("Server stopped"),
        Ok(Err(e)) => {
            tracing::error!("Server error: {}", e);
            std::process::exit(1);
        }
        Err(panic_payload) => {
            let message = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.as_str()
            } else {
                "Unknown panic"
            };
            tracing::error!(target: "panic", "CRITICAL: Server task panicked: {}", message);
            std::process::exit(1);
        }
    }
}
