/// HTTP API server for the volume service
/// Local-only; the desktop host is trusted, so there is no authentication

#[cfg(feature = "server")]
pub mod routes;

#[cfg(feature = "server")]
pub mod handlers;

#[cfg(feature = "server")]
pub mod websocket;

#[cfg(feature = "server")]
pub use routes::create_router;

#[cfg(feature = "server")]
pub async fn run(
    host: String,
    port: u16,
    enable_cors: bool,
    service: std::sync::Arc<crate::core::VolumeService>,
) -> anyhow::Result<()> {
    use anyhow::Context;
    use std::net::SocketAddr;

    let background = service.start_background();
    let app = create_router(service, enable_cors);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;

    println!("Vackup volume service");
    println!("   API:    http://{}/volumes", addr);
    println!("   Events: ws://{}/ws/events", addr);
    println!();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in background {
        task.abort();
    }
    tracing::info!("server stopped");
    Ok(())
}

#[cfg(feature = "server")]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
