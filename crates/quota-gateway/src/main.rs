use color_eyre::eyre;
use quota_gateway::{create_app, AppState, GatewayConfig};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,quota_gateway=debug")),
        )
        .init();

    let config = GatewayConfig::from_env()?;
    let addr = config.bind_addr();
    if config.admin_token.is_none() {
        info!("QUOTA_ADMIN_TOKEN not set, admin and webhook routes are disabled");
    }

    let state = AppState::from_config(config).await?;
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Quota gateway listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
