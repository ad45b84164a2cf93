use anyhow::Context;
use db::{DBService, Stores};
use server::{AppState, router};
use services::services::config::Config;
use tracing::info;
use utils::{instrumentation::Instrumentation, logging::init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("info");

    let config = Config::from_env()?;
    let db = DBService::new(&config.database_url, config.database_max_connections)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    let stores = Stores::sqlite(&db, &Instrumentation::default(), config.visibility());
    let app = router(AppState::new(stores));

    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    info!(address = %listener.local_addr()?, oss_mode = config.oss_mode, "Server running");
    axum::serve(listener, app).await?;
    Ok(())
}
