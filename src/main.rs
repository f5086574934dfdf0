use affiliate_ledger::{
    api, config::Config, db::init_db, CommercePlatform, HttpCommercePlatform, Ledger,
    LedgerConfig, LogNotifier, Repository,
};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let port = config.port;

    // Initialize database and dependencies
    let pool = match init_db(&config.database_path).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let repo = Arc::new(Repository::new(pool));
    let commerce: Arc<dyn CommercePlatform> = Arc::new(HttpCommercePlatform::new(
        config.commerce_api_url.clone(),
        config.commerce_api_key.clone(),
    ));
    let ledger = Arc::new(Ledger::new(
        repo.clone(),
        commerce,
        Arc::new(LogNotifier),
        LedgerConfig::from(&config),
    ));

    if config.webhook_secret.is_none() {
        tracing::warn!("WEBHOOK_SECRET is not set, /v1/events accepts unauthenticated events");
    }

    // Create router
    let app = api::create_router(api::AppState::new(repo, config, ledger));

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on {}", addr);

    // Run server
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}
