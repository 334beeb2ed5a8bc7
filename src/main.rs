use std::sync::Arc;

use cobrador::config::Settings;
use cobrador::routes::api_routes;
use cobrador::scheduler::spawn_daily_trigger;
use cobrador::store::{LibSqlBackend, Storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; optional rolling file output next to stderr.
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _file_guard = match std::env::var("COBRADOR_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(&dir, "cobrador.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    let db_path = std::env::var("COBRADOR_DB_PATH")
        .unwrap_or_else(|_| "./data/cobrador.db".to_string());
    let port: u16 = std::env::var("COBRADOR_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    eprintln!("💸 cobrador v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", db_path);
    eprintln!("   API: http://0.0.0.0:{}/api", port);

    // ── Database ─────────────────────────────────────────────────────
    let store: Arc<dyn Storage> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .map_err(|e| anyhow::anyhow!("failed to open database at {db_path}: {e}"))?,
    );

    // Seed defaults on first boot so settings are editable immediately.
    // Executions still refuse to run until credentials are filled in.
    if store
        .load_settings()
        .await
        .map_err(|e| anyhow::anyhow!("failed to read settings: {e}"))?
        .is_none()
    {
        store
            .save_settings(&Settings::default())
            .await
            .map_err(|e| anyhow::anyhow!("failed to seed default settings: {e}"))?;
        eprintln!("   Settings: seeded defaults (credentials still required)");
    }

    // ── Daily trigger ────────────────────────────────────────────────
    let _trigger_handle = spawn_daily_trigger(Arc::clone(&store));

    // ── HTTP server ──────────────────────────────────────────────────
    let app = api_routes(Arc::clone(&store));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "API server started");
    axum::serve(listener, app).await?;

    Ok(())
}
