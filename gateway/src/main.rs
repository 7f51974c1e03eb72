use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use datagate::clock::SystemClock;
use datagate::query::Projection;
use datagate::store::dataset::PgDataset;
use datagate::store::postgres::PgStore;
use datagate::{api, cli, config, jobs, middleware::session, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    // before parse, for clap's env fallbacks
    dotenvy::dotenv().ok();
    let args = cli::Cli::parse();

    let result = match args.command.unwrap_or(cli::Commands::Serve { port: None }) {
        cli::Commands::Serve { port } => {
            let cfg = config::load()?;
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        cli::Commands::Migrate => {
            let cfg = config::load()?;
            let db = PgStore::connect(&cfg.database_url, cfg.database_max_connections).await?;
            db.migrate().await?;
            println!("Migrations applied.");
            Ok(())
        }
        cli::Commands::HashPassword { password } => {
            let password = match password {
                Some(p) => p,
                None => read_password_line()?,
            };
            println!("{}", session::hash_password(&password)?);
            Ok(())
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

fn init_tracing() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "datagate"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let (json_layer, text_layer) = if json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "datagate=debug,tower_http=debug".into()),
        ))
        .with(json_layer)
        .with(text_layer)
        .with(telemetry_layer)
        .init();
    Ok(())
}

fn read_password_line() -> anyhow::Result<String> {
    eprint!("Password: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn run_server(cfg: config::Config, port: u16) -> anyhow::Result<()> {
    let projection = match cfg.projection_config.as_deref() {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading projection override");
            Projection::from_yaml_file(path)?
        }
        None => Projection::default(),
    };

    tracing::info!("Connecting to database...");
    let db = PgStore::connect(&cfg.database_url, cfg.database_max_connections).await?;

    tracing::info!("Running migrations...");
    db.migrate().await?;

    let dataset = PgDataset::new(db.pool().clone());
    let state = Arc::new(AppState::new(
        cfg,
        Arc::new(db),
        Arc::new(dataset),
        Arc::new(SystemClock),
        projection,
    ));

    jobs::cleanup::spawn(state.store.clone(), state.clock.clone(), state.metadata.clone());
    tracing::info!("Background cleanup job started (sessions and rate windows every 1h)");

    let app = api::app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("datagate listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
