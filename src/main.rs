//! threatfuse
//!
//! Fuses local IP detections with AbuseIPDB reputation data and serves the
//! correlated indicators over REST, STIX 2.1, and TAXII 2.1.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio_cron_scheduler::{Job, JobScheduler};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod cache;
mod correlation;
mod enrichment;
mod exporters;
mod models;
mod storage;
mod workers;

use api::{create_router, AppState};
use cache::IocCache;
use correlation::{CorrelationEngine, ScoringConfig};
use enrichment::abuseipdb::AbuseIpDbClient;
use enrichment::http_geo::{GeoJsResolver, IpApiResolver, IpWhoisResolver};
use enrichment::maxmind::MaxMindResolver;
use enrichment::{GeoResolver, GeolocationService};
use storage::IocRepo;
use workers::IocProcessor;

/// threatfuse
#[derive(Parser, Debug)]
#[command(name = "threatfuse")]
#[command(about = "Fuse local detections with AbuseIPDB reputation and serve STIX/TAXII IOCs")]
struct Args {
    /// Server host
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Server port
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Database URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Redis URL for the IOC cache
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// AbuseIPDB API key
    #[arg(long, env = "ABUSEIPDB_API_KEY")]
    abuseipdb_api_key: Option<String>,

    /// AbuseIPDB daily request budget
    #[arg(long, env = "ABUSEIPDB_DAILY_LIMIT", default_value = "1000")]
    abuseipdb_daily_limit: i64,

    /// Default minimum confidence for filtered collections
    #[arg(long, env = "CONFIDENCE_MINIMUM", default_value = "75")]
    confidence_minimum: i32,

    /// Weight of local detection confidence
    #[arg(long, env = "LOCAL_CONFIDENCE_WEIGHT", default_value = "0.8")]
    local_weight: f64,

    /// Weight of external reputation confidence
    #[arg(long, env = "EXTERNAL_CONFIDENCE_WEIGHT", default_value = "0.2")]
    external_weight: f64,

    /// Confidence floor for high-confidence local detections
    #[arg(long, env = "LOCAL_CONFIDENCE_BOOST", default_value = "85")]
    local_boost: i32,

    /// GeoIP city database path
    #[arg(long, env = "GEOIP_CITY_DB")]
    geoip_city_db: Option<String>,

    /// Cron schedule for correlation passes
    #[arg(long, env = "PROCESS_SCHEDULE", default_value = "0 */5 * * * *")]
    process_schedule: String,

    /// Run database migrations
    #[arg(long, default_value = "false")]
    migrate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "threatfuse=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    tracing::info!("Starting threatfuse");

    // Scoring configuration is validated once, up front.
    let engine = CorrelationEngine::new(ScoringConfig {
        local_weight: args.local_weight,
        external_weight: args.external_weight,
        local_boost: args.local_boost,
        confidence_minimum: args.confidence_minimum,
    })
    .context("Invalid scoring configuration")?;

    // Connect to database
    let repo = IocRepo::new(&args.database_url)
        .await
        .context("Failed to connect to database")?;

    if args.migrate {
        tracing::info!("Running database migrations...");
        repo.migrate().await?;
        tracing::info!("Migrations complete");
    }

    // Redis is optional; without it TAXII answers fall back to on-demand
    // correlation.
    let cache = match &args.redis_url {
        Some(url) => match IocCache::connect(url).await {
            Ok(cache) => {
                tracing::info!("IOC cache enabled");
                Some(cache)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable, continuing without IOC cache");
                None
            }
        },
        None => None,
    };

    // Geolocation chain: local database first, then the free HTTP providers.
    let geo_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("Failed to create HTTP client");

    let mut resolvers: Vec<Box<dyn GeoResolver>> = Vec::new();
    if let Some(path) = args.geoip_city_db.as_ref().map(Path::new) {
        if path.exists() {
            match MaxMindResolver::new(path) {
                Ok(resolver) => {
                    tracing::info!("MaxMind geolocation enabled");
                    resolvers.push(Box::new(resolver));
                }
                Err(e) => tracing::warn!(error = %e, "failed to open GeoIP database"),
            }
        } else {
            tracing::warn!(path = %path.display(), "GeoIP city database not found");
        }
    }
    resolvers.push(Box::new(IpApiResolver::new(geo_client.clone())));
    resolvers.push(Box::new(IpWhoisResolver::new(geo_client.clone())));
    resolvers.push(Box::new(GeoJsResolver::new(geo_client)));
    let geo = Arc::new(GeolocationService::with_resolvers(resolvers));

    // AbuseIPDB enrichment is optional.
    let abuse = args.abuseipdb_api_key.map(|key| {
        tracing::info!("AbuseIPDB enrichment enabled");
        Arc::new(AbuseIpDbClient::new(key, args.abuseipdb_daily_limit))
    });

    // Prometheus exposition, rendered by the /metrics route.
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    // Background correlation passes
    let processor = Arc::new(IocProcessor::new(
        repo.clone(),
        cache.clone(),
        abuse.clone(),
        geo.clone(),
        engine.clone(),
    ));

    let startup_processor = processor.clone();
    tokio::spawn(async move {
        if let Err(e) = startup_processor.run_pass().await {
            tracing::error!(error = %e, "startup IOC pass failed");
        }
    });

    let scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create scheduler: {e}"))?;
    let job_processor = processor.clone();
    let job = Job::new_async(args.process_schedule.as_str(), move |_uuid, _lock| {
        let processor = job_processor.clone();
        Box::pin(async move {
            if let Err(e) = processor.run_pass().await {
                tracing::error!(error = %e, "scheduled IOC pass failed");
            }
        })
    })
    .map_err(|e| anyhow::anyhow!("Invalid process schedule: {e}"))?;
    scheduler
        .add(job)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to schedule IOC passes: {e}"))?;
    scheduler
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start scheduler: {e}"))?;

    // Create application state
    let state = Arc::new(AppState {
        repo,
        cache,
        engine,
        abuse,
        daily_limit: args.abuseipdb_daily_limit,
        metrics: metrics_handle,
    });

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    tracing::info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
