use std::env;

use adaptive_rate_client::{AdaptiveRateLimiter, RateLimiterSettings};
use rpm_client::{Property, RpmClient, RpmError, StorePropertyRequest};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ENV_BASE_URL: &str = "RPM_BASE_URL";
const ENV_API_KEY: &str = "RPM_API_KEY";
const ENV_API_SECRET: &str = "RPM_API_SECRET";
const ENV_CALLS_PER_SECOND: &str = "RPM_CALLS_PER_SECOND";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let dotenv_loaded = dotenvy::dotenv().is_ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,adaptive_rate=debug")),
        )
        .init();
    if !dotenv_loaded {
        info!("No .env file found; using the process environment.");
    }

    let base_url = env::var(ENV_BASE_URL)
        .map_err(|_| format!("Required environment variable '{ENV_BASE_URL}' not set"))?;
    let key = env::var(ENV_API_KEY).unwrap_or_default();
    let secret = env::var(ENV_API_SECRET).unwrap_or_default();
    let rate = match env::var(ENV_CALLS_PER_SECOND).map(|v| v.parse::<f64>()) {
        Ok(Ok(rate)) => rate,
        Ok(Err(error)) => {
            warn!(%error, "Invalid {ENV_CALLS_PER_SECOND}; using 5.");
            5.0
        }
        Err(_) => 5.0,
    };

    let limiter = AdaptiveRateLimiter::new(
        RateLimiterSettings::builder()
            .initial_rate(rate)
            .change_percent(0.2)
            .build(),
    );
    let client = RpmClient::new(base_url)?
        .with_credentials(&key, &secret)?
        .with_rate_limiter(limiter.clone())
        .with_429_retry(3);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let requests = (1..=10).map(|n| {
        StorePropertyRequest::new(Property {
            id: n.to_string(),
            street: format!("{n} Main St"),
            city: "Springfield".to_string(),
            state: "IL".to_string(),
            zip: "62701".to_string(),
        })
        .with_request_id(format!("demo-{n}"))
    });

    for request in requests {
        match client.store_property(&request, &cancel).await {
            Ok(property) => info!(id = %property.id, "Stored property."),
            Err(RpmError::Api { status, error }) => warn!(%status, %error, "API rejected property."),
            Err(RpmError::Client { source }) if source.is_cancelled() => {
                warn!("Interrupted.");
                break;
            }
            Err(error) => return Err(error.into()),
        }
        info!(rate = limiter.limit(), "Current call rate.");
    }

    Ok(())
}
