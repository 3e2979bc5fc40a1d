//! Thin process entry point: wires the gateway's components together and
//! exits. HTTP route handlers, a CLI, and channel adapters are out of scope
//! for this crate; callers embed [`gateway_core::GatewayFacade`] directly.

use std::sync::Arc;

use anyhow::Result;
use gateway_core::cache::CacheLayer;
use gateway_core::ledger::UsageLedger;
use gateway_core::quota::QuotaManager;
use gateway_core::registry::ProviderRegistry;
use gateway_core::router::ModelRouter;
use gateway_core::{db, GatewayConfig, GatewayFacade};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "gateway=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(GatewayConfig::from_env()?);
    let secret = GatewayConfig::load_secret()?;
    let codec = Arc::new(gateway_crypto::CredentialCodec::new(&secret));

    let pool = db::connect(&config.database_path).await?;
    let registry = Arc::new(ProviderRegistry::new(pool.clone(), codec.clone(), config.env_fallback.clone()));
    let router = Arc::new(ModelRouter::new(config.tiers.clone()));
    let quota = Arc::new(QuotaManager::new(QuotaManager::default_policies()));
    let cache = Arc::new(CacheLayer::new(
        pool.clone(),
        config.policy.session_cache_ttl_secs,
        config.policy.content_cache_ttl_secs,
    ));
    let ledger = Arc::new(UsageLedger::new(pool));

    let _facade = GatewayFacade::new(codec, registry, router, quota, cache, ledger, config);

    tracing::info!("gateway initialized; embed GatewayFacade::generate to serve requests");
    Ok(())
}
