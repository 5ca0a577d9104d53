use tracing_subscriber::EnvFilter;

use url_bundler::{api, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Config::from_env()?;
    tracing::info!("Starting url-bundler v{}", env!("CARGO_PKG_VERSION"));

    api::serve(config).await
}
