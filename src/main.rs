#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use dotenv::dotenv;
use ssh_proxy::proxy::ProxyServer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let address =
        std::env::var("SSH_PROXY_ADDRESS").unwrap_or_else(|_| "ssh://127.0.0.1:2222".to_string());

    let server = ProxyServer::new(&address)?;
    info!("Starting SSH proxy server: {:?}", server.descriptor());
    server.run().await?;

    Ok(())
}
