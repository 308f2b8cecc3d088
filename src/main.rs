//! ACE playbook service
//!
//! HTTP server and command-line tools for learning playbooks.

use ace_service::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // WARN by default, RUST_LOG=ace_service=debug for detail
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into())
        )
        .init();

    cli::run().await
}
