use anyhow::{Context, Result};
use clap::Parser;
use kube::CustomResourceExt;
use pgfleet_models::PostgresCluster;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod cli;
mod config;
mod controller;

use cli::{Args, Mode};
use config::Config;

/// Initialize tracing to stdout, filtered by RUST_LOG.
fn initialize_tracing() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "info,\
         pgfleet_operator=debug,\
         pgfleet_controller=debug,\
         kube=info,\
         tower_http=info"
            .into()
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    let args = Args::parse();

    match args.mode {
        Mode::Crd => {
            let crd = serde_yaml::to_string(&PostgresCluster::crd())
                .context("Failed to render CRD")?;
            print!("{}", crd);
            Ok(())
        }
        Mode::Run { namespace, port } => {
            initialize_tracing();

            let mut config = Config::load()?;
            if namespace.is_some() {
                config.namespace = namespace;
            }
            if let Some(port) = port {
                config.health_port = port;
            }
            run_operator(config).await
        }
    }
}

async fn run_operator(config: Config) -> Result<()> {
    tracing::info!(?config, "Starting pgfleet operator");

    let client = pgfleet_controller::get_k8s_client()
        .await
        .context("Failed to create Kubernetes client")?;
    let state = controller::SharedState::default();

    let server = api::start_server(
        config.health_port,
        api::AppState {
            clusters: state.clone(),
        },
    );

    tokio::select! {
        result = controller::run(client, config, state) => result,
        result = server => result,
    }
}
