use clap::{Parser, Subcommand};

/// pgfleet - PostgreSQL clusters on Kubernetes, coordinated by Patroni
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run the operator
    Run {
        /// Only watch this namespace (default: all namespaces)
        #[arg(short, long)]
        namespace: Option<String>,

        /// Port of the health and status API
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the PostgresCluster CustomResourceDefinition as YAML
    Crd,
}
