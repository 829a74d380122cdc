use clap::Parser;
use kube::Client;
use owo_colors::OwoColorize;
use std::sync::Arc;

mod access;
mod clustermappings;
mod namespacemappings;
mod pvcsync;
mod remoteclusters;
mod scheduler;
mod sync;
mod util;

use access::ClusterAccess;

#[derive(Parser, Debug, Clone)]
#[command(name = "dr-syncer-operator")]
struct Args {
    /// Namespace the CRDs, leases and credential secrets live in
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Port the prometheus text endpoint listens on
    #[cfg(feature = "metrics")]
    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    drsync_common::init();
    let args = Args::parse();

    let client = Client::try_default().await?;
    let access = Arc::new(ClusterAccess::new(client.clone(), args.namespace.clone()));

    #[cfg(feature = "metrics")]
    tokio::spawn(util::metrics::serve(args.metrics_port));

    drsync_common::signal_ready();
    println!("{}", "🌱 dr-syncer operator starting".green());

    tokio::try_join!(
        remoteclusters::run(client.clone(), access.clone()),
        clustermappings::run(client.clone(), access.clone()),
        namespacemappings::run(client.clone(), access.clone()),
    )?;
    Ok(())
}
