use std::{env, sync::Arc};

use anyhow::{anyhow, Context};
use cbcloud::prelude::*;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const DEFAULT_MANIFEST: &str = "couchbase.json";

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("cbcloud=info".parse()?))
        .init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("cbcloud");
    let strict = args.iter().any(|arg| arg == "--strict");
    let positional: Vec<&String> = args
        .iter()
        .skip(1)
        .filter(|arg| !arg.starts_with("--"))
        .collect();
    let Some(command) = positional.first() else {
        print_usage(program);
        return Err(anyhow!("No arguments has been provided"));
    };
    let config = ProviderConfig::from_env().context("Invalid provider configuration")?;
    let rt = tokio::runtime::Runtime::new()?;
    let mut cloud = create_cloud(rt.handle(), &config)?;
    match command.as_str() {
        "apply" => {
            let path = positional.get(1).map(|p| p.as_str()).unwrap_or(DEFAULT_MANIFEST);
            let manifest = Manifest::load(path)?;
            manifest
                .declare(&cloud.couchbase_provider())
                .context("Could not declare resources")?;
            let report = cloud
                .apply()
                .context("Could not apply cluster configuration")?;
            for key in report.pending.iter().chain(report.skipped.iter()) {
                warn!(resource = %key, "Not settled yet, run apply again");
            }
            if strict {
                report.require_settled()?;
            }
            Ok(())
        }
        "destroy" => cloud
            .destroy()
            .map(|_| ())
            .context("Could not destroy cluster configuration"),
        other => {
            print_usage(program);
            Err(anyhow!("Invalid command: {}", other))
        }
    }
}

fn print_usage(cmd: &str) {
    println!("Usage: {} <command> [manifest] [--strict]", cmd);
    println!("Commands:");
    println!("  apply    Apply the manifest (default {})", DEFAULT_MANIFEST);
    println!("  destroy  Remove every tracked resource");
    println!("Options:");
    println!("  --strict  Fail apply when a resource is not visible yet");
    println!("Environment:");
    println!("  COUCHBASE_URL, COUCHBASE_USERNAME, COUCHBASE_PASSWORD, COUCHBASE_CLUSTER,");
    println!("  COUCHBASE_BUCKET_CREATION_DELAY, COUCHBASE_QUERY_URL,");
    println!("  COUCHBASE_REQUEST_TIMEOUT, COUCHBASE_STATE_FILE");
}

fn create_cloud(handle: &tokio::runtime::Handle, config: &ProviderConfig) -> anyhow::Result<CbCloud> {
    let client = RestClusterClient::connect(handle, config)
        .with_context(|| format!("Could not set up a client for {}", config.url))?;
    let context = ReconcileContext::new(
        config.cluster_name(),
        Arc::new(client),
        Confirmations::from_config(config),
    );
    let mut cloud = CbCloud::new(
        Datastore::new(FileStorage::new(&config.state_file)),
        context,
    );
    cloud.init_registry();
    Ok(cloud)
}
