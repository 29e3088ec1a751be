use clap::Parser;
use fhevm_core_client::*;
use fhevm_instance::conf::init_conf;
use observability::telemetry::init_tracing;

// CLI
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CmdConfig::parse();
    let conf = init_conf(config.config.as_deref())?;

    let _guard = if config.logs {
        Some(init_tracing(&conf.telemetry.clone().unwrap_or_default())?)
    } else {
        None
    };

    let res = execute_cmd(&config, conf).await?;
    println!("{}", serde_json::to_string_pretty(&res)?);
    Ok(())
}
