#![allow(clippy::print_stdout, reason = "the run report goes to stdout")]

use eyre::Result;
use odr_light_client::cli::{Command, NodeConfig};
use odr_light_client::logging::init_tracing;
use odr_light_client::run::{handle_pool, handle_sections, run_simulation};
use odr_light_client::storage::Storage;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_args();
    let guards = init_tracing(&config);

    let result = match config.command.clone().unwrap_or_default() {
        Command::Pool(args) => handle_pool(&args, &config),
        Command::Sections(args) => handle_sections(&args, &config),
        Command::Run(args) => {
            info!(
                network_id = config.network_id,
                data_dir = %config.data_dir.display(),
                servers = args.simulate,
                faulty = args.faulty,
                "starting light client"
            );
            let storage = Storage::open(&config)?;
            let report = run_simulation(&config, &args, storage).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    };
    guards.finish();
    result
}
