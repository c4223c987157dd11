use clap::Parser;
use log::error;

use orchestrator::TrainArgs;

fn main() {
    // The root logger must exist before anything else logs; verbosity comes
    // from LOGLEVEL, mirroring the launch scripts.
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("LOGLEVEL", "info")).init();

    let args = TrainArgs::parse();
    if let Err(e) = orchestrator::cli_main(&args) {
        // One clear line per failure category, then exit.
        error!("training run failed: {e}");
        std::process::exit(1);
    }
}
