use aqmirror::app::App;
use aqmirror::cli::Args;
use aqmirror::config::Config;
use aqmirror::logging::setup_logging;
use clap::Parser;
use figment::{Figment, providers::Env};
use std::process::ExitCode;
use tracing::info;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config and setup logging before App::new() so startup logs are
    // never silently dropped.
    let config: Config = Figment::new()
        .merge(Env::raw())
        .extract()
        .expect("Failed to load config");
    setup_logging(&config, args.tracing);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        "starting aqmirror"
    );

    let app = App::new(config)
        .await
        .expect("Failed to initialize application");
    app.run().await
}
