use anyhow::Result;
use clap::Parser;
use dialdesk::app::AppStateBuilder;
use dialdesk::config::{Cli, Config};
use std::fs::File;
use tokio::select;
use tracing::{info, level_filters::LevelFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = cli
        .conf
        .map(|conf| Config::load(&conf).expect("Failed to load config"))
        .unwrap_or_default();

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file).expect("Failed to create log file");
        let (non_blocking, _guard) = tracing_appender::non_blocking(file);
        log_fmt.with_writer(non_blocking).try_init().ok();
    } else {
        log_fmt.try_init().ok();
    }

    let state = AppStateBuilder::new().config(config).build().await?;

    info!(
        "Starting {} on {}",
        dialdesk::version::get_short_version(),
        state.config.http_addr
    );
    select! {
        _ = dialdesk::app::run(state.clone()) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received CTRL+C, shutting down");
            state.token.cancel();
        }
    }
    Ok(())
}
