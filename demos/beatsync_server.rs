use clap::Parser;
use log::info;
use beatsync::{
    common::{
        box_error::BoxError,
        config::{Config, ServerSettings},
    },
    server::sync_server,
};

/// Host shared metronome sessions over websockets

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Settings file, defaults are used when it is missing
    #[arg(short, long, default_value = "settings.json")]
    config: String,

    /// Address to listen on, overrides the settings file
    #[arg(short, long)]
    listen: Option<String>,
}

fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::build(&args.config, ServerSettings::defaults())?;
    if let Some(listen) = args.listen {
        config.set_value("listen_addr", listen)?;
    }
    let settings = ServerSettings::from_config(&config)?;
    info!(
        "starting session server from {} with {:?}",
        config.get_filename(),
        settings
    );
    sync_server::run(&settings)?;
    Ok(())
}
