use clap::Parser;
use log::{error, info, warn};
use std::{
    io::{self, BufRead},
    sync::mpsc,
    thread::{self, sleep},
    time::Duration,
};
use beatsync::{
    client::{
        lookahead::{local_now_ms, Pulse},
        metronome_client::{self, UserCommand},
    },
    common::{
        box_error::BoxError,
        config::{ClientSettings, Config},
    },
};

/// Join a shared metronome session and print every pulse as it sounds
///
/// Commands on stdin: create NAME | join CODE NAME | leave | start | stop |
/// tempo BPM | meter N/D | trim MS

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Settings file, defaults are used when it is missing
    #[arg(short, long, default_value = "client_settings.json")]
    config: String,

    /// Server url, overrides the settings file
    #[arg(short, long)]
    url: Option<String>,

    /// Manual latency trim in milliseconds
    #[arg(short, long)]
    trim: Option<f64>,
}

/// Stand-in for a sound engine: wait for each pulse's instant, then print it.
fn render_pulses(pulse_rx: mpsc::Receiver<Pulse>) -> () {
    for pulse in pulse_rx.iter() {
        let wait = pulse.at - local_now_ms();
        if wait > 0.0 {
            sleep(Duration::from_secs_f64(wait / 1000.0));
        }
        if pulse.accent {
            println!("TICK  {}", pulse.index);
        } else {
            println!("tock  {}", pulse.index);
        }
    }
}

fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::build(&args.config, ClientSettings::defaults())?;
    if let Some(url) = args.url {
        config.set_value("server_url", url)?;
    }
    if let Some(trim) = args.trim {
        config.set_value("manual_trim_ms", trim)?;
    }
    let settings = ClientSettings::from_config(&config)?;
    info!("starting client from {} with {:?}", config.get_filename(), settings);

    let (pulse_tx, pulse_rx) = mpsc::channel();
    let _render_handle = thread::spawn(move || render_pulses(pulse_rx));

    let (cmd_tx, cmd_rx) = mpsc::channel();
    let _stdin_handle = thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    error!("stdin: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match UserCommand::parse(&line) {
                Ok(cmd) => {
                    if cmd_tx.send(cmd).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("{}", e),
            }
        }
    });

    metronome_client::run(settings, cmd_rx, pulse_tx)?;
    Ok(())
}
