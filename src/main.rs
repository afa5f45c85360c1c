// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{crate_version, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mplay::config::{self, AutoplayOrder};
use mplay::controller::{keyboard, Controller};
use mplay::library::Library;
use mplay::player::Status;
use mplay::{loader, sampler};

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A MIDI player."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists and verifies all MIDI files in the given library.
    Library {
        /// The path to the library on disk.
        path: String,
    },
    /// Parses a MIDI file and prints its tracks.
    Inspect {
        /// The MIDI file to inspect.
        file: String,
        /// Prints the full timeline as JSON.
        #[arg(short, long)]
        json: bool,
    },
    /// Lists the available audio output devices and MIDI output ports.
    Devices {},
    /// Plays a single resource from the configured library until it ends.
    Play {
        /// The path to the player config.
        player_path: String,
        /// The id of the resource to play.
        id: String,
    },
    /// Start will start the interactive player.
    Start {
        /// The path to the player config.
        player_path: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Library { path } => {
            let library = Library::scan(&PathBuf::from(&path), AutoplayOrder::Sequential)?;

            if library.is_empty() {
                println!("No MIDI files found in {}.", path.as_str());
                return Ok(());
            }

            println!("Resources (count: {}):", library.len());
            for id in library.ids() {
                let Some(file) = library.path(id) else {
                    continue;
                };
                match loader::parse(&tokio::fs::read(file).await?) {
                    Ok(timeline) => println!(
                        "- {} (Duration: {}, Notes: {})",
                        id,
                        timeline.duration_string(),
                        timeline.note_count()
                    ),
                    Err(e) => println!("- {} (invalid: {})", id, e),
                }
            }
        }
        Commands::Inspect { file, json } => {
            let timeline = loader::parse(&tokio::fs::read(&file).await?)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&timeline)?);
            } else {
                println!("{}:\n  {}", file, timeline);
            }
        }
        Commands::Devices {} => {
            let devices = sampler::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::Play { player_path, id } => {
            let player = config::init_player(&PathBuf::from(player_path))?;
            player.load_sampler().await?;
            player.set_autoplay_next(false).await;
            player.set_looping(false).await;

            let mut state = player.subscribe();
            player.play_resource(&id).await?;
            let finished = state
                .wait_for(|state| state.status != Status::Playing)
                .await?
                .clone();
            info!(state = %finished, "Playback finished.");
            if let Some(last_error) = finished.last_error {
                return Err(last_error.into());
            }
            player.close().await;
        }
        Commands::Start { player_path } => {
            let player = config::init_player(&PathBuf::from(player_path))?;
            player.load_sampler().await?;
            Controller::new(player, Arc::new(keyboard::Driver::new()))
                .join()
                .await?;
        }
    }

    Ok(())
}
