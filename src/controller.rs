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
use std::io;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::{sync::mpsc::Sender, task::JoinHandle};
use tracing::{error, info, span, Instrument, Level};

use crate::player::Player;

pub mod keyboard;

/// Controller events that will trigger behavior in the player.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Loads and plays the resource with the given id.
    Play(String),

    /// Pauses while playing, resumes while paused.
    Toggle,

    Pause,

    Resume,

    /// Moves to the given position in seconds.
    Seek(f64),

    /// Turns looping on or off.
    Loop(bool),

    /// Turns autoplay of the next resource on or off.
    Autoplay(bool),

    /// Sets the volume between 0 and 1.
    Volume(f32),

    /// Mutes or unmutes.
    Mute,

    /// Stops playback and forgets the current resource.
    Close,

    /// Reports the player state.
    Status,

    /// Closes the player and stops the controller.
    Quit,
}

pub trait Driver: Send + Sync + 'static {
    fn monitor_events(&self, events_tx: Sender<Event>) -> JoinHandle<Result<(), io::Error>>;
}

/// Applies driver events to a player.
pub struct Controller {
    handle: JoinHandle<()>,
}

impl Controller {
    /// Creates a new controller with the given driver.
    pub fn new(player: Player, driver: Arc<dyn Driver>) -> Controller {
        let span = span!(Level::INFO, "controller");
        Controller {
            handle: tokio::spawn(Controller::trigger_events(player, driver).instrument(span)),
        }
    }

    /// Join will block until the controller finishes.
    pub async fn join(&mut self) -> Result<(), JoinError> {
        (&mut self.handle).await
    }

    /// Triggers player events by watching the driver and getting events from it.
    async fn trigger_events(player: Player, driver: Arc<dyn Driver>) {
        let (events_tx, mut events_rx) = mpsc::channel(1);
        let join_handle = driver.monitor_events(events_tx);

        info!("Controller started.");

        while let Some(event) = events_rx.recv().await {
            info!(event = format!("{:?}", event), "Received event.");

            let result = match event {
                Event::Play(id) => player.play_resource(&id).await,
                Event::Toggle => player.toggle_play_pause().await,
                Event::Pause => {
                    player.pause().await;
                    Ok(())
                }
                Event::Resume => player.resume().await,
                Event::Seek(seconds) => {
                    player.seek(seconds).await;
                    Ok(())
                }
                Event::Loop(looping) => {
                    player.set_looping(looping).await;
                    Ok(())
                }
                Event::Autoplay(autoplay_next) => {
                    player.set_autoplay_next(autoplay_next).await;
                    Ok(())
                }
                Event::Volume(volume) => {
                    player.set_volume(volume).await;
                    Ok(())
                }
                Event::Mute => {
                    player.toggle_mute().await;
                    Ok(())
                }
                Event::Close => {
                    player.close().await;
                    Ok(())
                }
                Event::Status => {
                    info!(state = %player.state(), "Status.");
                    Ok(())
                }
                Event::Quit => {
                    player.close().await;
                    // The driver may be blocked on input, so it isn't waited for.
                    info!("Controller quitting.");
                    return;
                }
            };

            if let Err(e) = result {
                error!(err = %e, "Error talking to player.");
            }
        }

        info!("Controller closing.");
        match join_handle.await {
            Ok(Err(e)) => error!(err = %e, "Event monitor failed."),
            Err(e) => error!(err = %e, "Error waiting for event monitor to stop."),
            Ok(Ok(())) => {}
        }
    }
}
