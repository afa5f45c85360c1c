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

use tokio::{sync::mpsc::Sender, task::JoinHandle};
use tracing::{info, span, warn, Level};

use super::Event;

const PLAY: &str = "play";
const TOGGLE: &str = "toggle";
const PAUSE: &str = "pause";
const RESUME: &str = "resume";
const SEEK: &str = "seek";
const LOOP: &str = "loop";
const AUTOPLAY: &str = "autoplay";
const VOLUME: &str = "volume";
const MUTE: &str = "mute";
const CLOSE: &str = "close";
const STATUS: &str = "status";
const QUIT: &str = "quit";

/// A controller that controls a player using the keyboard, one command per line.
pub struct Driver {}

impl Driver {
    pub fn new() -> Driver {
        Driver {}
    }

    /// Reads and forwards one command. Returns false once the input is exhausted.
    fn monitor_io<R, W>(
        events_tx: &Sender<Event>,
        mut reader: R,
        mut writer: W,
    ) -> Result<bool, io::Error>
    where
        R: io::BufRead,
        W: io::Write,
    {
        write!(
            writer,
            "Command ({} <id>, {}, {}, {}, {} <seconds>, {} on|off, {} on|off, {} <0-1>, {}, {}, {}, {}): ",
            PLAY, TOGGLE, PAUSE, RESUME, SEEK, LOOP, AUTOPLAY, VOLUME, MUTE, CLOSE, STATUS, QUIT,
        )?;
        writer.flush()?;
        let mut input: String = String::default();
        if reader.read_line(&mut input)? == 0 {
            return Ok(false);
        }

        match parse(&input) {
            Ok(event) => events_tx
                .blocking_send(event)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
            Err(reason) => warn!(input = input.trim(), reason = %reason, "Unrecognized input"),
        }
        Ok(true)
    }
}

impl Default for Driver {
    fn default() -> Self {
        Driver::new()
    }
}

/// Parses a command line into an event.
fn parse(input: &str) -> Result<Event, String> {
    let input = input.trim();
    let (command, argument) = match input.split_once(char::is_whitespace) {
        Some((command, argument)) => (command, argument.trim()),
        None => (input, ""),
    };

    match command.to_lowercase().as_str() {
        // Ids may contain spaces, so the whole remainder is the id.
        PLAY if !argument.is_empty() => Ok(Event::Play(argument.to_string())),
        PLAY => Err("play needs a resource id".to_string()),
        TOGGLE => Ok(Event::Toggle),
        PAUSE => Ok(Event::Pause),
        RESUME => Ok(Event::Resume),
        SEEK => argument
            .parse::<f64>()
            .map(Event::Seek)
            .map_err(|e| format!("invalid position: {}", e)),
        LOOP => on_off(argument).map(Event::Loop),
        AUTOPLAY => on_off(argument).map(Event::Autoplay),
        VOLUME => argument
            .parse::<f32>()
            .map(Event::Volume)
            .map_err(|e| format!("invalid volume: {}", e)),
        MUTE => Ok(Event::Mute),
        CLOSE => Ok(Event::Close),
        STATUS => Ok(Event::Status),
        QUIT => Ok(Event::Quit),
        _ => Err("unknown command".to_string()),
    }
}

fn on_off(argument: &str) -> Result<bool, String> {
    match argument.to_lowercase().as_str() {
        "on" | "true" | "yes" => Ok(true),
        "off" | "false" | "no" => Ok(false),
        _ => Err(format!("expected on or off, got {:?}", argument)),
    }
}

impl super::Driver for Driver {
    fn monitor_events(&self, events_tx: Sender<Event>) -> JoinHandle<Result<(), io::Error>> {
        tokio::task::spawn_blocking(move || {
            let span = span!(Level::INFO, "keyboard driver");
            let _enter = span.enter();

            info!("Keyboard driver started.");

            while Self::monitor_io(&events_tx, io::stdin().lock(), io::stdout())? {}
            info!("Keyboard input closed.");
            Ok(())
        })
    }
}
