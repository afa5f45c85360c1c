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

//! Shared fixtures for unit tests.

pub mod smf;

use std::time::Duration;

use crate::{
    library::MemoryLibrary,
    testutil::smf::{midi_file, TrackSpec},
};
use midly::{num::u15, Format, Timing};

/// Ticks per quarter note used by the fixtures. At the default tempo of 120 BPM one second is
/// twice this many ticks.
pub const PPQ: u16 = 480;

/// Converts seconds at the default tempo into fixture ticks.
pub fn ticks(seconds: f64) -> u32 {
    (seconds * f64::from(PPQ) * 2.0).round() as u32
}

/// Builds a MIDI file with one note per second on the given key, lasting `seconds` in total.
pub fn steady_file(seconds: u32, key: u8) -> Vec<u8> {
    let mut track = TrackSpec::new().name("steady");
    for second in 0..seconds {
        track = track.note(ticks(f64::from(second)), ticks(0.5), key, 100);
    }
    // Holds the final note so the file lasts exactly the requested time.
    if seconds > 0 {
        track = track.note(ticks(f64::from(seconds) - 0.5), ticks(0.5), key, 100);
    }
    midi_file(
        Format::Parallel,
        Timing::Metrical(u15::new(PPQ)),
        vec![track],
    )
}

/// Builds a valid MIDI file with no notes.
pub fn silent_file() -> Vec<u8> {
    midi_file(
        Format::Parallel,
        Timing::Metrical(u15::new(PPQ)),
        vec![TrackSpec::new().name("silence")],
    )
}

/// Creates an in-memory library holding the given resources.
pub fn library_with(resources: &[(&str, Vec<u8>)]) -> MemoryLibrary {
    let library = MemoryLibrary::new();
    for (id, bytes) in resources {
        library.insert(id, bytes.clone());
    }
    library
}

/// Wait for the given async predicate to return true or fail.
pub async fn eventually_async<F, Fut>(mut predicate: F, error_msg: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let tick = Duration::from_millis(10);
    let timeout = Duration::from_secs(30);
    let start = tokio::time::Instant::now();

    loop {
        if start.elapsed() > timeout {
            panic!("{}", error_msg);
        }
        if predicate().await {
            return;
        }
        tokio::time::sleep(tick).await;
    }
}
