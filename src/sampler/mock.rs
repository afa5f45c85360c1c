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

use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, span, Level, Span};

use crate::{error, timeline::Pitch};

/// A command recorded by the mock sampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    NoteOn { pitch: Pitch, velocity: f32 },
    NoteOff { pitch: Pitch },
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    at: Instant,
    command: Command,
    cancelled: bool,
}

/// A mock sampler. Commands are recorded rather than rendered, and count as sounded once the
/// clock passes their instant without having been cancelled.
pub struct Sampler {
    name: String,
    ready: AtomicBool,
    entries: Mutex<Vec<Entry>>,
    cancels: AtomicUsize,
    releases: AtomicUsize,
    output: Mutex<(f32, bool)>,
    span: Span,
}

impl Sampler {
    /// Gets a mock sampler with the given name. It must be loaded before it is ready.
    pub fn get(name: &str) -> Sampler {
        Sampler {
            name: name.to_string(),
            ready: AtomicBool::new(false),
            entries: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            output: Mutex::new((1.0, false)),
            span: span!(Level::INFO, "sampler (mock)"),
        }
    }

    /// Gets a mock sampler that is already loaded.
    #[cfg(test)]
    pub fn ready(name: &str) -> Sampler {
        let sampler = Sampler::get(name);
        sampler.ready.store(true, Ordering::Relaxed);
        sampler
    }

    /// Returns the commands that have sounded so far, in the order they were handed over.
    #[cfg(test)]
    pub fn sounded(&self) -> Vec<Command> {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .filter(|entry| !entry.cancelled && entry.at <= now)
            .map(|entry| entry.command)
            .collect()
    }

    /// Returns every command that has not been cancelled with the instant it sounds at.
    #[cfg(test)]
    pub fn scheduled(&self) -> Vec<(Instant, Command)> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| !entry.cancelled)
            .map(|entry| (entry.at, entry.command))
            .collect()
    }

    /// Returns the number of note-ons for the given pitch that have sounded so far.
    #[cfg(test)]
    pub fn note_ons(&self, pitch: Pitch) -> usize {
        self.sounded()
            .iter()
            .filter(|command| matches!(command, Command::NoteOn { pitch: p, .. } if *p == pitch))
            .count()
    }

    /// Returns the number of commands waiting for their instant.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .filter(|entry| !entry.cancelled && entry.at > now)
            .count()
    }

    /// Returns the number of times pending commands were cancelled.
    #[cfg(test)]
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::Relaxed)
    }

    /// Returns the number of times all voices were released.
    #[cfg(test)]
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::Relaxed)
    }

    /// Returns the current output stage.
    #[cfg(test)]
    pub fn output(&self) -> (f32, bool) {
        *self.output.lock()
    }

    fn record(&self, at: Instant, command: Command) {
        self.entries.lock().push(Entry {
            at,
            command,
            cancelled: false,
        });
    }
}

impl super::Sampler for Sampler {
    fn load(&self) -> BoxFuture<'_, Result<(), error::Error>> {
        debug!(parent: &self.span, name = self.name, "Loading mock sampler.");
        self.ready.store(true, Ordering::Relaxed);
        future::ready(Ok(())).boxed()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    fn note_on(&self, pitch: Pitch, at: Instant, velocity: f32) {
        self.record(at, Command::NoteOn { pitch, velocity });
    }

    fn note_off(&self, pitch: Pitch, at: Instant) {
        self.record(at, Command::NoteOff { pitch });
    }

    fn cancel_scheduled(&self) {
        let now = Instant::now();
        let mut cancelled = 0;
        for entry in self.entries.lock().iter_mut() {
            if !entry.cancelled && entry.at > now {
                entry.cancelled = true;
                cancelled += 1;
            }
        }
        self.cancels.fetch_add(1, Ordering::Relaxed);
        debug!(parent: &self.span, cancelled, "Cancelled pending commands.");
    }

    fn release_all(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    fn set_output(&self, volume: f32, muted: bool) {
        *self.output.lock() = (volume, muted);
    }
}

impl fmt::Display for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}
