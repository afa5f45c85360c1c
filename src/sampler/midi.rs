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

//! Drives an external instrument over a MIDI output port. A worker thread owns the connection
//! and sends each command at its instant.

use std::{
    cmp::Reverse,
    collections::{BTreeSet, BinaryHeap},
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use futures_util::future::{BoxFuture, FutureExt};
use midir::{MidiOutput, MidiOutputConnection};
use midly::{
    live::LiveEvent,
    num::{u4, u7},
    MidiMessage,
};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, span, warn, Level, Span};

use crate::{error, timeline::Pitch};

/// Commands within this window of their instant are spun for rather than slept for.
const SPIN_WINDOW: Duration = Duration::from_millis(2);
const VOLUME_CONTROLLER: u8 = 7;
const ALL_NOTES_OFF_CONTROLLER: u8 = 123;

enum Message {
    Note {
        at: std::time::Instant,
        generation: u64,
        key: u8,
        /// None for a note-off.
        velocity: Option<u8>,
    },
    ReleaseAll,
    Volume(u8),
}

/// A sampler that plays through an external MIDI instrument.
pub struct Sampler {
    name: String,
    channel: u4,
    ready: AtomicBool,
    generation: Arc<AtomicU64>,
    sender: Mutex<Option<Sender<Message>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    span: Span,
}

impl Sampler {
    pub fn new(name: &str) -> Sampler {
        Sampler {
            name: name.to_string(),
            channel: u4::new(0),
            ready: AtomicBool::new(false),
            generation: Arc::new(AtomicU64::new(0)),
            sender: Mutex::new(None),
            worker: Mutex::new(None),
            span: span!(Level::INFO, "sampler (midi)"),
        }
    }

    fn send(&self, message: Message) {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return;
        };
        if sender.send(message).is_err() {
            warn!(parent: &self.span, "MIDI worker is gone, dropping command.");
        }
    }

    fn note(&self, pitch: Pitch, at: Instant, velocity: Option<f32>) {
        self.send(Message::Note {
            at: at.into_std(),
            generation: self.generation.load(Ordering::Acquire),
            key: pitch.key(),
            velocity: velocity.map(midi_velocity),
        });
    }
}

impl super::Sampler for Sampler {
    fn load(&self) -> BoxFuture<'_, Result<(), error::Error>> {
        async move {
            if self.is_ready() {
                return Ok(());
            }

            let name = self.name.clone();
            let connection = tokio::task::spawn_blocking(move || connect(&name))
                .await
                .map_err(|e| error::Error::AudioActivation(e.to_string()))?
                .map_err(error::Error::AudioActivation)?;

            let (sender, receiver) = crossbeam_channel::unbounded();
            let mut worker = Worker {
                connection,
                channel: self.channel,
                generation: self.generation.clone(),
                queue: BinaryHeap::new(),
                sequence: 0,
                held: BTreeSet::new(),
            };
            let span = self.span.clone();
            let handle = thread::spawn(move || {
                let _enter = span.enter();
                worker.run(receiver)
            });

            *self.sender.lock() = Some(sender);
            *self.worker.lock() = Some(handle);
            self.ready.store(true, Ordering::Release);
            info!(parent: &self.span, device = self.name, "MIDI output connected.");
            Ok(())
        }
        .boxed()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn note_on(&self, pitch: Pitch, at: Instant, velocity: f32) {
        self.note(pitch, at, Some(velocity));
    }

    fn note_off(&self, pitch: Pitch, at: Instant) {
        self.note(pitch, at, None);
    }

    fn cancel_scheduled(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn release_all(&self) {
        self.send(Message::ReleaseAll);
    }

    fn set_output(&self, volume: f32, muted: bool) {
        let value = if muted {
            0
        } else {
            (volume.clamp(0.0, 1.0) * 127.0).round() as u8
        };
        self.send(Message::Volume(value));
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        // Disconnecting the channel stops the worker.
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!(parent: &self.span, "MIDI worker panicked.");
            }
        }
    }
}

impl fmt::Display for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (MIDI output)", self.name)
    }
}

/// Lists the names of the available MIDI output ports.
pub fn list_ports() -> Result<Vec<String>, Box<dyn Error>> {
    let output = MidiOutput::new("mplay output listing")?;
    let mut names = Vec::new();
    for port in output.ports() {
        names.push(output.port_name(&port)?);
    }
    Ok(names)
}

/// Scales a normalized velocity to MIDI. A sounding note never goes out as velocity 0, which
/// receivers treat as a note-off.
fn midi_velocity(velocity: f32) -> u8 {
    (velocity.clamp(0.0, 1.0) * 127.0).round().max(1.0) as u8
}

fn connect(name: &str) -> Result<MidiOutputConnection, String> {
    let output = MidiOutput::new("mplay output").map_err(|e| e.to_string())?;
    let port = output
        .ports()
        .into_iter()
        .find(|port| output.port_name(port).is_ok_and(|port_name| port_name == name))
        .ok_or_else(|| format!("no MIDI output port named {}", name))?;
    output
        .connect(&port, "mplay sampler")
        .map_err(|e| e.to_string())
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Queued {
    at: std::time::Instant,
    sequence: u64,
    generation: u64,
    key: u8,
    velocity: Option<u8>,
}

/// Owns the MIDI connection and the time-ordered command queue.
struct Worker {
    connection: MidiOutputConnection,
    channel: u4,
    generation: Arc<AtomicU64>,
    queue: BinaryHeap<Reverse<Queued>>,
    sequence: u64,
    held: BTreeSet<u8>,
}

impl Worker {
    fn run(&mut self, receiver: Receiver<Message>) {
        loop {
            let message = match self.queue.peek() {
                None => receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
                Some(Reverse(next)) => {
                    let wait = next.at.saturating_duration_since(std::time::Instant::now());
                    if wait <= SPIN_WINDOW {
                        spin_sleep::sleep(wait);
                        self.fire_due();
                        continue;
                    }
                    receiver.recv_timeout(wait - SPIN_WINDOW)
                }
            };

            match message {
                Ok(Message::Note {
                    at,
                    generation,
                    key,
                    velocity,
                }) => {
                    self.sequence += 1;
                    self.queue.push(Reverse(Queued {
                        at,
                        sequence: self.sequence,
                        generation,
                        key,
                        velocity,
                    }));
                }
                Ok(Message::ReleaseAll) => self.release_all(),
                Ok(Message::Volume(value)) => {
                    self.send(MidiMessage::Controller {
                        controller: u7::new(VOLUME_CONTROLLER),
                        value: u7::new(value),
                    });
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.release_all();
                    debug!("MIDI worker stopping.");
                    return;
                }
            }
        }
    }

    fn fire_due(&mut self) {
        let now = std::time::Instant::now();
        let current = self.generation.load(Ordering::Acquire);
        while self.queue.peek().is_some_and(|Reverse(next)| next.at <= now) {
            let Some(Reverse(queued)) = self.queue.pop() else {
                return;
            };
            if queued.generation != current {
                continue;
            }

            let key = u7::new(queued.key);
            match queued.velocity {
                Some(vel) => {
                    self.held.insert(queued.key);
                    self.send(MidiMessage::NoteOn {
                        key,
                        vel: u7::new(vel),
                    });
                }
                None => {
                    self.held.remove(&queued.key);
                    self.send(MidiMessage::NoteOff {
                        key,
                        vel: u7::new(0),
                    });
                }
            }
        }
    }

    fn release_all(&mut self) {
        for key in std::mem::take(&mut self.held) {
            self.send(MidiMessage::NoteOff {
                key: u7::new(key),
                vel: u7::new(0),
            });
        }
        self.send(MidiMessage::Controller {
            controller: u7::new(ALL_NOTES_OFF_CONTROLLER),
            value: u7::new(0),
        });
    }

    fn send(&mut self, message: MidiMessage) {
        let event = LiveEvent::Midi {
            channel: self.channel,
            message,
        };
        // Choosing 8 here because that's the largest channel message plus headroom.
        let mut buf: Vec<u8> = Vec::with_capacity(8);
        if let Err(e) = event.write(&mut buf) {
            error!(err = e.to_string(), "Unable to encode MIDI event");
            return;
        }
        if let Err(e) = self.connection.send(&buf) {
            error!(err = e.to_string(), "Unable to send MIDI event");
        }
    }
}
