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

//! The playback clock. The transport owns the schedule of note commands for the loaded track and
//! a dispatch task that hands commands to the sampler shortly before they are due, stamped with
//! the instant at which they must sound.

use std::{fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, span, Level, Span};

use crate::{
    sampler::Sampler,
    timeline::{ParsedTimeline, Pitch},
};

/// Dispatch tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    /// How often the dispatch task wakes.
    pub dispatch_interval: Duration,
    /// How far ahead of the playhead commands are handed to the sampler.
    pub lookahead: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            dispatch_interval: Duration::from_millis(25),
            lookahead: Duration::from_millis(100),
        }
    }
}

/// A note command on the schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    NoteOn { pitch: Pitch, velocity: f32 },
    NoteOff { pitch: Pitch },
}

impl Command {
    /// Note-offs sort ahead of note-ons at the same instant so repeated notes retrigger.
    fn rank(&self) -> u8 {
        match self {
            Command::NoteOff { .. } => 0,
            Command::NoteOn { .. } => 1,
        }
    }
}

/// A command at a position on the transport's timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledEvent {
    time: f64,
    command: Command,
}

impl ScheduledEvent {
    pub fn new(time: f64, command: Command) -> ScheduledEvent {
        ScheduledEvent {
            time: time.max(0.0),
            command,
        }
    }

    /// Builds the sorted schedule for a timeline. Notes without length are inaudible and skipped.
    pub fn from_timeline(timeline: &ParsedTimeline) -> Vec<ScheduledEvent> {
        let mut events: Vec<ScheduledEvent> = timeline
            .notes()
            .filter(|note| note.duration() > 0.0)
            .flat_map(|note| {
                [
                    ScheduledEvent::new(
                        note.start(),
                        Command::NoteOn {
                            pitch: note.pitch(),
                            velocity: note.velocity(),
                        },
                    ),
                    ScheduledEvent::new(note.end(), Command::NoteOff { pitch: note.pitch() }),
                ]
            })
            .collect();
        events.sort_by(|a, b| {
            a.time
                .total_cmp(&b.time)
                .then(a.command.rank().cmp(&b.command.rank()))
        });
        events
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn command(&self) -> Command {
        self.command
    }
}

/// The part of the timeline that repeats while looping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopWindow {
    start: f64,
    end: f64,
}

impl LoopWindow {
    /// Creates a loop window. Returns None unless the window has a positive length.
    pub fn new(start: f64, end: f64) -> Option<LoopWindow> {
        let start = start.max(0.0);
        if end.is_finite() && end > start {
            Some(LoopWindow { start, end })
        } else {
            None
        }
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    fn length(&self) -> f64 {
        self.end - self.start
    }
}

impl fmt::Display for LoopWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s-{:.3}s", self.start, self.end)
    }
}

/// The transport for a single track at a time.
pub struct Transport {
    shared: Arc<Shared>,
    settings: Settings,
}

struct Shared {
    state: Mutex<State>,
    sampler: Arc<dyn Sampler>,
    span: Span,
}

#[derive(Default)]
struct State {
    /// When the clock last started. Set only while running.
    anchor: Option<Instant>,
    /// The position at the anchor, or the frozen position while stopped.
    offset: f64,
    duration: f64,
    loop_window: Option<LoopWindow>,
    schedule: Vec<ScheduledEvent>,
    /// The next event to hand to the sampler.
    cursor: usize,
    /// How far the next loop cycle has already been handed to the sampler.
    ahead: Option<usize>,
    /// Pitches handed over as note-ons whose note-offs have not been handed over yet.
    held: Vec<Pitch>,
    cycles: u64,
    dispatcher: Option<JoinHandle<()>>,
}

impl State {
    fn is_running(&self) -> bool {
        self.anchor.is_some()
    }

    fn raw_position(&self, now: Instant) -> f64 {
        match self.anchor {
            Some(anchor) => self.offset + now.saturating_duration_since(anchor).as_secs_f64(),
            None => self.offset,
        }
    }

    fn position(&self, now: Instant) -> f64 {
        self.raw_position(now).clamp(0.0, self.duration)
    }

    /// The loop window in effect, limited to the track.
    fn active_loop(&self) -> Option<LoopWindow> {
        self.loop_window
            .and_then(|window| LoopWindow::new(window.start, window.end.min(self.duration)))
    }

    fn rewind_cursor(&mut self, position: f64) {
        self.cursor = self.schedule.partition_point(|event| event.time < position);
    }

    /// The pitches of the notes that have started but not ended at the given position.
    fn sounding_at(&self, position: f64) -> Vec<Pitch> {
        let mut sounding = Vec::new();
        for event in self.schedule.iter().take_while(|event| event.time < position) {
            match event.command {
                Command::NoteOn { pitch, .. } => sounding.push(pitch),
                Command::NoteOff { pitch } => {
                    if let Some(index) = sounding.iter().position(|held| *held == pitch) {
                        sounding.swap_remove(index);
                    }
                }
            }
        }
        sounding
    }

    /// Wraps the clock back into the loop window once it passes the window's end.
    fn wrap(&mut self, now: Instant, sampler: &dyn Sampler) -> bool {
        let Some(window) = self.active_loop() else {
            return false;
        };
        if !self.is_running() {
            return false;
        }
        let position = self.raw_position(now);
        if position < window.end {
            return false;
        }

        let excess = (position - window.end) % window.length();
        self.offset = window.start + excess;
        self.anchor = Some(now);
        match self.ahead.take() {
            Some(cursor) => self.cursor = cursor,
            None => {
                // Nothing was handed over across the boundary, so nothing stopped the tail.
                self.rewind_cursor(window.start);
                self.held.clear();
                sampler.release_all();
            }
        }
        self.cycles += 1;
        true
    }

    fn send(&mut self, sampler: &dyn Sampler, command: Command, at: Instant) {
        match command {
            Command::NoteOn { pitch, velocity } => {
                sampler.note_on(pitch, at, velocity);
                self.held.push(pitch);
            }
            Command::NoteOff { pitch } => {
                sampler.note_off(pitch, at);
                if let Some(index) = self.held.iter().position(|held| *held == pitch) {
                    self.held.swap_remove(index);
                }
            }
        }
    }

    /// Hands every event inside the lookahead to the sampler.
    fn dispatch(&mut self, now: Instant, sampler: &dyn Sampler, lookahead: Duration) -> usize {
        if !self.is_running() {
            return 0;
        }
        self.wrap(now, sampler);

        let position = self.raw_position(now);
        let horizon = position + lookahead.as_secs_f64();
        let window = self.active_loop();
        let limit = window.map(|window| window.end).unwrap_or(f64::INFINITY);

        let mut dispatched = 0;
        while let Some(event) = self.schedule.get(self.cursor).copied() {
            if event.time > horizon || event.time >= limit {
                break;
            }
            let at = now + Duration::from_secs_f64((event.time - position).max(0.0));
            self.send(sampler, event.command, at);
            self.cursor += 1;
            dispatched += 1;
        }

        match window {
            Some(window) if horizon >= window.end => {
                dispatched + self.dispatch_next_cycle(now, position, horizon, window, sampler)
            }
            _ => dispatched,
        }
    }

    /// Hands over the start of the next loop cycle once the boundary is inside the lookahead.
    /// Notes still held at the boundary are stopped there.
    fn dispatch_next_cycle(
        &mut self,
        now: Instant,
        position: f64,
        horizon: f64,
        window: LoopWindow,
        sampler: &dyn Sampler,
    ) -> usize {
        let boundary = now + Duration::from_secs_f64((window.end - position).max(0.0));
        let mut dispatched = 0;
        let mut cursor = match self.ahead {
            Some(cursor) => cursor,
            None => {
                for pitch in std::mem::take(&mut self.held) {
                    sampler.note_off(pitch, boundary);
                    dispatched += 1;
                }
                self.schedule.partition_point(|event| event.time < window.start)
            }
        };

        let head = (window.start + (horizon - window.end)).min(window.end);
        while let Some(event) = self.schedule.get(cursor).copied() {
            if event.time > head || event.time >= window.end {
                break;
            }
            let at = boundary + Duration::from_secs_f64(event.time - window.start);
            self.send(sampler, event.command, at);
            cursor += 1;
            dispatched += 1;
        }
        self.ahead = Some(cursor);
        dispatched
    }

    /// Freezes the clock and drops everything the sampler has not played yet.
    fn halt(&mut self, now: Instant, sampler: &dyn Sampler) {
        if self.is_running() {
            self.wrap(now, sampler);
            self.offset = self.position(now);
            self.anchor = None;
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
        sampler.cancel_scheduled();
        sampler.release_all();
        self.ahead = None;
        self.held.clear();
        let offset = self.offset;
        self.rewind_cursor(offset);
    }
}

impl Transport {
    pub fn new(sampler: Arc<dyn Sampler>, settings: Settings) -> Transport {
        Transport {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                sampler,
                span: span!(Level::INFO, "transport"),
            }),
            settings,
        }
    }

    /// Replaces the schedule with the given events. The transport is stopped and rewound.
    pub fn load(&self, schedule: Vec<ScheduledEvent>, duration: f64) {
        let mut state = self.shared.state.lock();
        state.halt(Instant::now(), self.shared.sampler.as_ref());
        debug!(
            parent: &self.shared.span,
            events = schedule.len(),
            duration,
            "Loaded schedule."
        );
        state.schedule = schedule;
        state.duration = duration.max(0.0);
        state.offset = 0.0;
        state.cursor = 0;
        state.cycles = 0;
    }

    /// Starts the clock from the current position. Starting a running transport does nothing.
    pub fn start(&self) {
        let mut state = self.shared.state.lock();
        if state.is_running() {
            return;
        }
        state.anchor = Some(Instant::now());
        let offset = state.offset;
        state.rewind_cursor(offset);
        state.dispatcher = Some(self.spawn_dispatcher());
        debug!(parent: &self.shared.span, position = offset, "Started.");
    }

    /// Freezes the clock at the current position. Commands the sampler has not played yet are
    /// cancelled and sounding voices released, so resuming reschedules from the frozen position.
    pub fn pause(&self) {
        let mut state = self.shared.state.lock();
        if !state.is_running() {
            return;
        }
        state.halt(Instant::now(), self.shared.sampler.as_ref());
        debug!(parent: &self.shared.span, position = state.offset, "Paused.");
    }

    /// Halts the transport and clears the schedule. With reset the position returns to 0.
    pub fn stop(&self, reset: bool) {
        let mut state = self.shared.state.lock();
        state.halt(Instant::now(), self.shared.sampler.as_ref());
        state.schedule.clear();
        state.cursor = 0;
        if reset {
            state.offset = 0.0;
            state.duration = 0.0;
        }
        debug!(parent: &self.shared.span, reset, "Stopped.");
    }

    /// Moves the clock to the given position, clamped to the track. A position at or past the end
    /// of the loop window lands on the window's start. A running transport keeps running from
    /// there. Returns the new position.
    pub fn seek(&self, position: f64) -> f64 {
        let mut state = self.shared.state.lock();
        let position = if position.is_nan() {
            0.0
        } else {
            position.clamp(0.0, state.duration)
        };
        let position = match state.active_loop() {
            Some(window) if position >= window.end => window.start,
            _ => position,
        };

        let running = state.is_running();
        state.halt(Instant::now(), self.shared.sampler.as_ref());
        state.offset = position;
        state.rewind_cursor(position);
        if running {
            state.anchor = Some(Instant::now());
            state.dispatcher = Some(self.spawn_dispatcher());
        }
        debug!(parent: &self.shared.span, position, running, "Seeked.");
        position
    }

    /// Sets or clears the loop window. Takes effect from the next wrap check.
    pub fn set_loop(&self, window: Option<LoopWindow>) {
        let mut state = self.shared.state.lock();
        if state.loop_window == window {
            return;
        }
        state.loop_window = window;
        if state.ahead.take().is_some() {
            // The next cycle was handed over for the old window.
            let now = Instant::now();
            self.shared.sampler.cancel_scheduled();
            let position = state.position(now);
            state.rewind_cursor(position);
            state.held = state.sounding_at(position);
            debug!(parent: &self.shared.span, position, "Rescheduled for the new loop window.");
        }
    }

    pub fn loop_window(&self) -> Option<LoopWindow> {
        self.shared.state.lock().active_loop()
    }

    /// The current position in seconds, between 0 and the track duration.
    pub fn position(&self) -> f64 {
        let mut state = self.shared.state.lock();
        let now = Instant::now();
        state.wrap(now, self.shared.sampler.as_ref());
        state.position(now)
    }

    pub fn duration(&self) -> f64 {
        self.shared.state.lock().duration
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().is_running()
    }

    /// The number of times the clock has wrapped since the schedule was loaded.
    pub fn cycles(&self) -> u64 {
        self.shared.state.lock().cycles
    }

    /// The number of events not yet handed to the sampler in this pass.
    pub fn remaining(&self) -> usize {
        let state = self.shared.state.lock();
        state.schedule.len() - state.cursor.min(state.schedule.len())
    }

    fn spawn_dispatcher(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let settings = self.settings;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(settings.dispatch_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let mut state = shared.state.lock();
                if !state.is_running() {
                    return;
                }
                state.dispatch(Instant::now(), shared.sampler.as_ref(), settings.lookahead);
            }
        })
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.shared.state.lock().dispatcher.take() {
            dispatcher.abort();
        }
    }
}
