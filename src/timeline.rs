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

//! The parsed, schedulable representation of a MIDI resource.

use std::fmt;

use serde::Serialize;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// A MIDI key number. Displays as a note name with octave, where key 60 is C4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Pitch(u8);

impl Pitch {
    /// Creates a new pitch. Keys above 127 are clamped.
    pub fn new(key: u8) -> Pitch {
        Pitch(key.min(127))
    }

    /// Gets the MIDI key number.
    pub fn key(&self) -> u8 {
        self.0
    }

    /// Gets the equal-tempered frequency of this pitch in Hz, with A4 at 440Hz.
    pub fn frequency(&self) -> f64 {
        440.0 * 2f64.powf((f64::from(self.0) - 69.0) / 12.0)
    }
}

impl fmt::Display for Pitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let octave = i16::from(self.0 / 12) - 1;
        write!(f, "{}{}", NOTE_NAMES[usize::from(self.0 % 12)], octave)
    }
}

/// A single note, timed in seconds relative to the start of the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NoteEvent {
    pitch: Pitch,
    start: f64,
    duration: f64,
    velocity: f32,
}

impl NoteEvent {
    /// Creates a new note event. Negative times are clamped to zero and velocity to [0, 1].
    pub fn new(pitch: Pitch, start: f64, duration: f64, velocity: f32) -> NoteEvent {
        NoteEvent {
            pitch,
            start: start.max(0.0),
            duration: duration.max(0.0),
            velocity: velocity.clamp(0.0, 1.0),
        }
    }

    pub fn pitch(&self) -> Pitch {
        self.pitch
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn velocity(&self) -> f32 {
        self.velocity
    }

    /// The time at which the note stops sounding.
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// A sequence of notes from one track of a MIDI file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Track {
    /// The track name, if the file declared one.
    name: Option<String>,
    /// The MIDI channel (0-15) of the first note in the track.
    channel: u8,
    /// The first program selected on the track's channel.
    program: Option<u8>,
    /// The notes in this track. Order is not significant.
    notes: Vec<NoteEvent>,
}

impl Track {
    /// Creates a new track.
    pub fn new(
        name: Option<String>,
        channel: u8,
        program: Option<u8>,
        notes: Vec<NoteEvent>,
    ) -> Track {
        Track {
            name,
            channel,
            program,
            notes,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn program(&self) -> Option<u8> {
        self.program
    }

    pub fn notes(&self) -> &[NoteEvent] {
        &self.notes
    }

    /// The end time of the last note in the track.
    pub fn end(&self) -> f64 {
        self.notes.iter().map(NoteEvent::end).fold(0.0, f64::max)
    }
}

/// The tracks of a parsed MIDI resource and their total duration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedTimeline {
    tracks: Vec<Track>,
    /// The latest end time over every note in every track.
    duration: f64,
}

impl ParsedTimeline {
    /// Creates a timeline from the given tracks, computing its duration.
    pub fn new(tracks: Vec<Track>) -> ParsedTimeline {
        let duration = tracks.iter().map(Track::end).fold(0.0, f64::max);
        ParsedTimeline { tracks, duration }
    }

    /// A timeline with no tracks and zero duration.
    pub fn empty() -> ParsedTimeline {
        ParsedTimeline::new(Vec::new())
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Gets the duration of the timeline in seconds.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Iterates over every note in every track.
    pub fn notes(&self) -> impl Iterator<Item = &NoteEvent> {
        self.tracks.iter().flat_map(|track| track.notes.iter())
    }

    /// Gets the number of notes across all tracks.
    pub fn note_count(&self) -> usize {
        self.tracks.iter().map(|track| track.notes.len()).sum()
    }

    /// Returns the duration string in minutes and seconds.
    pub fn duration_string(&self) -> String {
        format_seconds(self.duration)
    }
}

impl fmt::Display for ParsedTimeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Duration: {}\n  Notes: {}\n  Tracks ({}):",
            self.duration_string(),
            self.note_count(),
            self.tracks.len()
        )?;
        for track in self.tracks.iter() {
            writeln!(
                f,
                "  - {} (channel: {}, program: {}, notes: {})",
                track.name().unwrap_or("unnamed"),
                track.channel + 1,
                track
                    .program
                    .map_or_else(|| "none".to_string(), |program| program.to_string()),
                track.notes.len(),
            )?;
        }
        Ok(())
    }
}

/// Formats seconds as minutes and seconds.
pub fn format_seconds(seconds: f64) -> String {
    let secs = seconds.max(0.0).round() as u64;
    format!("{}:{:02}", secs / 60, secs % 60)
}
