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

//! A small builder for standard MIDI files.

use midly::{
    num::{u24, u28, u4, u7},
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind,
};

/// A single event at an absolute tick.
enum SpecEvent {
    Name(String),
    Tempo(u32),
    Program(u8),
    NoteOn(u8, u8),
    NoteOff(u8),
}

/// Describes one track of a MIDI file with events at absolute ticks.
#[derive(Default)]
pub struct TrackSpec {
    channel: u8,
    events: Vec<(u32, SpecEvent)>,
    end: u32,
}

impl TrackSpec {
    pub fn new() -> TrackSpec {
        TrackSpec::default()
    }

    /// Sets the channel for the events that follow.
    pub fn channel(mut self, channel: u8) -> TrackSpec {
        self.channel = channel;
        self
    }

    pub fn name(mut self, name: &str) -> TrackSpec {
        self.events.push((0, SpecEvent::Name(name.to_string())));
        self
    }

    pub fn tempo(self, tick: u32, micros_per_quarter: u32) -> TrackSpec {
        self.push(tick, SpecEvent::Tempo(micros_per_quarter))
    }

    pub fn program(self, tick: u32, program: u8) -> TrackSpec {
        self.push(tick, SpecEvent::Program(program))
    }

    pub fn note_on(self, tick: u32, key: u8, vel: u8) -> TrackSpec {
        self.push(tick, SpecEvent::NoteOn(key, vel))
    }

    /// Adds a note on at `start` and its note off `length` ticks later.
    pub fn note(mut self, start: u32, length: u32, key: u8, vel: u8) -> TrackSpec {
        self = self.push(start, SpecEvent::NoteOn(key, vel));
        self.push(start + length, SpecEvent::NoteOff(key))
    }

    /// Places the end of the track no earlier than the given tick.
    pub fn end_at(mut self, tick: u32) -> TrackSpec {
        self.end = self.end.max(tick);
        self
    }

    fn push(mut self, tick: u32, event: SpecEvent) -> TrackSpec {
        self.end = self.end.max(tick);
        self.events.push((tick, event));
        self
    }

    fn to_events(&self) -> Vec<TrackEvent<'_>> {
        let channel = u4::new(self.channel);
        let mut sorted: Vec<&(u32, SpecEvent)> = self.events.iter().collect();
        sorted.sort_by_key(|(tick, _)| *tick);

        let mut last = 0;
        let mut events: Vec<TrackEvent> = sorted
            .into_iter()
            .map(|(tick, event)| {
                let kind = match event {
                    SpecEvent::Name(name) => {
                        TrackEventKind::Meta(MetaMessage::TrackName(name.as_bytes()))
                    }
                    SpecEvent::Tempo(tempo) => {
                        TrackEventKind::Meta(MetaMessage::Tempo(u24::new(*tempo)))
                    }
                    SpecEvent::Program(program) => TrackEventKind::Midi {
                        channel,
                        message: MidiMessage::ProgramChange {
                            program: u7::new(*program),
                        },
                    },
                    SpecEvent::NoteOn(key, vel) => TrackEventKind::Midi {
                        channel,
                        message: MidiMessage::NoteOn {
                            key: u7::new(*key),
                            vel: u7::new(*vel),
                        },
                    },
                    SpecEvent::NoteOff(key) => TrackEventKind::Midi {
                        channel,
                        message: MidiMessage::NoteOff {
                            key: u7::new(*key),
                            vel: u7::new(0),
                        },
                    },
                };
                let delta = u28::new(tick - last);
                last = *tick;
                TrackEvent { delta, kind }
            })
            .collect();

        events.push(TrackEvent {
            delta: u28::new(self.end - last),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });
        events
    }
}

/// Writes a standard MIDI file with the given tracks.
pub fn midi_file(format: Format, timing: Timing, tracks: Vec<TrackSpec>) -> Vec<u8> {
    let mut smf = Smf::new(Header::new(format, timing));
    for track in tracks.iter() {
        smf.tracks.push(track.to_events());
    }

    let mut buf = Vec::new();
    smf.write_std(&mut buf)
        .expect("writing a MIDI file to memory should succeed");
    buf
}
