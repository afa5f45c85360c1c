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
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use midly::{Format, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use tracing::{debug, info, span, Level, Span};

use crate::{
    error::Error,
    library::Fetch,
    timeline::{NoteEvent, ParsedTimeline, Pitch, Track},
};

/// The tempo assumed until a file sets one, in microseconds per quarter note (120 BPM).
const DEFAULT_TEMPO: u32 = 500_000;

/// Fetches MIDI resources and parses them into timelines.
pub struct Loader {
    /// Where resource bytes come from.
    fetcher: Arc<dyn Fetch>,
    /// The logging span.
    span: Span,
}

impl Loader {
    /// Creates a new loader backed by the given fetcher.
    pub fn new(fetcher: Arc<dyn Fetch>) -> Loader {
        Loader {
            fetcher,
            span: span!(Level::INFO, "loader"),
        }
    }

    /// Loads the resource with the given id. Either the whole timeline is returned or an error,
    /// never a partially parsed timeline.
    pub async fn load(&self, id: &str) -> Result<ParsedTimeline, Error> {
        let bytes = self.fetcher.fetch(id).await?;
        let timeline = parse(&bytes)?;

        let _enter = self.span.enter();
        info!(
            id,
            tracks = timeline.tracks().len(),
            notes = timeline.note_count(),
            duration = timeline.duration_string(),
            "Loaded MIDI resource."
        );
        Ok(timeline)
    }
}

/// Parses a standard MIDI file into a timeline.
pub fn parse(bytes: &[u8]) -> Result<ParsedTimeline, Error> {
    let smf = Smf::parse(bytes)?;

    let mut tracks = Vec::new();
    match smf.header.format {
        Format::SingleTrack | Format::Parallel => {
            let time_base = TimeBase::new(smf.header.timing, smf.tracks.iter())?;
            for events in smf.tracks.iter() {
                let (track, _) = collect_track(events, 0.0, &time_base);
                tracks.extend(track);
            }
        }
        Format::Sequential => {
            // Each track starts when the previous one ends and carries its own tempo map.
            let mut offset = 0.0;
            for events in smf.tracks.iter() {
                let time_base = TimeBase::new(smf.header.timing, std::iter::once(events))?;
                let (track, end) = collect_track(events, offset, &time_base);
                tracks.extend(track);
                offset = end;
            }
        }
    }

    debug!(
        format = format!("{:?}", smf.header.format),
        tracks = tracks.len(),
        "Parsed MIDI file."
    );
    Ok(ParsedTimeline::new(tracks))
}

/// A tempo segment that starts at the given tick.
struct Segment {
    tick: u64,
    seconds: f64,
    seconds_per_tick: f64,
}

/// Converts absolute ticks into seconds.
enum TimeBase {
    /// Tempo-relative timing. Segments are sorted by tick and the first starts at tick 0.
    Metrical(Vec<Segment>),
    /// Absolute SMPTE timing.
    Timecode(f64),
}

impl TimeBase {
    /// Builds the time base for the given timing, reading tempo changes from every given track.
    fn new<'a, 'b: 'a>(
        timing: Timing,
        tracks: impl Iterator<Item = &'a Vec<TrackEvent<'b>>>,
    ) -> Result<TimeBase, Error> {
        let ticks_per_quarter = match timing {
            Timing::Metrical(ticks) if ticks.as_int() == 0 => {
                return Err(Error::Parse("zero ticks per quarter note".to_string()))
            }
            Timing::Metrical(ticks) => f64::from(ticks.as_int()),
            Timing::Timecode(fps, ticks_per_frame) => {
                if ticks_per_frame == 0 {
                    return Err(Error::Parse("zero ticks per frame".to_string()));
                }
                return Ok(TimeBase::Timecode(
                    1.0 / (f64::from(fps.as_f32()) * f64::from(ticks_per_frame)),
                ));
            }
        };

        let mut changes: Vec<(u64, u32)> = Vec::new();
        for events in tracks {
            let mut tick = 0u64;
            for event in events.iter() {
                tick += u64::from(event.delta.as_int());
                if let TrackEventKind::Meta(MetaMessage::Tempo(tempo)) = event.kind {
                    if tempo.as_int() == 0 {
                        return Err(Error::Parse(format!("zero tempo at tick {}", tick)));
                    }
                    changes.push((tick, tempo.as_int()));
                }
            }
        }
        // Stable sort keeps the file order for changes on the same tick, so the last one wins.
        changes.sort_by_key(|(tick, _)| *tick);

        let seconds_per_tick =
            |tempo: u32| f64::from(tempo) / 1_000_000.0 / ticks_per_quarter;
        let mut segments = Vec::with_capacity(changes.len() + 1);
        let mut current = Segment {
            tick: 0,
            seconds: 0.0,
            seconds_per_tick: seconds_per_tick(DEFAULT_TEMPO),
        };
        for (tick, tempo) in changes {
            let seconds =
                current.seconds + (tick - current.tick) as f64 * current.seconds_per_tick;
            let next = Segment {
                tick,
                seconds,
                seconds_per_tick: seconds_per_tick(tempo),
            };
            if current.tick != tick {
                segments.push(current);
            }
            current = next;
        }
        segments.push(current);

        Ok(TimeBase::Metrical(segments))
    }

    /// Converts an absolute tick to seconds.
    fn seconds(&self, tick: u64) -> f64 {
        match self {
            TimeBase::Timecode(seconds_per_tick) => tick as f64 * seconds_per_tick,
            TimeBase::Metrical(segments) => {
                let index = segments.partition_point(|segment| segment.tick <= tick);
                let segment = &segments[index.saturating_sub(1)];
                segment.seconds + (tick - segment.tick) as f64 * segment.seconds_per_tick
            }
        }
    }
}

/// Collects the notes of a track. Returns the track, if it has any notes, and the time at which
/// the track ends.
fn collect_track(events: &[TrackEvent], offset: f64, time_base: &TimeBase) -> (Option<Track>, f64) {
    let mut tick = 0u64;
    let mut name: Option<String> = None;
    let mut channel: Option<u8> = None;
    let mut programs: BTreeMap<u8, u8> = BTreeMap::new();
    let mut sounding: BTreeMap<(u8, u8), VecDeque<(f64, f32)>> = BTreeMap::new();
    let mut notes: Vec<NoteEvent> = Vec::new();

    for event in events.iter() {
        tick += u64::from(event.delta.as_int());
        let time = offset + time_base.seconds(tick);

        match event.kind {
            TrackEventKind::Midi {
                channel: midi_channel,
                message,
            } => {
                let midi_channel = midi_channel.as_int();
                match message {
                    MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                        channel.get_or_insert(midi_channel);
                        sounding
                            .entry((midi_channel, key.as_int()))
                            .or_default()
                            .push_back((time, f32::from(vel.as_int()) / 127.0));
                    }
                    // Note on with a velocity of 0 is a note off.
                    MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                        if let Some((start, velocity)) = sounding
                            .get_mut(&(midi_channel, key.as_int()))
                            .and_then(|starts| starts.pop_front())
                        {
                            notes.push(NoteEvent::new(
                                Pitch::new(key.as_int()),
                                start,
                                time - start,
                                velocity,
                            ));
                        }
                    }
                    MidiMessage::ProgramChange { program } => {
                        programs.entry(midi_channel).or_insert(program.as_int());
                    }
                    _ => {}
                }
            }
            TrackEventKind::Meta(MetaMessage::TrackName(raw_name)) if name.is_none() => {
                let track_name = String::from_utf8_lossy(raw_name).trim().to_string();
                if !track_name.is_empty() {
                    name = Some(track_name);
                }
            }
            _ => {}
        }
    }

    let end = offset + time_base.seconds(tick);
    for ((_, key), starts) in sounding {
        for (start, velocity) in starts {
            notes.push(NoteEvent::new(
                Pitch::new(key),
                start,
                end - start,
                velocity,
            ));
        }
    }

    let track = channel.filter(|_| !notes.is_empty()).map(|channel| {
        Track::new(name, channel, programs.get(&channel).copied(), notes)
    });
    (track, end)
}
