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

//! The built-in synthesizer. A single-cycle piano-like wavetable is generated on load and played
//! back through the default audio output with a per-voice envelope.

use std::{
    collections::VecDeque,
    error::Error,
    f64::consts::TAU,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};
use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, error, info, span, warn, Level, Span};

use crate::{error, timeline::Pitch};

use super::AudioActivation;
use super::Sampler as _;

const TABLE_SIZE: usize = 2048;
const HARMONICS: usize = 12;
const ATTACK: Duration = Duration::from_millis(5);
const SILENCE: f32 = 1e-4;
const HEADROOM: f32 = 0.25;
const GAIN_SMOOTHING: f32 = 0.002;

enum Message {
    Note {
        at: std::time::Instant,
        generation: u64,
        key: u8,
        /// None for a note-off.
        velocity: Option<f32>,
    },
    ReleaseAll,
}

/// The built-in synthesizer.
pub struct Sampler {
    sample_rate: u32,
    max_voices: usize,
    release: Duration,
    ready: AtomicBool,
    live: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    gain: Arc<AtomicU32>,
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    output_thread: Mutex<Option<thread::JoinHandle<()>>>,
    span: Span,
}

impl Sampler {
    pub fn new(sample_rate: u32, max_voices: usize, release: Duration) -> Sampler {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Sampler {
            sample_rate,
            max_voices: max_voices.max(1),
            release,
            ready: AtomicBool::new(false),
            live: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            gain: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            sender,
            receiver,
            output_thread: Mutex::new(None),
            span: span!(Level::INFO, "sampler (synth)"),
        }
    }

    fn send(&self, message: Message) {
        if self.sender.send(message).is_err() {
            warn!(parent: &self.span, "Synthesizer renderer is gone, dropping command.");
        }
    }

    fn note(&self, pitch: Pitch, at: Instant, velocity: Option<f32>) {
        if !self.is_ready() {
            return;
        }
        self.send(Message::Note {
            at: at.into_std(),
            generation: self.generation.load(Ordering::Acquire),
            key: pitch.key(),
            velocity,
        });
    }
}

impl super::Sampler for Sampler {
    fn load(&self) -> BoxFuture<'_, Result<(), error::Error>> {
        async move {
            if self.is_ready() {
                return Ok(());
            }

            let table = tokio::task::spawn_blocking(build_wavetable)
                .await
                .map_err(|e| error::Error::AudioActivation(e.to_string()))?;
            debug!(parent: &self.span, size = table.len(), "Generated wavetable.");

            let renderer = Renderer::new(
                Arc::new(table),
                self.sample_rate,
                self.max_voices,
                self.release,
                self.receiver.clone(),
                self.generation.clone(),
                self.gain.clone(),
            );
            let (started_tx, started_rx) = oneshot::channel();
            let sample_rate = self.sample_rate;
            let live = self.live.clone();
            let shutdown = self.shutdown.clone();
            let span = self.span.clone();
            let output_thread = thread::spawn(move || {
                let _enter = span.enter();
                run_output(renderer, sample_rate, live, shutdown, started_tx)
            });

            started_rx
                .await
                .map_err(|e| error::Error::AudioActivation(e.to_string()))?
                .map_err(error::Error::AudioActivation)?;

            *self.output_thread.lock() = Some(output_thread);
            self.ready.store(true, Ordering::Release);
            info!(parent: &self.span, sample_rate, "Synthesizer loaded.");
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
        let gain = if muted { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.gain.store(gain.to_bits(), Ordering::Relaxed);
    }
}

impl AudioActivation for Sampler {
    fn ensure_ready(&self) -> BoxFuture<'_, Result<(), error::Error>> {
        let result = if self.live.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(error::Error::AudioActivation(
                "audio output stream is not running".to_string(),
            ))
        };
        future::ready(result).boxed()
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(output_thread) = self.output_thread.lock().take() {
            output_thread.thread().unpark();
        }
    }
}

impl fmt::Display for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Synth, {} Hz, {} voices)",
            super::SYNTH_DEVICE,
            self.sample_rate,
            self.max_voices
        )
    }
}

/// Owns the output stream for its whole life. cpal streams are not Send, so the stream never
/// leaves this thread.
fn run_output(
    renderer: Renderer,
    sample_rate: u32,
    live: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    started: oneshot::Sender<Result<(), String>>,
) {
    let stream = match open_stream(renderer, sample_rate, live.clone()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(err = e.to_string(), "Failed to create output stream");
            let _ = started.send(Err(e.to_string()));
            return;
        }
    };
    if let Err(e) = stream.play() {
        error!(err = e.to_string(), "Failed to start output stream");
        let _ = started.send(Err(e.to_string()));
        return;
    }

    live.store(true, Ordering::Release);
    let _ = started.send(Ok(()));
    info!("Output stream started.");

    while !shutdown.load(Ordering::Acquire) {
        thread::park_timeout(Duration::from_millis(100));
    }
    live.store(false, Ordering::Release);
    info!("Output stream stopped.");
}

fn open_stream(
    renderer: Renderer,
    sample_rate: u32,
    live: Arc<AtomicBool>,
) -> Result<cpal::Stream, Box<dyn Error>> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or("no default audio output device")?;
    let supported = device.default_output_config()?;
    let config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };
    let description = device.description()?;
    debug!(
        device = description.name(),
        channels = config.channels,
        sample_rate,
        "Opening output stream."
    );

    let on_error = move |err: cpal::StreamError| {
        error!(err = err.to_string(), "Output stream error");
        live.store(false, Ordering::Release);
    };

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32, _>(&device, &config, renderer, on_error)?,
        cpal::SampleFormat::I16 => build_stream::<i16, _>(&device, &config, renderer, on_error)?,
        cpal::SampleFormat::I32 => build_stream::<i32, _>(&device, &config, renderer, on_error)?,
        cpal::SampleFormat::U16 => build_stream::<u16, _>(&device, &config, renderer, on_error)?,
        format => return Err(format!("unsupported sample format {}", format).into()),
    };
    Ok(stream)
}

fn build_stream<T, E>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut renderer: Renderer,
    on_error: E,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
    E: FnMut(cpal::StreamError) + Send + 'static,
{
    let channels = usize::from(config.channels);
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            renderer.render(std::time::Instant::now(), data, channels);
        },
        on_error,
        None,
    )
}

/// Builds a single cycle with a decaying harmonic series, normalized to a peak of 1.
fn build_wavetable() -> Vec<f32> {
    let mut table: Vec<f32> = (0..TABLE_SIZE)
        .map(|i| {
            let phase = i as f64 / TABLE_SIZE as f64 * TAU;
            (1..=HARMONICS)
                .map(|h| (phase * h as f64).sin() / (h as f64).powf(1.5))
                .sum::<f64>() as f32
        })
        .collect();

    let peak = table.iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
    if peak > 0.0 {
        table.iter_mut().for_each(|s| *s /= peak);
    }
    table
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    Attack,
    Decay,
    Release,
}

struct Voice {
    key: u8,
    started: u64,
    phase: f64,
    increment: f64,
    amplitude: f32,
    level: f32,
    stage: Stage,
    attack_step: f32,
    decay: f32,
    release: f32,
}

impl Voice {
    fn new(key: u8, velocity: f32, started: u64, sample_rate: f64, release: f32) -> Voice {
        // Lower notes ring longer.
        let sustain_seconds = 4.0 - 3.0 * (f64::from(key.saturating_sub(21)) / 87.0).min(1.0);
        Voice {
            key,
            started,
            phase: 0.0,
            increment: Pitch::new(key).frequency() * TABLE_SIZE as f64 / sample_rate,
            amplitude: velocity.clamp(0.0, 1.0).powf(1.5),
            level: 0.0,
            stage: Stage::Attack,
            attack_step: (1.0 / (ATTACK.as_secs_f64() * sample_rate)) as f32,
            decay: (-1.0 / (sustain_seconds * sample_rate)).exp() as f32,
            release,
        }
    }

    fn next(&mut self, table: &[f32]) -> f32 {
        let index = self.phase as usize;
        let fraction = (self.phase - index as f64) as f32;
        let a = table[index % TABLE_SIZE];
        let b = table[(index + 1) % TABLE_SIZE];
        let sample = a + (b - a) * fraction;
        self.phase = (self.phase + self.increment) % TABLE_SIZE as f64;

        match self.stage {
            Stage::Attack => {
                self.level += self.attack_step;
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.stage = Stage::Decay;
                }
            }
            Stage::Decay => self.level *= self.decay,
            Stage::Release => self.level *= self.release,
        }

        sample * self.level * self.amplitude
    }

    fn release(&mut self) {
        self.stage = Stage::Release;
    }

    fn is_releasing(&self) -> bool {
        self.stage == Stage::Release
    }

    fn is_finished(&self) -> bool {
        self.stage != Stage::Attack && self.level < SILENCE
    }
}

struct Pending {
    frame: u64,
    generation: u64,
    key: u8,
    velocity: Option<f32>,
}

/// Renders voices into the output buffer. Lives on the audio callback.
struct Renderer {
    table: Arc<Vec<f32>>,
    sample_rate: f64,
    max_voices: usize,
    release: f32,
    receiver: Receiver<Message>,
    generation: Arc<AtomicU64>,
    gain: Arc<AtomicU32>,
    current_gain: f32,
    voices: Vec<Voice>,
    pending: VecDeque<Pending>,
    epoch: Option<std::time::Instant>,
    frame: u64,
}

impl Renderer {
    fn new(
        table: Arc<Vec<f32>>,
        sample_rate: u32,
        max_voices: usize,
        release: Duration,
        receiver: Receiver<Message>,
        generation: Arc<AtomicU64>,
        gain: Arc<AtomicU32>,
    ) -> Renderer {
        let sample_rate = f64::from(sample_rate);
        let release_frames = release.as_secs_f64() * sample_rate;
        let release = if release_frames < 1.0 {
            0.0
        } else {
            (f64::from(SILENCE).ln() / release_frames).exp() as f32
        };
        Renderer {
            table,
            sample_rate,
            max_voices,
            release,
            receiver,
            generation,
            current_gain: f32::from_bits(gain.load(Ordering::Relaxed)),
            gain,
            voices: Vec::with_capacity(max_voices),
            pending: VecDeque::with_capacity(1024),
            epoch: None,
            frame: 0,
        }
    }

    fn frame_at(&self, epoch: std::time::Instant, at: std::time::Instant) -> u64 {
        (at.saturating_duration_since(epoch).as_secs_f64() * self.sample_rate) as u64
    }

    fn receive(&mut self, epoch: std::time::Instant) {
        let mut received = false;
        while let Ok(message) = self.receiver.try_recv() {
            match message {
                Message::Note {
                    at,
                    generation,
                    key,
                    velocity,
                } => {
                    let frame = self.frame_at(epoch, at);
                    self.pending.push_back(Pending {
                        frame,
                        generation,
                        key,
                        velocity,
                    });
                    received = true;
                }
                Message::ReleaseAll => self.voices.iter_mut().for_each(Voice::release),
            }
        }

        let generation = self.generation.load(Ordering::Acquire);
        self.pending.retain(|pending| pending.generation == generation);
        if received {
            self.pending.make_contiguous().sort_by_key(|pending| pending.frame);
        }
    }

    fn start(&mut self, key: u8, velocity: f32, frame: u64) {
        if self.voices.len() >= self.max_voices {
            if let Some((oldest, _)) = self
                .voices
                .iter()
                .enumerate()
                .min_by_key(|(_, voice)| voice.started)
            {
                self.voices.swap_remove(oldest);
            }
        }
        self.voices
            .push(Voice::new(key, velocity, frame, self.sample_rate, self.release));
    }

    fn stop(&mut self, key: u8) {
        if let Some(voice) = self
            .voices
            .iter_mut()
            .filter(|voice| voice.key == key && !voice.is_releasing())
            .min_by_key(|voice| voice.started)
        {
            voice.release();
        }
    }

    fn fire_due(&mut self, frame: u64) {
        while self.pending.front().is_some_and(|pending| pending.frame <= frame) {
            if let Some(pending) = self.pending.pop_front() {
                match pending.velocity {
                    Some(velocity) => self.start(pending.key, velocity, frame),
                    None => self.stop(pending.key),
                }
            }
        }
    }

    fn render<T>(&mut self, now: std::time::Instant, data: &mut [T], channels: usize)
    where
        T: cpal::Sample + cpal::FromSample<f32>,
    {
        let channels = channels.max(1);
        let epoch = *self.epoch.get_or_insert(now);
        self.receive(epoch);

        let target_gain = f32::from_bits(self.gain.load(Ordering::Relaxed));
        let mut frames = 0;
        for out in data.chunks_mut(channels) {
            let frame = self.frame + frames;
            self.fire_due(frame);

            let table = &self.table;
            let sample: f32 = self.voices.iter_mut().map(|voice| voice.next(table)).sum();
            self.current_gain += (target_gain - self.current_gain) * GAIN_SMOOTHING;

            let value = (sample * self.current_gain * HEADROOM).clamp(-1.0, 1.0);
            out.iter_mut().for_each(|s| *s = T::from_sample(value));
            frames += 1;
        }

        self.voices.retain(|voice| !voice.is_finished());
        self.frame += frames;
    }
}
