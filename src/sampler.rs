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

//! The shared polyphonic instrument that renders timestamped note commands.
//!
//! A sampler is created once per session and reused across every track. Commands carry the
//! instant at which they must sound; cancelling drops every command that has not sounded yet.

use std::{error::Error, fmt, sync::Arc};

use cpal::traits::{DeviceTrait, HostTrait};
use futures_util::future::{self, BoxFuture, FutureExt};
use tokio::time::Instant;

use crate::{config, error, timeline::Pitch};

mod midi;
mod mock;
mod synth;

/// The name of the built-in synthesizer device.
pub const SYNTH_DEVICE: &str = "synth";

/// A polyphonic instrument driven by timestamped note commands.
pub trait Sampler: fmt::Display + Send + Sync {
    /// Loads the sound data for the sampler. Commands are only honored once loading completes.
    fn load(&self) -> BoxFuture<'_, Result<(), error::Error>>;

    /// Returns true once the sampler has loaded its sound data.
    fn is_ready(&self) -> bool;

    /// Starts the given pitch at the given instant.
    fn note_on(&self, pitch: Pitch, at: Instant, velocity: f32);

    /// Stops the given pitch at the given instant.
    fn note_off(&self, pitch: Pitch, at: Instant);

    /// Drops every command that has not sounded yet.
    fn cancel_scheduled(&self);

    /// Silences every sounding voice immediately.
    fn release_all(&self);

    /// Sets the shared output stage. Applies to sounding voices immediately.
    fn set_output(&self, volume: f32, muted: bool);
}

/// The platform step that permits sound output. Hosts without such a restriction use
/// `AlwaysReady`.
pub trait AudioActivation: Send + Sync {
    /// Resolves once sound may be produced.
    fn ensure_ready(&self) -> BoxFuture<'_, Result<(), error::Error>>;
}

/// An activation that never blocks sound output.
pub struct AlwaysReady;

impl AudioActivation for AlwaysReady {
    fn ensure_ready(&self) -> BoxFuture<'_, Result<(), error::Error>> {
        future::ready(Ok(())).boxed()
    }
}

/// Gets the sampler for the given configuration along with the activation step it requires.
pub fn get_sampler(
    config: &config::Sampler,
) -> Result<(Arc<dyn Sampler>, Arc<dyn AudioActivation>), Box<dyn Error>> {
    let device = config.device();
    if device.starts_with("mock") {
        return Ok((Arc::new(mock::Sampler::get(device)), Arc::new(AlwaysReady)));
    }

    if device == SYNTH_DEVICE {
        let synth = Arc::new(synth::Sampler::new(
            config.sample_rate(),
            config.max_voices(),
            config.release()?,
        ));
        return Ok((synth.clone(), synth));
    }

    Ok((Arc::new(midi::Sampler::new(device)), Arc::new(AlwaysReady)))
}

/// Lists the audio output devices the synthesizer could render through, followed by the MIDI
/// output ports that can be used as external instruments.
pub fn list_devices() -> Result<Vec<String>, Box<dyn Error>> {
    // Suppress noisy output here.
    let _shh_stdout = shh::stdout()?;
    let _shh_stderr = shh::stderr()?;

    let mut devices = Vec::new();
    for host_id in cpal::available_hosts() {
        let host = cpal::host_from_id(host_id)?;
        let Ok(outputs) = host.output_devices() else {
            continue;
        };
        for device in outputs {
            if let Ok(description) = device.description() {
                devices.push(format!(
                    "{} (audio, {})",
                    description.name(),
                    host_id.name()
                ));
            }
        }
    }

    for port in midi::list_ports()? {
        devices.push(format!("{} (MIDI)", port));
    }
    Ok(devices)
}
