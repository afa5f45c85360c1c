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
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

const DEFAULT_DEVICE: &str = crate::sampler::SYNTH_DEVICE;
const DEFAULT_SAMPLE_RATE: u32 = 44100;
const DEFAULT_MAX_VOICES: usize = 64;
const DEFAULT_RELEASE: Duration = Duration::from_millis(250);

/// A YAML representation of the sampler configuration.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Sampler {
    /// The instrument: "synth" for the built-in synthesizer, a name starting with "mock" for the
    /// mock sampler, or the name of a MIDI output port.
    device: Option<String>,

    /// Output sample rate in Hz for the synthesizer (default: 44100)
    sample_rate: Option<u32>,

    /// Maximum simultaneous voices before the oldest is stolen (default: 64)
    max_voices: Option<usize>,

    /// How long a released voice takes to fade out (default: 250ms)
    release: Option<String>,
}

impl Sampler {
    /// New will create a new sampler configuration for the given device.
    pub fn new(device: &str) -> Sampler {
        Sampler {
            device: Some(device.to_string()),
            ..Default::default()
        }
    }

    /// Returns the device from the configuration.
    pub fn device(&self) -> &str {
        self.device.as_deref().unwrap_or(DEFAULT_DEVICE)
    }

    /// Returns the sample rate (default: 44100)
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    /// Returns the voice limit (default: 64). Never less than 1.
    pub fn max_voices(&self) -> usize {
        self.max_voices.unwrap_or(DEFAULT_MAX_VOICES).max(1)
    }

    /// Returns the release time.
    pub fn release(&self) -> Result<Duration, ConfigError> {
        super::parse_duration("sampler.release", &self.release, DEFAULT_RELEASE)
    }
}
