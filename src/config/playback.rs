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
use crate::{player, transport};

const DEFAULT_VOLUME: f32 = 0.8;
const DEFAULT_END_EPSILON: f64 = 0.1;
const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(16);
const DEFAULT_DISPATCH_INTERVAL: Duration = Duration::from_millis(25);
const DEFAULT_LOOKAHEAD: Duration = Duration::from_millis(100);

/// A YAML representation of the playback configuration.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Playback {
    /// Whether another resource starts automatically when a track ends (default: true)
    autoplay_next: Option<bool>,

    /// Whether tracks loop (default: false)
    looping: Option<bool>,

    /// The initial output volume between 0 and 1 (default: 0.8)
    volume: Option<f32>,

    /// How close to the end, in seconds, counts as the end of a track (default: 0.1)
    end_epsilon: Option<f64>,

    /// How often the published position is refreshed (default: 16ms)
    progress_interval: Option<String>,

    /// How often due notes are handed to the sampler (default: 25ms)
    dispatch_interval: Option<String>,

    /// How far ahead of the playhead notes are handed to the sampler (default: 100ms)
    lookahead: Option<String>,
}

impl Playback {
    pub fn autoplay_next(&self) -> bool {
        self.autoplay_next.unwrap_or(true)
    }

    pub fn looping(&self) -> bool {
        self.looping.unwrap_or(false)
    }

    /// Returns the initial volume, clamped to [0, 1].
    pub fn volume(&self) -> f32 {
        self.volume.unwrap_or(DEFAULT_VOLUME).clamp(0.0, 1.0)
    }

    pub fn end_epsilon(&self) -> f64 {
        self.end_epsilon.unwrap_or(DEFAULT_END_EPSILON).max(0.0)
    }

    /// Converts the configuration into player settings.
    pub fn settings(&self) -> Result<player::Settings, ConfigError> {
        Ok(player::Settings {
            autoplay_next: self.autoplay_next(),
            looping: self.looping(),
            volume: self.volume(),
            end_epsilon: self.end_epsilon(),
            progress_interval: super::parse_period(
                "playback.progress_interval",
                &self.progress_interval,
                DEFAULT_PROGRESS_INTERVAL,
            )?,
            transport: transport::Settings {
                dispatch_interval: super::parse_period(
                    "playback.dispatch_interval",
                    &self.dispatch_interval,
                    DEFAULT_DISPATCH_INTERVAL,
                )?,
                lookahead: super::parse_duration(
                    "playback.lookahead",
                    &self.lookahead,
                    DEFAULT_LOOKAHEAD,
                )?,
            },
        })
    }
}
