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
use serde::Deserialize;

use super::playback::Playback;
use super::sampler::Sampler;

const DEFAULT_LIBRARY: &str = "midi";

/// The order in which the catalog picks the next resource.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutoplayOrder {
    /// Any resource other than the current one.
    #[default]
    Random,
    /// The resource after the current one in id order, wrapping around.
    Sequential,
}

/// The configuration for the player.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Player {
    /// The path to the MIDI library. Relative paths are resolved against the config file.
    /// (default: midi)
    library: Option<String>,
    /// How the next resource is chosen during autoplay.
    #[serde(default)]
    autoplay_order: AutoplayOrder,
    /// The sampler configuration.
    #[serde(default)]
    sampler: Sampler,
    /// The playback configuration.
    #[serde(default)]
    playback: Playback,
}

impl Player {
    pub fn library(&self) -> &str {
        self.library.as_deref().unwrap_or(DEFAULT_LIBRARY)
    }

    pub fn autoplay_order(&self) -> AutoplayOrder {
        self.autoplay_order
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn playback(&self) -> &Playback {
        &self.playback
    }
}
