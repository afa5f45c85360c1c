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

/// Errors surfaced by the playback engine. Loader and sampler failures are
/// recorded by the player as the last error and move it into the error state.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("resource {0} not found")]
    NotFound(String),

    #[error("unable to fetch resource {id}: {reason}")]
    Network { id: String, reason: String },

    #[error("invalid MIDI data: {0}")]
    Parse(String),

    #[error("sampler is not ready")]
    SamplerNotReady,

    #[error("unable to activate audio output: {0}")]
    AudioActivation(String),
}

impl From<midly::Error> for Error {
    fn from(err: midly::Error) -> Self {
        Error::Parse(err.to_string())
    }
}
