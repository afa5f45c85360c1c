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
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use config::{Config, Environment, File};
use duration_string::DurationString;
use tracing::info;

use crate::library::Library;
use crate::loader::Loader;

mod error;
mod playback;
mod player;
mod sampler;

pub use self::error::ConfigError;
pub use self::playback::Playback;
pub use self::player::{AutoplayOrder, Player};
pub use self::sampler::Sampler;

/// The prefix for environment variables that override the config file, e.g.
/// `MPLAY_PLAYBACK__VOLUME=0.5`.
const ENV_PREFIX: &str = "MPLAY";

/// Loads the player configuration from the given YAML file, applying environment overrides.
pub fn load(path: &Path) -> Result<Player, ConfigError> {
    Ok(Config::builder()
        .add_source(File::from(path))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?)
}

/// Parses an optional duration string, falling back to the given default.
fn parse_duration(
    field: &'static str,
    value: &Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(value) => Ok(DurationString::from_string(value.clone())
            .map_err(|e| ConfigError::Duration {
                field,
                reason: e.to_string(),
            })?
            .into()),
        None => Ok(default),
    }
}

/// Parses a period that drives a repeating timer, which must be non-zero.
fn parse_period(
    field: &'static str,
    value: &Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let period = parse_duration(field, value, default)?;
    if period.is_zero() {
        return Err(ConfigError::Duration {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(period)
}

/// Resolves the library path. Relative paths are taken relative to the config file.
fn library_path(config_path: &Path, library: &str) -> PathBuf {
    let library = PathBuf::from(library);
    if library.is_absolute() {
        return library;
    }
    config_path
        .parent()
        .map(|parent| parent.join(&library))
        .unwrap_or(library)
}

/// Initializes the player from the given config file. The sampler still needs to be loaded
/// before anything can play.
pub fn init_player(path: &Path) -> Result<crate::player::Player, Box<dyn Error>> {
    let config = load(path)?;
    let library = Arc::new(Library::scan(
        &library_path(path, config.library()),
        config.autoplay_order(),
    )?);
    info!(library = %library, "Library scanned.");

    let (sampler, activation) = crate::sampler::get_sampler(config.sampler())?;
    Ok(crate::player::Player::new(
        config.playback().settings()?,
        Loader::new(library.clone()),
        library,
        sampler,
        activation,
    ))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use config::{Config, File, FileFormat};

    use super::*;

    fn parse(yaml: &str) -> Player {
        Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .expect("build failed")
            .try_deserialize()
            .expect("deserialize failed")
    }

    #[test]
    fn defaults() {
        let config = parse("library: midi\n");
        assert_eq!("midi", config.library());
        assert_eq!(AutoplayOrder::Random, config.autoplay_order());
        assert_eq!("synth", config.sampler().device());
        assert_eq!(44100, config.sampler().sample_rate());
        assert_eq!(64, config.sampler().max_voices());
        assert_eq!(
            Duration::from_millis(250),
            config.sampler().release().expect("release")
        );

        let settings = config.playback().settings().expect("settings");
        assert!(settings.autoplay_next);
        assert!(!settings.looping);
        assert_eq!(0.8, settings.volume);
        assert_eq!(0.1, settings.end_epsilon);
        assert_eq!(Duration::from_millis(16), settings.progress_interval);
        assert_eq!(Duration::from_millis(25), settings.transport.dispatch_interval);
        assert_eq!(Duration::from_millis(100), settings.transport.lookahead);
    }

    #[test]
    fn full_config() {
        let config = parse(
            r#"
            library: /srv/midi
            autoplay_order: sequential
            sampler:
              device: mock-piano
              sample_rate: 48000
              max_voices: 0
              release: 1s
            playback:
              autoplay_next: false
              looping: true
              volume: 1.5
              end_epsilon: 0.25
              progress_interval: 50ms
              dispatch_interval: 10ms
              lookahead: 200ms
            "#,
        );
        assert_eq!(AutoplayOrder::Sequential, config.autoplay_order());
        assert_eq!("mock-piano", config.sampler().device());
        assert_eq!(48000, config.sampler().sample_rate());
        assert_eq!(1, config.sampler().max_voices());
        assert_eq!(
            Duration::from_secs(1),
            config.sampler().release().expect("release")
        );

        let settings = config.playback().settings().expect("settings");
        assert!(!settings.autoplay_next);
        assert!(settings.looping);
        assert_eq!(1.0, settings.volume);
        assert_eq!(0.25, settings.end_epsilon);
        assert_eq!(Duration::from_millis(50), settings.progress_interval);
        assert_eq!(Duration::from_millis(10), settings.transport.dispatch_interval);
        assert_eq!(Duration::from_millis(200), settings.transport.lookahead);
    }

    #[test]
    fn invalid_duration() {
        let config = parse("library: midi\nplayback:\n  lookahead: soon\n");
        match config.playback().settings() {
            Err(ConfigError::Duration { field, .. }) => assert_eq!("playback.lookahead", field),
            _ => panic!("expected a duration error"),
        }
    }

    #[test]
    fn zero_periods() {
        let config = parse("playback:\n  progress_interval: 0ms\n");
        match config.playback().settings() {
            Err(ConfigError::Duration { field, .. }) => {
                assert_eq!("playback.progress_interval", field)
            }
            _ => panic!("expected a duration error"),
        }

        let config = parse("playback:\n  dispatch_interval: 0s\n");
        match config.playback().settings() {
            Err(ConfigError::Duration { field, .. }) => {
                assert_eq!("playback.dispatch_interval", field)
            }
            _ => panic!("expected a duration error"),
        }

        // A zero lookahead only dispatches what is already due.
        let config = parse("playback:\n  lookahead: 0ms\n");
        let settings = config.playback().settings().expect("settings");
        assert_eq!(Duration::ZERO, settings.transport.lookahead);
    }

    #[test]
    fn empty_config() {
        let config = parse("{}");
        assert_eq!("midi", config.library());
        assert_eq!("synth", config.sampler().device());
        assert!(config.playback().autoplay_next());
    }

    #[test]
    fn relative_library_path() {
        assert_eq!(
            PathBuf::from("/etc/mplay/midi"),
            library_path(Path::new("/etc/mplay/mplay.yaml"), "midi")
        );
        assert_eq!(
            PathBuf::from("/srv/midi"),
            library_path(Path::new("/etc/mplay/mplay.yaml"), "/srv/midi")
        );
    }

    #[test]
    fn load_from_file() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mplay.yaml");
        std::fs::write(&path, "library: midi\nautoplay_order: sequential\n")?;

        let config = load(&path)?;
        assert_eq!("midi", config.library());
        assert_eq!(AutoplayOrder::Sequential, config.autoplay_order());

        assert!(load(&dir.path().join("missing.yaml")).is_err());
        Ok(())
    }
}
