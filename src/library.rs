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

//! The external collaborators the player draws resources from, and a directory-backed library
//! that provides both of them.

use std::{
    collections::BTreeMap,
    error::Error,
    fmt, io,
    path::{Path, PathBuf},
};

use futures_util::future::{self, BoxFuture, FutureExt};
use rand::seq::SliceRandom;
use tracing::{debug, info, span, Level, Span};

use crate::{config::AutoplayOrder, error};

mod memory;

pub use memory::MemoryLibrary;

/// The file extensions recognized as MIDI files.
const MIDI_EXTENSIONS: &[&str] = &["mid", "midi"];

/// Fetches the raw bytes of a resource by its opaque id.
pub trait Fetch: Send + Sync {
    /// Fetches the resource. Fails with `NotFound` if it doesn't exist and `Network` if it
    /// couldn't be transferred.
    fn fetch<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Vec<u8>, error::Error>>;
}

/// Supplies the resource to play after the current one.
pub trait Catalog: Send + Sync {
    /// Returns the id of another resource, never the excluded one, or None if there is nothing
    /// else to play.
    fn next<'a>(&'a self, exclude: Option<&'a str>) -> BoxFuture<'a, Option<String>>;
}

/// Picks the next id from a sorted list of ids.
pub(crate) fn pick_next<'a, I>(
    mut ids: I,
    exclude: Option<&str>,
    order: AutoplayOrder,
) -> Option<String>
where
    I: Iterator<Item = &'a String>,
{
    match order {
        AutoplayOrder::Random => {
            let candidates: Vec<&String> = ids
                .filter(|id| Some(id.as_str()) != exclude)
                .collect();
            candidates
                .choose(&mut rand::thread_rng())
                .map(|id| id.to_string())
        }
        AutoplayOrder::Sequential => match exclude {
            Some(exclude) => ids
                .find(|id| id.as_str() > exclude)
                .map(|id| id.to_string()),
            None => ids.next().map(|id| id.to_string()),
        },
    }
}

/// A directory of MIDI files. Ids are paths relative to the root without the extension, using
/// `/` as the separator.
pub struct Library {
    /// The library root.
    root: PathBuf,
    /// Resource paths by id.
    entries: BTreeMap<String, PathBuf>,
    /// How the next resource is chosen.
    order: AutoplayOrder,
    /// The logging span.
    span: Span,
}

impl Library {
    /// Recurses into the given path and records every MIDI file found.
    pub fn scan(root: &Path, order: AutoplayOrder) -> Result<Library, Box<dyn Error>> {
        let span = span!(Level::INFO, "library");

        let mut entries = BTreeMap::new();
        Library::collect(root, root, &mut entries)?;
        info!(
            parent: &span,
            root = root.display().to_string(),
            resources = entries.len(),
            "Scanned library."
        );

        Ok(Library {
            root: root.to_path_buf(),
            entries,
            order,
            span,
        })
    }

    fn collect(root: &Path, dir: &Path, entries: &mut BTreeMap<String, PathBuf>) -> io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Library::collect(root, &path, entries)?;
                continue;
            }

            let is_midi = path
                .extension()
                .and_then(|extension| extension.to_str())
                .is_some_and(|extension| {
                    MIDI_EXTENSIONS.contains(&extension.to_lowercase().as_str())
                });
            if !is_midi {
                debug!(path = path.display().to_string(), "Ignoring non-MIDI file.");
                continue;
            }

            let relative = path.strip_prefix(root).unwrap_or(&path).with_extension("");
            let id = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            entries.insert(id, path);
        }
        Ok(())
    }

    /// Gets the library root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Gets the ids of every resource in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Gets the path of the resource with the given id.
    pub fn path(&self, id: &str) -> Option<&Path> {
        self.entries.get(id).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Library {} ({} resources)",
            self.root.display(),
            self.entries.len()
        )
    }
}

impl Fetch for Library {
    fn fetch<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Vec<u8>, error::Error>> {
        async move {
            let path = self
                .entries
                .get(id)
                .ok_or_else(|| error::Error::NotFound(id.to_string()))?;

            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    debug!(parent: &self.span, id, bytes = bytes.len(), "Fetched resource.");
                    Ok(bytes)
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Err(error::Error::NotFound(id.to_string()))
                }
                Err(e) => Err(error::Error::Network {
                    id: id.to_string(),
                    reason: e.to_string(),
                }),
            }
        }
        .boxed()
    }
}

impl Catalog for Library {
    fn next<'a>(&'a self, exclude: Option<&'a str>) -> BoxFuture<'a, Option<String>> {
        let next = pick_next(self.entries.keys(), exclude, self.order);
        debug!(parent: &self.span, exclude = ?exclude, next = ?next, "Picked next resource.");
        future::ready(next).boxed()
    }
}
