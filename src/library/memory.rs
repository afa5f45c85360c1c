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
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::RwLock;

use crate::{config::AutoplayOrder, error::Error};

use super::{pick_next, Catalog, Fetch};

/// An in-memory library. Resources can be given an artificial fetch latency or a forced failure,
/// which makes it useful for exercising the player without a filesystem.
#[derive(Default)]
pub struct MemoryLibrary {
    /// Resource bytes by id.
    resources: RwLock<BTreeMap<String, Vec<u8>>>,
    /// Artificial latency per id.
    delays: RwLock<HashMap<String, Duration>>,
    /// Forced fetch failures per id.
    failures: RwLock<HashMap<String, Error>>,
    /// How the next resource is chosen.
    order: AutoplayOrder,
    /// The number of fetches started.
    fetches: AtomicUsize,
}

impl MemoryLibrary {
    /// Creates an empty library that picks the next resource in sorted order.
    pub fn new() -> MemoryLibrary {
        MemoryLibrary::with_order(AutoplayOrder::Sequential)
    }

    /// Creates an empty library with the given order.
    pub fn with_order(order: AutoplayOrder) -> MemoryLibrary {
        MemoryLibrary {
            order,
            ..Default::default()
        }
    }

    /// Adds or replaces a resource.
    pub fn insert(&self, id: &str, bytes: Vec<u8>) {
        self.resources.write().insert(id.to_string(), bytes);
    }

    /// Removes a resource.
    pub fn remove(&self, id: &str) {
        self.resources.write().remove(id);
    }

    /// Delays every fetch of the given resource.
    pub fn set_delay(&self, id: &str, delay: Duration) {
        self.delays.write().insert(id.to_string(), delay);
    }

    /// Makes every fetch of the given resource fail with the given error.
    pub fn set_failure(&self, id: &str, error: Error) {
        self.failures.write().insert(id.to_string(), error);
    }

    /// Gets the number of fetches started so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    fn lookup(&self, id: &str) -> Result<Vec<u8>, Error> {
        if let Some(error) = self.failures.read().get(id) {
            return Err(error.clone());
        }
        self.resources
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }
}

impl Fetch for MemoryLibrary {
    fn fetch<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Vec<u8>, Error>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let delay = self.delays.read().get(id).copied();

        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.lookup(id)
        }
        .boxed()
    }
}

impl Catalog for MemoryLibrary {
    fn next<'a>(&'a self, exclude: Option<&'a str>) -> BoxFuture<'a, Option<String>> {
        let resources = self.resources.read();
        future::ready(pick_next(resources.keys(), exclude, self.order)).boxed()
    }
}
