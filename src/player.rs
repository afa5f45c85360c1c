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
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{watch, Mutex as ActionLock},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, span, warn, Level, Span};

use crate::{
    error::Error,
    library::Catalog,
    loader::Loader,
    sampler::{AudioActivation, Sampler},
    timeline::{format_seconds, ParsedTimeline},
    transport::{self, LoopWindow, ScheduledEvent, Transport},
};

/// Player tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    /// Whether another resource starts when a track ends.
    pub autoplay_next: bool,
    /// Whether tracks loop.
    pub looping: bool,
    /// The initial volume.
    pub volume: f32,
    /// How close to the end, in seconds, counts as the end of a track.
    pub end_epsilon: f64,
    /// How often the published position is refreshed.
    pub progress_interval: Duration,
    pub transport: transport::Settings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            autoplay_next: true,
            looping: false,
            volume: 0.8,
            end_epsilon: 0.1,
            progress_interval: Duration::from_millis(16),
            transport: transport::Settings::default(),
        }
    }
}

/// The playback status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Idle,
    Loading,
    Playing,
    Paused,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            Status::Idle => "idle",
            Status::Loading => "loading",
            Status::Playing => "playing",
            Status::Paused => "paused",
            Status::Error => "error",
        };
        f.write_str(status)
    }
}

/// A snapshot of everything the player exposes to a UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackState {
    pub current: Option<String>,
    pub status: Status,
    pub position: f64,
    pub duration: f64,
    pub looping: bool,
    pub autoplay_next: bool,
    pub volume: f32,
    pub muted: bool,
    pub last_error: Option<String>,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}/{} volume {:.0}%{}",
            self.status,
            self.current.as_deref().unwrap_or("-"),
            format_seconds(self.position),
            format_seconds(self.duration),
            self.volume * 100.0,
            if self.muted { " (muted)" } else { "" },
        )?;
        if self.looping {
            f.write_str(" loop")?;
        }
        if self.autoplay_next {
            f.write_str(" autoplay")?;
        }
        if let Some(last_error) = &self.last_error {
            write!(f, " error: {}", last_error)?;
        }
        Ok(())
    }
}

/// Plays MIDI resources from a catalog through a shared sampler. Cloning is cheap and every
/// clone controls the same player.
#[derive(Clone)]
pub struct Player {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Settings,
    loader: Loader,
    catalog: Arc<dyn Catalog>,
    sampler: Arc<dyn Sampler>,
    activation: Arc<dyn AudioActivation>,
    transport: Transport,
    /// The published state. Every change goes through here.
    state: watch::Sender<PlaybackState>,
    /// The timeline of the current resource.
    timeline: Mutex<Option<Arc<ParsedTimeline>>>,
    /// Serializes user actions. Held only while state is being changed, never across a load.
    actions: ActionLock<()>,
    /// Incremented by every play request and close. Loads that finish under an older
    /// generation are discarded.
    generation: AtomicU64,
    progress: Mutex<Option<JoinHandle<()>>>,
    /// Incremented whenever the progress loop is started or stopped.
    progress_generation: AtomicU64,
    span: Span,
}

impl Player {
    /// Creates a new player. The sampler is shared for the life of the player.
    pub fn new(
        settings: Settings,
        loader: Loader,
        catalog: Arc<dyn Catalog>,
        sampler: Arc<dyn Sampler>,
        activation: Arc<dyn AudioActivation>,
    ) -> Player {
        let volume = clamp_volume(settings.volume);
        sampler.set_output(volume, false);
        let (state, _) = watch::channel(PlaybackState {
            current: None,
            status: Status::Idle,
            position: 0.0,
            duration: 0.0,
            looping: settings.looping,
            autoplay_next: settings.autoplay_next,
            volume,
            muted: false,
            last_error: None,
        });

        Player {
            inner: Arc::new(Inner {
                transport: Transport::new(sampler.clone(), settings.transport),
                settings,
                loader,
                catalog,
                sampler,
                activation,
                state,
                timeline: Mutex::new(None),
                actions: ActionLock::new(()),
                generation: AtomicU64::new(0),
                progress: Mutex::new(None),
                progress_generation: AtomicU64::new(0),
                span: span!(Level::INFO, "player"),
            }),
        }
    }

    /// Loads the sampler's sound data. Nothing plays until this completes.
    pub async fn load_sampler(&self) -> Result<(), Error> {
        let inner = &self.inner;
        info!(parent: &inner.span, sampler = %inner.sampler, "Loading sampler.");
        inner.sampler.load().await?;
        info!(parent: &inner.span, "Sampler ready.");
        Ok(())
    }

    /// Returns a snapshot of the current state.
    pub fn state(&self) -> PlaybackState {
        self.inner.state.borrow().clone()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.inner.state.subscribe()
    }

    /// Returns the timeline of the current resource, if one is loaded.
    pub fn timeline(&self) -> Option<Arc<ParsedTimeline>> {
        self.inner.timeline.lock().clone()
    }

    /// Loads and plays the given resource from the start, replacing whatever was playing.
    ///
    /// If another play request or a close happens while this one is loading, this load is
    /// discarded when it completes and Ok is returned. Failures put the player in the error
    /// state and are also returned.
    pub async fn play_resource(&self, id: &str) -> Result<(), Error> {
        let inner = &self.inner;
        let generation = {
            let _action = inner.actions.lock().await;
            if !inner.sampler.is_ready() {
                warn!(parent: &inner.span, id, "Sampler is not ready, ignoring play request.");
                return Err(Error::SamplerNotReady);
            }

            let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
            self.stop_progress();
            inner.transport.stop(false);
            inner
                .state
                .send_modify(|state| state.status = Status::Loading);
            generation
        };

        info!(parent: &inner.span, id, "Loading resource.");
        let result = match inner.loader.load(id).await {
            Ok(timeline) => inner.activation.ensure_ready().await.map(|_| timeline),
            Err(e) => Err(e),
        };

        let _action = inner.actions.lock().await;
        if inner.generation.load(Ordering::Acquire) != generation {
            debug!(parent: &inner.span, id, "Discarding stale load.");
            return Ok(());
        }

        match result {
            Ok(timeline) => {
                self.install(id, timeline);
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Pauses while playing and resumes while paused. Does nothing otherwise.
    pub async fn toggle_play_pause(&self) -> Result<(), Error> {
        let _action = self.inner.actions.lock().await;
        let status = self.status();
        match status {
            Status::Playing => {
                self.pause_locked();
                Ok(())
            }
            Status::Paused => self.resume_locked().await,
            _ => Ok(()),
        }
    }

    /// Pauses playback. Does nothing unless playing.
    pub async fn pause(&self) {
        let _action = self.inner.actions.lock().await;
        if self.status() == Status::Playing {
            self.pause_locked();
        }
    }

    /// Resumes playback. Does nothing unless paused.
    pub async fn resume(&self) -> Result<(), Error> {
        let _action = self.inner.actions.lock().await;
        if self.status() == Status::Paused {
            return self.resume_locked().await;
        }
        Ok(())
    }

    /// Moves playback to the given position, clamped to the track. The play/pause state is
    /// kept. Returns the new position.
    pub async fn seek(&self, seconds: f64) -> f64 {
        let inner = &self.inner;
        let _action = inner.actions.lock().await;
        match self.status() {
            Status::Playing | Status::Paused => {
                let position = inner.transport.seek(seconds);
                inner
                    .state
                    .send_modify(|state| state.position = position);
                info!(parent: &inner.span, position, "Seeked.");
                position
            }
            _ => inner.state.borrow().position,
        }
    }

    /// Turns looping of the whole track on or off. Affects the next end-of-track check.
    pub async fn set_looping(&self, looping: bool) {
        let inner = &self.inner;
        let _action = inner.actions.lock().await;
        let duration = inner.transport.duration();
        inner.transport.set_loop(if looping {
            LoopWindow::new(0.0, duration)
        } else {
            None
        });
        inner.state.send_modify(|state| state.looping = looping);
        info!(parent: &inner.span, looping, "Set looping.");
    }

    /// Loops part of the current track. Returns false if nothing is loaded or the window is
    /// empty once limited to the track.
    pub async fn set_loop_window(&self, start: f64, end: f64) -> bool {
        let inner = &self.inner;
        let _action = inner.actions.lock().await;
        if !matches!(self.status(), Status::Playing | Status::Paused) {
            return false;
        }

        let Some(window) = LoopWindow::new(start, end.min(inner.transport.duration())) else {
            return false;
        };
        inner.transport.set_loop(Some(window));
        inner.state.send_modify(|state| state.looping = true);
        info!(parent: &inner.span, window = %window, "Set loop window.");
        true
    }

    pub async fn set_autoplay_next(&self, autoplay_next: bool) {
        let _action = self.inner.actions.lock().await;
        self.inner
            .state
            .send_modify(|state| state.autoplay_next = autoplay_next);
        info!(parent: &self.inner.span, autoplay_next, "Set autoplay.");
    }

    /// Sets the volume, clamped to [0, 1]. Any audible volume also unmutes.
    pub async fn set_volume(&self, volume: f32) {
        let inner = &self.inner;
        let _action = inner.actions.lock().await;
        let volume = clamp_volume(volume);
        let mut muted = false;
        inner.state.send_modify(|state| {
            state.volume = volume;
            if volume > 0.0 {
                state.muted = false;
            }
            muted = state.muted;
        });
        inner.sampler.set_output(volume, muted);
        debug!(parent: &inner.span, volume, muted, "Set volume.");
    }

    /// Mutes or unmutes without changing the volume.
    pub async fn toggle_mute(&self) {
        let inner = &self.inner;
        let _action = inner.actions.lock().await;
        let mut output = (0.0, false);
        inner.state.send_modify(|state| {
            state.muted = !state.muted;
            output = (state.volume, state.muted);
        });
        inner.sampler.set_output(output.0, output.1);
        debug!(parent: &inner.span, muted = output.1, "Toggled mute.");
    }

    /// Stops playback and forgets the current resource. Works from any state, including while
    /// a load is in flight.
    pub async fn close(&self) {
        let inner = &self.inner;
        let _action = inner.actions.lock().await;
        inner.generation.fetch_add(1, Ordering::AcqRel);
        self.stop_progress();
        inner.transport.stop(true);
        inner.transport.set_loop(None);
        inner.timeline.lock().take();
        inner.state.send_modify(|state| {
            state.current = None;
            state.status = Status::Idle;
            state.position = 0.0;
            state.duration = 0.0;
            state.last_error = None;
        });
        info!(parent: &inner.span, "Closed.");
    }

    fn status(&self) -> Status {
        self.inner.state.borrow().status
    }

    /// Whether the loop will carry playback past the end of the track.
    fn looping_active(&self) -> bool {
        self.inner.state.borrow().looping && self.inner.transport.loop_window().is_some()
    }

    fn at_end(&self, position: f64) -> bool {
        !self.looping_active()
            && position >= self.inner.transport.duration() - self.inner.settings.end_epsilon
    }

    fn install(&self, id: &str, timeline: ParsedTimeline) {
        let inner = &self.inner;
        let duration = timeline.duration();
        inner
            .transport
            .load(ScheduledEvent::from_timeline(&timeline), duration);
        let looping = inner.state.borrow().looping;
        inner.transport.set_loop(if looping {
            LoopWindow::new(0.0, duration)
        } else {
            None
        });
        *inner.timeline.lock() = Some(Arc::new(timeline));

        inner.transport.start();
        inner.state.send_modify(|state| {
            state.current = Some(id.to_string());
            state.status = Status::Playing;
            state.position = 0.0;
            state.duration = duration;
            state.last_error = None;
        });
        info!(
            parent: &inner.span,
            id,
            duration = format_seconds(duration),
            "Playing."
        );
        self.start_progress();
    }

    fn fail(&self, e: &Error) {
        let inner = &self.inner;
        self.stop_progress();
        inner.transport.stop(true);
        inner.timeline.lock().take();
        inner.state.send_modify(|state| {
            state.current = None;
            state.status = Status::Error;
            state.position = 0.0;
            state.duration = 0.0;
            state.last_error = Some(e.to_string());
        });
        error!(parent: &inner.span, err = %e, "Playback failed.");
    }

    fn pause_locked(&self) {
        let inner = &self.inner;
        inner.transport.pause();
        self.stop_progress();
        let position = inner.transport.position();
        inner.state.send_modify(|state| {
            state.status = Status::Paused;
            state.position = position;
        });
        info!(parent: &inner.span, position, "Paused.");
    }

    async fn resume_locked(&self) -> Result<(), Error> {
        let inner = &self.inner;
        if self.at_end(inner.transport.position()) {
            inner.transport.seek(0.0);
        }
        if let Err(e) = inner.activation.ensure_ready().await {
            self.fail(&e);
            return Err(e);
        }

        inner.transport.start();
        let position = inner.transport.position();
        inner.state.send_modify(|state| {
            state.status = Status::Playing;
            state.position = position;
        });
        info!(parent: &inner.span, position, "Resumed.");
        self.start_progress();
        Ok(())
    }

    /// Holds at the end of the track, paused, so the track can be replayed.
    fn hold_end(&self) {
        let inner = &self.inner;
        let duration = inner.transport.duration();
        inner.transport.pause();
        inner.transport.seek(duration);
        self.stop_progress();
        inner.state.send_modify(|state| {
            state.status = Status::Paused;
            state.position = duration;
        });
        info!(parent: &inner.span, "Reached the end of the track.");
    }

    fn start_progress(&self) {
        let inner = &self.inner;
        let generation = inner.progress_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let handle = tokio::spawn(progress_loop(Arc::downgrade(inner), generation));
        if let Some(previous) = inner.progress.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_progress(&self) {
        let inner = &self.inner;
        inner.progress_generation.fetch_add(1, Ordering::AcqRel);
        if let Some(progress) = inner.progress.lock().take() {
            progress.abort();
        }
    }

    /// Publishes the position. Returns false once the loop should exit.
    fn progress_tick(&self, generation: u64) -> bool {
        let inner = &self.inner;
        let mut published = None;
        // Checked and read under the state write lock, so a close, pause or seek that publishes
        // concurrently is always ordered after this write.
        inner.state.send_if_modified(|state| {
            if inner.progress_generation.load(Ordering::Acquire) != generation
                || state.status != Status::Playing
            {
                return false;
            }
            let position = inner.transport.position();
            published = Some(position);
            if state.position == position {
                return false;
            }
            state.position = position;
            true
        });
        let Some(position) = published else {
            return false;
        };

        if self.at_end(position) {
            let player = self.clone();
            tokio::spawn(async move { player.finish_track(generation).await });
            return false;
        }
        true
    }

    /// Handles the end of a track: holds at the end, or moves on to the next resource.
    async fn finish_track(&self, progress_generation: u64) {
        let inner = &self.inner;
        let (current, generation) = {
            let _action = inner.actions.lock().await;
            if inner.progress_generation.load(Ordering::Acquire) != progress_generation
                || self.status() != Status::Playing
            {
                return;
            }
            if !self.at_end(inner.transport.position()) {
                // Looping was turned on or the track was seeked in the meantime.
                self.start_progress();
                return;
            }
            if !inner.state.borrow().autoplay_next {
                self.hold_end();
                return;
            }
            (
                inner.state.borrow().current.clone(),
                inner.generation.load(Ordering::Acquire),
            )
        };

        let next = inner.catalog.next(current.as_deref()).await;
        {
            let _action = inner.actions.lock().await;
            if inner.generation.load(Ordering::Acquire) != generation
                || self.status() != Status::Playing
            {
                debug!(parent: &inner.span, ?next, "Discarding stale autoplay pick.");
                return;
            }
            if next.is_none() {
                info!(parent: &inner.span, "Nothing else to play.");
                self.hold_end();
                return;
            }
        }

        if let Some(next) = next {
            info!(parent: &inner.span, ?current, next = %next, "Autoplaying next resource.");
            if let Err(e) = self.play_resource(&next).await {
                warn!(parent: &inner.span, err = %e, next = %next, "Autoplay failed.");
            }
        }
    }
}

async fn progress_loop(inner: Weak<Inner>, generation: u64) {
    let Some(period) = inner
        .upgrade()
        .map(|inner| inner.settings.progress_interval)
    else {
        return;
    };
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let player = Player { inner };
        if !player.progress_tick(generation) {
            return;
        }
    }
}

fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{atomic::AtomicBool, Arc},
        time::Duration,
    };

    use futures_util::future::{self, BoxFuture, FutureExt};

    use crate::{
        library::MemoryLibrary,
        sampler::{test::Sampler as MockSampler, AlwaysReady},
        testutil::{eventually_async, library_with, silent_file, steady_file},
        timeline::Pitch,
    };

    use super::*;

    struct Fixture {
        player: Player,
        sampler: Arc<MockSampler>,
        library: Arc<MemoryLibrary>,
    }

    fn fixture_with(
        library: MemoryLibrary,
        settings: Settings,
        sampler: MockSampler,
        activation: Arc<dyn AudioActivation>,
    ) -> Fixture {
        let library = Arc::new(library);
        let sampler = Arc::new(sampler);
        let player = Player::new(
            settings,
            Loader::new(library.clone()),
            library.clone(),
            sampler.clone(),
            activation,
        );
        Fixture {
            player,
            sampler,
            library,
        }
    }

    fn fixture(library: MemoryLibrary, settings: Settings) -> Fixture {
        fixture_with(
            library,
            settings,
            MockSampler::ready("mock"),
            Arc::new(AlwaysReady),
        )
    }

    fn no_autoplay() -> Settings {
        Settings {
            autoplay_next: false,
            ..Default::default()
        }
    }

    async fn sleep(seconds: f64) {
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    }

    fn close(expected: f64, actual: f64) -> bool {
        (expected - actual).abs() < 1e-6
    }

    struct Blocked;

    /// Activation that fails while suspended.
    #[derive(Default)]
    struct Suspendable {
        suspended: AtomicBool,
    }

    impl AudioActivation for Suspendable {
        fn ensure_ready(&self) -> BoxFuture<'_, Result<(), Error>> {
            let result = if self.suspended.load(Ordering::Acquire) {
                Err(Error::AudioActivation("suspended".to_string()))
            } else {
                Ok(())
            };
            future::ready(result).boxed()
        }
    }

    impl AudioActivation for Blocked {
        fn ensure_ready(&self) -> BoxFuture<'_, Result<(), Error>> {
            future::ready(Err(Error::AudioActivation("blocked".to_string()))).boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_state() {
        let fixture = fixture(MemoryLibrary::new(), Settings::default());
        let state = fixture.player.state();
        assert_eq!(Status::Idle, state.status);
        assert_eq!(None, state.current);
        assert!(state.autoplay_next);
        assert!(!state.looping);
        assert_eq!(0.8, state.volume);
        assert_eq!((0.8, false), fixture.sampler.output());

        // Nothing to toggle.
        fixture.player.toggle_play_pause().await.expect("toggle failed");
        assert_eq!(Status::Idle, fixture.player.state().status);
        assert!(fixture.player.timeline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_resource() {
        let fixture = fixture(library_with(&[("a", steady_file(10, 60))]), no_autoplay());
        fixture.player.play_resource("a").await.expect("play failed");

        let state = fixture.player.state();
        assert_eq!(Status::Playing, state.status);
        assert_eq!(Some("a".to_string()), state.current);
        assert!(close(10.0, state.duration));
        assert_eq!(0.0, state.position);
        assert_eq!(
            11,
            fixture.player.timeline().expect("timeline").note_count()
        );

        sleep(1.2).await;
        assert!((fixture.player.state().position - 1.2).abs() < 0.02);
        assert_eq!(2, fixture.sampler.note_ons(Pitch::new(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_track_holds_without_autoplay() {
        let fixture = fixture(library_with(&[("a", steady_file(10, 60))]), no_autoplay());
        fixture.player.play_resource("a").await.expect("play failed");

        let player = &fixture.player;
        eventually_async(
            move || async move { player.state().status == Status::Paused },
            "Track never held at its end",
        )
        .await;
        let state = fixture.player.state();
        assert_eq!(Status::Paused, state.status);
        assert_eq!(Some("a".to_string()), state.current);
        assert!(close(10.0, state.position));

        // Playing again from the end restarts the track.
        fixture.player.toggle_play_pause().await.expect("toggle failed");
        let state = fixture.player.state();
        assert_eq!(Status::Playing, state.status);
        assert!(state.position < 0.1);
        sleep(0.5).await;
        assert!((fixture.player.state().position - 0.5).abs() < 0.02);
    }

    #[tokio::test(start_paused = true)]
    async fn test_autoplay_moves_on_without_idle() {
        let library = library_with(&[("a", steady_file(2, 60)), ("b", steady_file(5, 72))]);
        let fixture = fixture(library, Settings::default());

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut receiver = fixture.player.subscribe();
        let recorded = statuses.clone();
        tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                let status = receiver.borrow_and_update().status;
                recorded.lock().push(status);
            }
        });

        fixture.player.play_resource("a").await.expect("play failed");
        let player = &fixture.player;
        eventually_async(
            move || async move { player.state().current.as_deref() == Some("b") },
            "Autoplay never moved on",
        )
        .await;
        sleep(0.5).await;

        let state = fixture.player.state();
        assert_eq!(Status::Playing, state.status);
        assert_eq!(Some("b".to_string()), state.current);
        assert!(fixture.sampler.note_ons(Pitch::new(72)) > 0);

        let statuses = statuses.lock();
        assert!(statuses.contains(&Status::Playing));
        assert!(!statuses.contains(&Status::Idle));
        assert!(!statuses.contains(&Status::Paused));
    }

    #[tokio::test(start_paused = true)]
    async fn test_autoplay_with_nothing_next_holds() {
        let fixture = fixture(library_with(&[("a", steady_file(2, 60))]), Settings::default());
        fixture.player.play_resource("a").await.expect("play failed");

        let player = &fixture.player;
        eventually_async(
            move || async move { player.state().status != Status::Playing },
            "Track never ended",
        )
        .await;
        let state = fixture.player.state();
        assert_eq!(Status::Paused, state.status);
        assert!(close(2.0, state.position));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_clamps_and_keeps_status() {
        let fixture = fixture(library_with(&[("a", steady_file(10, 60))]), no_autoplay());

        // Nothing loaded.
        assert_eq!(0.0, fixture.player.seek(5.0).await);
        assert_eq!(Status::Idle, fixture.player.state().status);

        fixture.player.play_resource("a").await.expect("play failed");
        assert_eq!(0.0, fixture.player.seek(-5.0).await);
        assert!(close(4.0, fixture.player.seek(4.0).await));
        assert_eq!(Status::Playing, fixture.player.state().status);

        fixture.player.pause().await;
        assert!(close(10.0, fixture.player.seek(100.0).await));
        assert_eq!(Status::Paused, fixture.player.state().status);
        assert!(close(5.0, fixture.player.seek(5.0).await));
        let state = fixture.player.state();
        assert_eq!(Status::Paused, state.status);
        assert!(close(5.0, state.position));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_is_idempotent() {
        let fixture = fixture(library_with(&[("a", steady_file(10, 60))]), no_autoplay());
        fixture.player.play_resource("a").await.expect("play failed");
        sleep(1.5).await;

        fixture.player.pause().await;
        let paused = fixture.player.state();
        fixture.player.pause().await;
        sleep(1.0).await;
        assert_eq!(paused, fixture.player.state());
        assert_eq!(Status::Paused, paused.status);

        fixture.player.resume().await.expect("resume failed");
        fixture.player.resume().await.expect("resume failed");
        sleep(1.0).await;
        let state = fixture.player.state();
        assert_eq!(Status::Playing, state.status);
        assert!((state.position - 2.5).abs() < 0.02);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_leaves_no_old_notes() {
        let library = library_with(&[("a", steady_file(10, 60)), ("b", steady_file(10, 72))]);
        let fixture = fixture(library, no_autoplay());
        fixture.player.play_resource("a").await.expect("play failed");

        // The note at 2.0 has been handed to the sampler but has not sounded yet.
        sleep(1.95).await;
        assert_eq!(2, fixture.sampler.note_ons(Pitch::new(60)));
        assert!(fixture.sampler.pending() > 0);

        fixture.player.play_resource("b").await.expect("play failed");
        sleep(3.0).await;
        assert_eq!(2, fixture.sampler.note_ons(Pitch::new(60)));
        assert!(fixture.sampler.note_ons(Pitch::new(72)) >= 3);
        assert_eq!(Some("b".to_string()), fixture.player.state().current);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_wraps_without_pausing() {
        let fixture = fixture(library_with(&[("a", steady_file(2, 60))]), Settings::default());
        fixture.player.play_resource("a").await.expect("play failed");
        fixture.player.set_looping(true).await;

        let mut receiver = fixture.player.subscribe();
        let paused = Arc::new(Mutex::new(false));
        let recorded = paused.clone();
        tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                if receiver.borrow_and_update().status != Status::Playing {
                    *recorded.lock() = true;
                }
            }
        });

        sleep(3.5).await;
        let state = fixture.player.state();
        assert_eq!(Status::Playing, state.status);
        assert!(state.looping);
        assert!(state.position < 2.0);
        assert!(!*paused.lock());
        // Two passes through the notes at 0.0, 1.0 and 1.5.
        assert!(fixture.sampler.note_ons(Pitch::new(60)) >= 5);

        // Without looping the track ends and autoplay finds nothing else.
        fixture.player.set_looping(false).await;
        sleep(2.5).await;
        assert_eq!(Status::Paused, fixture.player.state().status);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_window() {
        let fixture = fixture(library_with(&[("a", steady_file(10, 60))]), no_autoplay());
        assert!(!fixture.player.set_loop_window(1.0, 2.0).await);

        fixture.player.play_resource("a").await.expect("play failed");
        assert!(!fixture.player.set_loop_window(3.0, 3.0).await);
        assert!(fixture.player.set_loop_window(1.0, 2.0).await);
        assert!(fixture.player.state().looping);

        sleep(4.5).await;
        let state = fixture.player.state();
        assert_eq!(Status::Playing, state.status);
        assert!(state.position >= 1.0 && state.position < 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_and_mute() {
        let fixture = fixture(MemoryLibrary::new(), Settings::default());
        let player = &fixture.player;

        player.set_volume(0.5).await;
        assert_eq!((0.5, false), fixture.sampler.output());

        player.toggle_mute().await;
        let state = player.state();
        assert!(state.muted);
        assert_eq!(0.5, state.volume);
        assert_eq!((0.5, true), fixture.sampler.output());

        player.set_volume(0.0).await;
        assert!(player.state().muted);

        player.set_volume(0.3).await;
        let state = player.state();
        assert!(!state.muted);
        assert_eq!(0.3, state.volume);
        assert_eq!((0.3, false), fixture.sampler.output());

        player.set_volume(2.0).await;
        assert_eq!(1.0, player.state().volume);
        player.set_volume(-1.0).await;
        assert_eq!(0.0, player.state().volume);
        player.set_volume(f32::NAN).await;
        assert_eq!(0.0, player.state().volume);

        player.toggle_mute().await;
        player.toggle_mute().await;
        assert!(!player.state().muted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_resource() {
        let fixture = fixture(library_with(&[("a", steady_file(10, 60))]), no_autoplay());
        fixture.player.play_resource("a").await.expect("play failed");

        let result = fixture.player.play_resource("missing").await;
        assert_eq!(Err(Error::NotFound("missing".to_string())), result);

        let state = fixture.player.state();
        assert_eq!(Status::Error, state.status);
        assert_eq!(None, state.current);
        assert_eq!(0.0, state.duration);
        assert!(state.last_error.is_some());
        assert!(fixture.player.timeline().is_none());

        // Nothing from the previous track keeps sounding.
        let played = fixture.sampler.note_ons(Pitch::new(60));
        sleep(2.0).await;
        assert_eq!(played, fixture.sampler.note_ons(Pitch::new(60)));

        fixture.player.play_resource("a").await.expect("play failed");
        let state = fixture.player.state();
        assert_eq!(Status::Playing, state.status);
        assert_eq!(None, state.last_error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures() {
        let library = library_with(&[("bad", b"not a midi file".to_vec())]);
        library.set_failure(
            "offline",
            Error::Network {
                id: "offline".to_string(),
                reason: "connection reset".to_string(),
            },
        );
        let fixture = fixture(library, no_autoplay());

        assert!(matches!(
            fixture.player.play_resource("bad").await,
            Err(Error::Parse(_))
        ));
        assert_eq!(Status::Error, fixture.player.state().status);

        assert!(matches!(
            fixture.player.play_resource("offline").await,
            Err(Error::Network { .. })
        ));
        assert_eq!(Status::Error, fixture.player.state().status);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_not_ready() {
        let fixture = fixture_with(
            library_with(&[("a", steady_file(10, 60))]),
            no_autoplay(),
            MockSampler::get("mock"),
            Arc::new(AlwaysReady),
        );

        assert_eq!(
            Err(Error::SamplerNotReady),
            fixture.player.play_resource("a").await
        );
        assert_eq!(Status::Idle, fixture.player.state().status);
        assert_eq!(0, fixture.library.fetch_count());

        fixture.player.load_sampler().await.expect("load failed");
        fixture.player.play_resource("a").await.expect("play failed");
        assert_eq!(Status::Playing, fixture.player.state().status);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_failure() {
        let fixture = fixture_with(
            library_with(&[("a", steady_file(10, 60))]),
            no_autoplay(),
            MockSampler::ready("mock"),
            Arc::new(Blocked),
        );

        assert!(matches!(
            fixture.player.play_resource("a").await,
            Err(Error::AudioActivation(_))
        ));
        let state = fixture.player.state();
        assert_eq!(Status::Error, state.status);
        assert_eq!(
            Some("unable to activate audio output: blocked".to_string()),
            state.last_error
        );
        sleep(1.0).await;
        assert_eq!(0, fixture.sampler.note_ons(Pitch::new(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_failure_on_resume() {
        let activation = Arc::new(Suspendable::default());
        let fixture = fixture_with(
            library_with(&[("a", steady_file(10, 60))]),
            no_autoplay(),
            MockSampler::ready("mock"),
            activation.clone(),
        );
        let player = &fixture.player;
        player.play_resource("a").await.expect("play failed");
        sleep(1.2).await;
        player.pause().await;
        let played = fixture.sampler.note_ons(Pitch::new(60));

        activation.suspended.store(true, Ordering::Release);
        assert!(matches!(player.resume().await, Err(Error::AudioActivation(_))));
        let state = player.state();
        assert_eq!(Status::Error, state.status);
        assert_eq!(None, state.current);
        assert_eq!(0.0, state.position);
        assert_eq!(0.0, state.duration);
        assert_eq!(
            Some("unable to activate audio output: suspended".to_string()),
            state.last_error
        );
        assert!(player.timeline().is_none());

        sleep(2.0).await;
        assert_eq!(played, fixture.sampler.note_ons(Pitch::new(60)));
        player.toggle_play_pause().await.expect("toggle failed");
        assert_eq!(Status::Error, player.state().status);

        // A new load recovers once audio is available again.
        activation.suspended.store(false, Ordering::Release);
        player.play_resource("a").await.expect("play failed");
        let state = player.state();
        assert_eq!(Status::Playing, state.status);
        assert_eq!(None, state.last_error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_past_loop_window() {
        let fixture = fixture(library_with(&[("a", steady_file(10, 60))]), no_autoplay());
        let player = &fixture.player;
        player.play_resource("a").await.expect("play failed");
        assert!(player.set_loop_window(1.0, 3.0).await);
        sleep(1.5).await;

        assert!(close(1.0, player.seek(5.0).await));
        let state = player.state();
        assert_eq!(Status::Playing, state.status);
        assert!(close(1.0, state.position));

        sleep(0.5).await;
        let state = player.state();
        assert_eq!(Status::Playing, state.status);
        assert!((state.position - 1.5).abs() < 0.02);

        // Past the window again, playback keeps wrapping inside it.
        sleep(2.0).await;
        let state = player.state();
        assert_eq!(Status::Playing, state.status);
        assert!(state.position >= 1.0 && state.position < 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_progress_publishes_nothing() {
        let fixture = fixture(library_with(&[("a", steady_file(10, 60))]), no_autoplay());
        let player = &fixture.player;
        player.play_resource("a").await.expect("play failed");
        sleep(2.0).await;

        let generation = player.inner.progress_generation.load(Ordering::Acquire);
        assert!(player.progress_tick(generation));
        let published = player.state().position;

        // The loop is replaced while the track keeps playing.
        player.stop_progress();
        sleep(1.0).await;
        assert!(!player.progress_tick(generation));
        assert_eq!(Status::Playing, player.state().status);
        assert_eq!(published, player.state().position);

        player.start_progress();
        let generation = player.inner.progress_generation.load(Ordering::Acquire);
        player.close().await;
        assert!(!player.progress_tick(generation));
        let state = player.state();
        assert_eq!(Status::Idle, state.status);
        assert_eq!(0.0, state.position);
        assert_eq!(0.0, state.duration);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_wins_over_running_progress() {
        let settings = Settings {
            autoplay_next: false,
            progress_interval: Duration::from_micros(50),
            ..Default::default()
        };
        let fixture = fixture(library_with(&[("a", steady_file(10, 60))]), settings);
        let player = &fixture.player;

        for _ in 0..100 {
            player.play_resource("a").await.expect("play failed");
            tokio::time::sleep(Duration::from_millis(2)).await;
            player.close().await;
            tokio::task::yield_now().await;
            let state = player.state();
            assert_eq!(Status::Idle, state.status);
            assert_eq!(0.0, state.position);
            assert_eq!(0.0, state.duration);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_load_is_discarded() {
        let library = library_with(&[("slow", steady_file(10, 60)), ("fast", steady_file(10, 72))]);
        library.set_delay("slow", Duration::from_secs(5));
        let fixture = fixture(library, no_autoplay());

        let player = fixture.player.clone();
        let slow = tokio::spawn(async move { player.play_resource("slow").await });
        sleep(0.1).await;
        assert_eq!(Status::Loading, fixture.player.state().status);

        fixture.player.play_resource("fast").await.expect("play failed");
        sleep(6.0).await;
        assert_eq!(Ok(()), slow.await.expect("join failed"));

        let state = fixture.player.state();
        assert_eq!(Some("fast".to_string()), state.current);
        assert_eq!(Status::Playing, state.status);
        assert_eq!(0, fixture.sampler.note_ons(Pitch::new(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_load() {
        let library = library_with(&[("slow", steady_file(10, 60))]);
        library.set_delay("slow", Duration::from_secs(5));
        let fixture = fixture(library, no_autoplay());

        let player = fixture.player.clone();
        let slow = tokio::spawn(async move { player.play_resource("slow").await });
        sleep(0.1).await;
        fixture.player.close().await;
        sleep(6.0).await;
        assert_eq!(Ok(()), slow.await.expect("join failed"));

        let state = fixture.player.state();
        assert_eq!(Status::Idle, state.status);
        assert_eq!(None, state.current);
        assert_eq!(0, fixture.sampler.note_ons(Pitch::new(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close() {
        let fixture = fixture(library_with(&[("a", steady_file(10, 60))]), no_autoplay());
        fixture.player.play_resource("a").await.expect("play failed");
        sleep(1.0).await;

        fixture.player.close().await;
        let state = fixture.player.state();
        assert_eq!(Status::Idle, state.status);
        assert_eq!(None, state.current);
        assert_eq!(0.0, state.position);
        assert!(fixture.player.timeline().is_none());

        let played = fixture.sampler.note_ons(Pitch::new(60));
        sleep(2.0).await;
        assert_eq!(played, fixture.sampler.note_ons(Pitch::new(60)));

        // Closing again is harmless.
        fixture.player.close().await;
        assert_eq!(Status::Idle, fixture.player.state().status);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_track_is_at_end() {
        let fixture = fixture(library_with(&[("silence", silent_file())]), no_autoplay());
        fixture.player.play_resource("silence").await.expect("play failed");
        fixture.player.set_looping(true).await;

        sleep(0.1).await;
        let state = fixture.player.state();
        assert_eq!(Status::Paused, state.status);
        assert_eq!(0.0, state.position);
        assert_eq!(0.0, state.duration);
    }

    #[test]
    fn test_state_display() {
        let state = PlaybackState {
            current: Some("intro".to_string()),
            status: Status::Playing,
            position: 61.0,
            duration: 125.0,
            looping: true,
            autoplay_next: false,
            volume: 0.5,
            muted: true,
            last_error: None,
        };
        assert_eq!(
            "[playing] intro 1:01/2:05 volume 50% (muted) loop",
            state.to_string()
        );
    }
}
