//! Per-guild playback queue state machine

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{LoopMode, PlaybackState, PlaybackSummary, Track};
use crate::gateway::AudioSink;
use crate::{Error, Result};

/// Completion tokens are unique process-wide so a completion can never match
/// a queue that replaced the one it was issued by
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// A track the caller must start on the voice connection
#[derive(Debug, Clone, PartialEq)]
pub struct PlayRequest {
    /// Track to route
    pub track: Track,
    /// Volume at the time the track was chosen
    pub volume: f32,
    /// Completion token; only a completion carrying this value advances
    pub generation: u64,
}

/// Where the current track goes when it finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposal {
    ByLoopMode,
    ToHistory,
    /// Already placed back into `pending` by a rewind
    Discard,
}

/// Outcome of [`PlaybackQueue::previous`]
#[derive(Debug, Clone, PartialEq)]
pub enum Rewind {
    /// The current track is being stopped; the rewound track starts on its
    /// completion
    Stopping,
    /// The queue was idle; start this track now
    Start(PlayRequest),
    /// The queue was idle and cannot start yet (no connection)
    Queued,
}

/// Queue, history, current track, volume and loop mode for one guild
pub struct PlaybackQueue {
    pending: VecDeque<Track>,
    history: VecDeque<Track>,
    current: Option<Track>,
    disposal: Disposal,
    volume: f32,
    loop_mode: LoopMode,
    state: PlaybackState,
    generation: u64,
    sink: Option<Box<dyn AudioSink>>,
    stop_requested: bool,
    history_limit: usize,
}

impl fmt::Debug for PlaybackQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackQueue")
            .field("state", &self.state)
            .field("current", &self.current)
            .field("pending", &self.pending.len())
            .field("history", &self.history.len())
            .field("loop_mode", &self.loop_mode)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl PlaybackQueue {
    /// Create an idle queue
    #[must_use]
    pub fn new(volume: f32, history_limit: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            history: VecDeque::new(),
            current: None,
            disposal: Disposal::ByLoopMode,
            volume,
            loop_mode: LoopMode::Off,
            state: PlaybackState::Idle,
            generation: next_generation(),
            sink: None,
            stop_requested: false,
            history_limit,
        }
    }

    /// Append a track to the tail of the queue
    pub fn enqueue(&mut self, track: Track) {
        self.pending.push_back(track);
    }

    /// Pick the next track if nothing is playing
    pub fn start_if_idle(&mut self) -> Option<PlayRequest> {
        if self.state == PlaybackState::Idle && self.current.is_none() {
            self.advance()
        } else {
            None
        }
    }

    /// Apply the completion of the track started under `generation`
    ///
    /// Returns `None` for a stale completion (already applied, or for a track
    /// that was superseded); otherwise the next track to start, if any.
    pub fn complete(&mut self, generation: u64) -> Option<Option<PlayRequest>> {
        if !self.is_current(generation) {
            return None;
        }
        Some(self.advance())
    }

    /// A track could not be started
    ///
    /// With `connection_lost` the track is kept at the head of the queue and
    /// the queue idles until reconnection. Otherwise it is moved to history
    /// whatever the loop mode, so a broken track cannot spin.
    pub fn start_failed(
        &mut self,
        generation: u64,
        connection_lost: bool,
    ) -> Option<Option<PlayRequest>> {
        if !self.is_current(generation) {
            return None;
        }
        if connection_lost {
            self.interrupt();
            return Some(None);
        }
        if self.disposal == Disposal::ByLoopMode {
            self.disposal = Disposal::ToHistory;
        }
        Some(self.advance())
    }

    /// Hand over the sink of the track started under `request`
    ///
    /// Returns `false` and stops the sink when the request is stale.
    pub fn attach(&mut self, request: &PlayRequest, sink: Box<dyn AudioSink>) -> bool {
        if !self.is_current(request.generation) {
            if let Err(e) = sink.stop() {
                tracing::debug!(error = %e, "stale sink already gone");
            }
            return false;
        }

        if self.stop_requested {
            if let Err(e) = sink.stop() {
                tracing::warn!(error = %e, "failed to stop track after skip");
            }
        } else {
            if self.state == PlaybackState::Paused {
                if let Err(e) = sink.pause() {
                    tracing::warn!(error = %e, "failed to pause freshly started track");
                }
            }
            if (self.volume - request.volume).abs() > f32::EPSILON {
                if let Err(e) = sink.set_volume(self.volume) {
                    tracing::warn!(error = %e, "failed to apply volume");
                }
            }
        }

        self.sink = Some(sink);
        true
    }

    /// Stop the current track and move on
    ///
    /// Usually the advance happens when the stopped sink reports completion;
    /// a `Some` return means the stop could not be delivered and the caller
    /// must start the returned track itself.
    ///
    /// # Errors
    ///
    /// `NoActiveTrack` when idle, `QueueEmpty` when there is nothing to move
    /// on to
    pub fn skip(&mut self) -> Result<Option<PlayRequest>> {
        if self.current.is_none() || self.state == PlaybackState::Idle {
            return Err(Error::NoActiveTrack);
        }
        if self.pending.is_empty() && self.loop_mode == LoopMode::Off {
            return Err(Error::QueueEmpty);
        }
        if self.stop_requested {
            return Ok(None);
        }

        self.disposal = if self.loop_mode == LoopMode::Single {
            Disposal::ToHistory
        } else {
            Disposal::ByLoopMode
        };
        Ok(self.request_stop())
    }

    /// Go back to the most recently finished track
    ///
    /// The current track (if any) is queued directly after it.
    ///
    /// # Errors
    ///
    /// `NoHistory` when nothing has finished yet; nothing is mutated
    pub fn previous(&mut self, can_start: bool) -> Result<Rewind> {
        let Some(prev) = self.history.pop_back() else {
            return Err(Error::NoHistory);
        };

        let active = self.state != PlaybackState::Idle;
        match self.current.clone() {
            Some(current) if active => {
                if self.disposal != Disposal::Discard {
                    self.pending.push_front(current);
                }
                self.pending.push_front(prev);
                self.disposal = Disposal::Discard;
                Ok(self.request_stop().map_or(Rewind::Stopping, Rewind::Start))
            }
            _ => {
                self.pending.push_front(prev);
                if !can_start {
                    return Ok(Rewind::Queued);
                }
                Ok(self.start_if_idle().map_or(Rewind::Queued, Rewind::Start))
            }
        }
    }

    /// Hold the current track; reports the resulting state
    pub fn pause(&mut self) -> PlaybackState {
        if self.state == PlaybackState::Playing {
            if let Some(sink) = &self.sink {
                if let Err(e) = sink.pause() {
                    tracing::warn!(error = %e, "failed to pause track");
                }
            }
            self.state = PlaybackState::Paused;
        }
        self.state
    }

    /// Continue a held track; reports the resulting state
    pub fn resume(&mut self) -> PlaybackState {
        if self.state == PlaybackState::Paused {
            if let Some(sink) = &self.sink {
                if let Err(e) = sink.resume() {
                    tracing::warn!(error = %e, "failed to resume track");
                }
            }
            self.state = PlaybackState::Playing;
        }
        self.state
    }

    /// Set the (already clamped) volume, applying it to the in-flight track
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.set_volume(volume) {
                tracing::warn!(error = %e, "failed to apply volume");
            }
        }
    }

    /// Change loop mode; applies from the next completion
    pub const fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    /// The connection went away mid-track
    ///
    /// The current track returns to the head of the queue (unless a skip or
    /// rewind already decided its fate) and the queue idles.
    pub fn interrupt(&mut self) {
        if let Some(track) = self.current.take() {
            match self.disposal {
                Disposal::ByLoopMode => self.pending.push_front(track),
                Disposal::ToHistory => self.push_history(track),
                Disposal::Discard => {}
            }
        }
        if let Some(sink) = self.sink.take() {
            if let Err(e) = sink.stop() {
                tracing::debug!(error = %e, "interrupted sink already gone");
            }
        }
        self.reset_transient();
        self.state = PlaybackState::Idle;
    }

    /// Stop audio and forget everything
    pub fn shutdown(&mut self) {
        if let Some(sink) = self.sink.take() {
            if let Err(e) = sink.stop() {
                tracing::debug!(error = %e, "sink already gone at shutdown");
            }
        }
        self.pending.clear();
        self.history.clear();
        self.current = None;
        self.reset_transient();
        self.state = PlaybackState::Idle;
    }

    /// Current coarse state
    #[must_use]
    pub const fn state(&self) -> PlaybackState {
        self.state
    }

    /// Track whose audio is routed to the connection
    #[must_use]
    pub const fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    /// Tracks waiting to play, head first
    pub fn pending(&self) -> impl Iterator<Item = &Track> {
        self.pending.iter()
    }

    /// Number of waiting tracks
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Finished tracks, most recent last
    pub fn history(&self) -> impl Iterator<Item = &Track> {
        self.history.iter()
    }

    /// Number of remembered finished tracks
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Current volume
    #[must_use]
    pub const fn volume(&self) -> f32 {
        self.volume
    }

    /// Current loop mode
    #[must_use]
    pub const fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    /// Completion token of the current track
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Snapshot for status reporting
    #[must_use]
    pub fn summary(&self) -> PlaybackSummary {
        PlaybackSummary {
            state: self.state,
            current: self.current.clone(),
            pending: self.pending.iter().cloned().collect(),
            history_len: self.history.len(),
            volume: self.volume,
            loop_mode: self.loop_mode,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.current.is_some()
    }

    fn advance(&mut self) -> Option<PlayRequest> {
        if let Some(track) = self.current.take() {
            match (self.disposal, self.loop_mode) {
                (Disposal::Discard, _) => {}
                (Disposal::ToHistory, _) | (Disposal::ByLoopMode, LoopMode::Off) => {
                    self.push_history(track);
                }
                (Disposal::ByLoopMode, LoopMode::Single) => self.pending.push_front(track),
                (Disposal::ByLoopMode, LoopMode::All) => self.pending.push_back(track),
            }
        }
        self.sink = None;
        self.reset_transient();

        let Some(track) = self.pending.pop_front() else {
            self.state = PlaybackState::Idle;
            return None;
        };

        self.current = Some(track.clone());
        self.state = PlaybackState::Playing;
        Some(PlayRequest {
            track,
            volume: self.volume,
            generation: self.generation,
        })
    }

    fn request_stop(&mut self) -> Option<PlayRequest> {
        self.stop_requested = true;
        let Some(sink) = &self.sink else {
            // Not attached yet; `attach` delivers the stop
            return None;
        };
        match sink.stop() {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(error = %e, "stop not delivered, advancing directly");
                self.advance()
            }
        }
    }

    fn reset_transient(&mut self) {
        self.disposal = Disposal::ByLoopMode;
        self.stop_requested = false;
        self.generation = next_generation();
    }

    fn push_history(&mut self, track: Track) {
        self.history.push_back(track);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }
}
