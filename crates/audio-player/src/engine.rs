//! Sample-accurate render engine.
//!
//! [`RenderEngine::render`] is called from the output callback with a fixed quantum. It
//! never blocks: commands arrive over a bounded channel drained with `try_recv`, events
//! leave with `try_send`, and displaced buffers are sent back to the control side so their
//! memory is released off the real-time thread. The scheduled queue reserves its storage
//! when the engine is created.
//!
//! Every buffer change maps the playhead by time, `round(t * new_rate)`, never by carrying
//! a sample count across buffers of different length or rate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use audio_stream_types::{EngineState, PositionSnapshot};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::buffer::PcmBuffer;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::status::EngineStatus;

#[derive(Debug)]
pub enum EngineCommand {
    /// Start a new session. Clears the scheduled queue; the cursor goes to `start_at`
    /// seconds, or to zero.
    SetBuffer {
        buffer: Arc<PcmBuffer>,
        start_at: Option<f64>,
    },
    /// Swap the active buffer in place. Position defaults to the engine's own clock.
    ReplaceBuffer {
        buffer: Arc<PcmBuffer>,
        position: Option<f64>,
    },
    /// Queue a successor that takes over at `switch_at` or at the early-stop threshold.
    ScheduleSwitch {
        buffer: Arc<PcmBuffer>,
        switch_at: f64,
        early_stop_at: Option<f64>,
    },
    Play,
    Pause,
    Seek(f64),
    SetVolume(f32),
    /// The session will not grow any further: running out of audio now ends playback.
    EndOfStream,
    /// Drop the session entirely.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoSession,
    TrackMismatch,
    /// Block index lower than the active buffer's.
    StaleIndex,
    QueueFull,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TimeUpdate {
        position_seconds: f64,
        duration_seconds: f64,
    },
    /// The end of the track was reached with nothing queued. Sent once per session, again
    /// only after a seek or replay moves the playhead back.
    Ended { track_id: Arc<str>, block_index: u32 },
    BufferSwitched {
        block_index: u32,
        duration_seconds: f64,
        position_seconds: f64,
    },
    ReplaceRejected {
        block_index: u32,
        reason: RejectReason,
    },
}

#[derive(Debug)]
struct ScheduledBuffer {
    buffer: Arc<PcmBuffer>,
    switch_at: f64,
    early_stop_at: Option<f64>,
}

/// Create a connected control handle and render engine.
pub fn channel(config: &EngineConfig) -> (EngineHandle, RenderEngine) {
    let (cmd_tx, cmd_rx) = bounded(config.command_capacity.max(1));
    let (evt_tx, evt_rx) = bounded(config.event_capacity.max(1));
    let retire_cap = config.schedule_capacity + config.command_capacity + 2;
    let (ret_tx, ret_rx) = bounded(retire_cap);
    let status = Arc::new(EngineStatus::default());

    let handle = EngineHandle {
        commands: cmd_tx,
        events: evt_rx,
        retired: ret_rx,
        status: status.clone(),
    };
    let engine = RenderEngine {
        commands: cmd_rx,
        events: evt_tx,
        retired: ret_tx,
        status,
        guard_seconds: config.guard_interval_seconds.max(0.0),
        update_hz: config.time_update_hz.max(1),
        state: EngineState::Idle,
        active: None,
        cursor: 0,
        scheduled: VecDeque::with_capacity(config.schedule_capacity.max(1)),
        schedule_capacity: config.schedule_capacity.max(1),
        volume: 1.0,
        end_of_stream: false,
        ended_sent: false,
        frames_since_update: 0,
    };
    (handle, engine)
}

/// Non-real-time side of the engine. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    commands: Sender<EngineCommand>,
    events: Receiver<EngineEvent>,
    retired: Receiver<Arc<PcmBuffer>>,
    status: Arc<EngineStatus>,
}

impl EngineHandle {
    pub fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.reclaim();
        self.commands.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => EngineError::Busy,
            TrySendError::Disconnected(_) => EngineError::Disconnected,
        })
    }

    pub fn set_buffer(&self, buffer: Arc<PcmBuffer>, start_at: Option<f64>) -> Result<(), EngineError> {
        self.send(EngineCommand::SetBuffer { buffer, start_at })
    }

    pub fn replace_buffer(
        &self,
        buffer: Arc<PcmBuffer>,
        position: Option<f64>,
    ) -> Result<(), EngineError> {
        self.send(EngineCommand::ReplaceBuffer { buffer, position })
    }

    pub fn schedule_switch(
        &self,
        buffer: Arc<PcmBuffer>,
        switch_at: f64,
        early_stop_at: Option<f64>,
    ) -> Result<(), EngineError> {
        self.send(EngineCommand::ScheduleSwitch {
            buffer,
            switch_at,
            early_stop_at,
        })
    }

    pub fn play(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Play)
    }

    pub fn pause(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Pause)
    }

    pub fn seek(&self, seconds: f64) -> Result<(), EngineError> {
        self.send(EngineCommand::Seek(seconds))
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), EngineError> {
        self.send(EngineCommand::SetVolume(volume))
    }

    pub fn stop(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Stop)
    }

    pub fn end_of_stream(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::EndOfStream)
    }

    /// Latest published position; never touches the render thread.
    pub fn position(&self) -> PositionSnapshot {
        self.status.snapshot()
    }

    pub fn status(&self) -> &Arc<EngineStatus> {
        &self.status
    }

    /// Drain pending events without waiting.
    pub fn try_events(&self) -> Vec<EngineEvent> {
        self.reclaim();
        self.events.try_iter().collect()
    }

    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<EngineEvent> {
        self.reclaim();
        self.events.recv_timeout(timeout).ok()
    }

    /// Drop buffers the render thread has let go of. Returns how many were released.
    pub fn reclaim(&self) -> usize {
        self.retired.try_iter().count()
    }
}

/// Real-time half. Owned by the output callback.
pub struct RenderEngine {
    commands: Receiver<EngineCommand>,
    events: Sender<EngineEvent>,
    retired: Sender<Arc<PcmBuffer>>,
    status: Arc<EngineStatus>,
    guard_seconds: f64,
    update_hz: u32,
    state: EngineState,
    active: Option<Arc<PcmBuffer>>,
    cursor: u64,
    scheduled: VecDeque<ScheduledBuffer>,
    schedule_capacity: usize,
    volume: f32,
    /// No further buffers will extend the active one.
    end_of_stream: bool,
    ended_sent: bool,
    frames_since_update: u64,
}

impl RenderEngine {
    pub fn status(&self) -> &Arc<EngineStatus> {
        &self.status
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn position_seconds(&self) -> f64 {
        match &self.active {
            Some(active) => self.cursor as f64 / active.sample_rate as f64,
            None => 0.0,
        }
    }

    /// Render one quantum of interleaved audio into `out`.
    ///
    /// Frames that cannot be filled are written as silence.
    pub fn render(&mut self, out: &mut [f32], out_channels: usize) {
        let out_channels = out_channels.max(1);
        self.drain_commands();

        let frames = out.len() / out_channels;
        let mut written = 0usize;
        if self.state == EngineState::Rendering {
            while written < frames {
                self.maybe_switch();
                let Some(total) = self.active.as_ref().map(|a| a.frames() as u64) else {
                    break;
                };
                if self.cursor >= total {
                    // A partial buffer starves until its successor arrives.
                    if self.at_track_end() {
                        self.finish();
                    }
                    break;
                }
                let Some(active) = self.active.as_ref() else {
                    break;
                };

                let frame = self.cursor as usize;
                let base = written * out_channels;
                for ch in 0..out_channels {
                    out[base + ch] = active.mapped_sample(frame, out_channels, ch) * self.volume;
                }
                self.cursor += 1;
                written += 1;

                self.frames_since_update += 1;
                let update_every = (active.sample_rate / self.update_hz).max(1) as u64;
                if self.frames_since_update >= update_every {
                    self.frames_since_update = 0;
                    let duration_seconds = active.duration_seconds();
                    let position_seconds = self.cursor as f64 / active.sample_rate as f64;
                    self.emit(EngineEvent::TimeUpdate {
                        position_seconds,
                        duration_seconds,
                    });
                }
            }
            if written < frames && self.state == EngineState::Rendering {
                self.status.add_underrun((frames - written) as u64);
            }
        }

        out[written * out_channels..].fill(0.0);
        self.publish();
    }

    fn drain_commands(&mut self) {
        let mut applied = false;
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
            applied = true;
        }
        if applied {
            self.publish();
        }
    }

    /// Apply one command immediately.
    pub fn apply(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::SetBuffer { buffer, start_at } => {
                self.clear_session();
                self.cursor = start_at
                    .map(|t| frame_at(t, buffer.sample_rate).min(buffer.frames() as u64))
                    .unwrap_or(0);
                self.active = Some(buffer);
                self.state = EngineState::Armed;
            }
            EngineCommand::ReplaceBuffer { buffer, position } => {
                if let Some(reason) = self.check_successor(&buffer) {
                    self.reject(buffer, reason);
                    return;
                }
                let at = position.unwrap_or_else(|| self.position_seconds());
                let index = buffer.block_index;
                while self
                    .scheduled
                    .front()
                    .is_some_and(|s| s.buffer.block_index <= index)
                {
                    if let Some(stale) = self.scheduled.pop_front() {
                        self.retire(stale.buffer);
                    }
                }
                self.switch_to(buffer, at);
            }
            EngineCommand::ScheduleSwitch {
                buffer,
                switch_at,
                early_stop_at,
            } => {
                if let Some(reason) = self.check_successor(&buffer) {
                    self.reject(buffer, reason);
                    return;
                }
                if self.scheduled.len() >= self.schedule_capacity {
                    self.reject(buffer, RejectReason::QueueFull);
                    return;
                }
                self.scheduled.push_back(ScheduledBuffer {
                    buffer,
                    switch_at,
                    early_stop_at,
                });
            }
            EngineCommand::Play => {
                let Some(active) = &self.active else {
                    return;
                };
                let exhausted = self.cursor >= active.frames() as u64 && self.scheduled.is_empty();
                if exhausted && self.at_track_end() {
                    self.cursor = 0;
                    self.ended_sent = false;
                }
                self.state = EngineState::Rendering;
            }
            EngineCommand::Pause => {
                if self.state == EngineState::Rendering {
                    self.state = EngineState::Armed;
                }
            }
            EngineCommand::Seek(seconds) => {
                let Some(active) = &self.active else {
                    return;
                };
                self.cursor = frame_at(seconds, active.sample_rate).min(active.frames() as u64);
                self.ended_sent = false;
                if self.state == EngineState::Idle {
                    self.state = EngineState::Armed;
                }
            }
            EngineCommand::SetVolume(volume) => {
                if volume.is_finite() {
                    self.volume = volume.clamp(0.0, 1.0);
                }
            }
            EngineCommand::EndOfStream => {
                if self.active.is_some() {
                    self.end_of_stream = true;
                }
            }
            EngineCommand::Stop => {
                self.clear_session();
                self.state = EngineState::Idle;
            }
        }
    }

    fn at_track_end(&self) -> bool {
        self.end_of_stream || self.active.as_ref().is_some_and(|a| a.is_complete())
    }

    fn check_successor(&self, buffer: &PcmBuffer) -> Option<RejectReason> {
        let Some(active) = &self.active else {
            return Some(RejectReason::NoSession);
        };
        if active.track_id != buffer.track_id {
            Some(RejectReason::TrackMismatch)
        } else if buffer.block_index < active.block_index {
            Some(RejectReason::StaleIndex)
        } else {
            None
        }
    }

    fn reject(&self, buffer: Arc<PcmBuffer>, reason: RejectReason) {
        let block_index = buffer.block_index;
        self.retire(buffer);
        self.emit(EngineEvent::ReplaceRejected {
            block_index,
            reason,
        });
    }

    /// Switch to the queue head once it is due, or once the active buffer is spent.
    fn maybe_switch(&mut self) {
        let (Some(head), Some(active)) = (self.scheduled.front(), self.active.as_ref()) else {
            return;
        };
        let now = self.cursor as f64 / active.sample_rate as f64;
        let early_stop = head
            .early_stop_at
            .unwrap_or(active.duration_seconds() - self.guard_seconds);
        let due = now >= head.switch_at.min(early_stop);
        if !due && self.cursor < active.frames() as u64 {
            return;
        }
        if let Some(next) = self.scheduled.pop_front() {
            self.switch_to(next.buffer, now);
        }
    }

    fn switch_to(&mut self, buffer: Arc<PcmBuffer>, at_seconds: f64) {
        self.cursor = frame_at(at_seconds, buffer.sample_rate).min(buffer.frames() as u64);
        let event = EngineEvent::BufferSwitched {
            block_index: buffer.block_index,
            duration_seconds: buffer.duration_seconds(),
            position_seconds: self.cursor as f64 / buffer.sample_rate as f64,
        };
        if let Some(old) = self.active.replace(buffer) {
            self.retire(old);
        }
        self.emit(event);
    }

    fn finish(&mut self) {
        self.state = EngineState::Idle;
        if self.ended_sent {
            return;
        }
        self.ended_sent = true;
        if let Some(active) = &self.active {
            let event = EngineEvent::Ended {
                track_id: active.track_id.clone(),
                block_index: active.block_index,
            };
            self.emit(event);
        }
    }

    fn clear_session(&mut self) {
        while let Some(s) = self.scheduled.pop_front() {
            self.retire(s.buffer);
        }
        if let Some(old) = self.active.take() {
            self.retire(old);
        }
        self.cursor = 0;
        self.end_of_stream = false;
        self.ended_sent = false;
        self.frames_since_update = 0;
    }

    fn retire(&self, buffer: Arc<PcmBuffer>) {
        // A full channel means the control side stopped reclaiming; dropping here is the
        // only option left.
        let _ = self.retired.try_send(buffer);
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.try_send(event);
    }

    fn publish(&self) {
        let (duration, index) = self
            .active
            .as_ref()
            .map(|a| (a.duration_seconds(), a.block_index))
            .unwrap_or((0.0, 0));
        self.status.publish(
            self.state,
            self.position_seconds(),
            duration,
            index,
            self.volume,
        );
    }

    #[cfg(test)]
    fn cursor(&self) -> u64 {
        self.cursor
    }

    #[cfg(test)]
    fn queued(&self) -> Vec<u32> {
        self.scheduled.iter().map(|s| s.buffer.block_index).collect()
    }
}

fn frame_at(seconds: f64, sample_rate: u32) -> u64 {
    if !seconds.is_finite() || seconds <= 0.0 {
        return 0;
    }
    (seconds * sample_rate as f64).round() as u64
}
