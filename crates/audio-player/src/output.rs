//! cpal output host.
//!
//! Owns the device stream on a dedicated thread (streams are not `Send` on every host).
//! The data callback renders through the shared [`RenderEngine`] with `try_lock`, so it
//! never waits: if the control side holds the engine, that quantum is silence.
//!
//! Sample-rate changes reach the orchestrator two ways: stream faults reported by the
//! backend error callback, and, where enabled, a slow poll of the device's default rate.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};

use crate::config::OutputConfig;
use crate::device::{default_output_rate, device_name, pick_buffer_size, pick_device, pick_output_config};
use crate::engine::RenderEngine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Started {
        device: String,
        sample_rate: u32,
        channels: u16,
    },
    /// Reported by the backend error callback.
    StreamError(String),
    /// The device default rate moved away from what it was when the stream opened.
    SampleRateChanged { from: u32, to: u32 },
}

enum HostControl {
    Reset,
    Shutdown,
}

/// Running output stream plus its control thread.
pub struct OutputHost {
    control: Sender<HostControl>,
    events: Receiver<OutputEvent>,
    sample_rate: Arc<AtomicU32>,
    channels: u16,
    thread: Option<JoinHandle<()>>,
}

impl OutputHost {
    /// Open the device and start rendering `engine`.
    pub fn start(engine: Arc<Mutex<RenderEngine>>, config: OutputConfig) -> Result<Self> {
        let (control_tx, control_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(u32, u16), String>>(1);
        let sample_rate = Arc::new(AtomicU32::new(0));
        let rate_for_thread = sample_rate.clone();

        let thread = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                host_loop(engine, config, control_rx, event_tx, ready_tx, rate_for_thread)
            })
            .context("spawn audio output thread")?;

        match ready_rx.recv() {
            Ok(Ok((rate, channels))) => Ok(Self {
                control: control_tx,
                events: event_rx,
                sample_rate,
                channels,
                thread: Some(thread),
            }),
            Ok(Err(message)) => {
                let _ = thread.join();
                Err(anyhow!(message))
            }
            Err(_) => {
                let _ = thread.join();
                Err(anyhow!("audio output thread exited during startup"))
            }
        }
    }

    /// Rate of the running stream; buffers must be rendered at this rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn events(&self) -> &Receiver<OutputEvent> {
        &self.events
    }

    /// Tear down and rebuild the device stream, keeping the current rate when possible.
    pub fn reset(&self) -> Result<()> {
        self.control
            .send(HostControl::Reset)
            .map_err(|_| anyhow!("audio output thread is gone"))
    }
}

impl Drop for OutputHost {
    fn drop(&mut self) {
        let _ = self.control.send(HostControl::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct RunningStream {
    _stream: cpal::Stream,
    device: cpal::Device,
    sample_rate: u32,
    baseline_default_rate: Option<u32>,
}

fn host_loop(
    engine: Arc<Mutex<RenderEngine>>,
    config: OutputConfig,
    control: Receiver<HostControl>,
    events: Sender<OutputEvent>,
    ready: Sender<std::result::Result<(u32, u16), String>>,
    shared_rate: Arc<AtomicU32>,
) {
    let mut running = match open_stream(&engine, &config, config.target_rate, &events) {
        Ok((stream, channels)) => {
            shared_rate.store(stream.sample_rate, Ordering::Relaxed);
            let _ = ready.send(Ok((stream.sample_rate, channels)));
            Some(stream)
        }
        Err(err) => {
            let _ = ready.send(Err(format!("{err:#}")));
            return;
        }
    };

    loop {
        match control.recv_timeout(config.poll_interval) {
            Ok(HostControl::Reset) => {
                let keep_rate = running
                    .as_ref()
                    .map(|r| r.sample_rate)
                    .or(config.target_rate);
                running = None;
                match open_stream(&engine, &config, keep_rate, &events) {
                    Ok((stream, _)) => {
                        tracing::info!(rate_hz = stream.sample_rate, "audio output rebuilt");
                        shared_rate.store(stream.sample_rate, Ordering::Relaxed);
                        running = Some(stream);
                    }
                    Err(err) => {
                        tracing::warn!(error = %format!("{err:#}"), "audio output rebuild failed");
                        let _ = events.send(OutputEvent::StreamError(format!("{err:#}")));
                    }
                }
            }
            Ok(HostControl::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if !config.poll_sample_rate {
                    continue;
                }
                if let Some(stream) = running.as_mut() {
                    if let Some(event) = poll_default_rate(stream) {
                        let _ = events.send(event);
                    }
                }
            }
        }
    }
    tracing::debug!("audio output thread stopped");
}

fn poll_default_rate(stream: &mut RunningStream) -> Option<OutputEvent> {
    let current = default_output_rate(&stream.device)?;
    let change = rate_change(stream.baseline_default_rate, current)?;
    stream.baseline_default_rate = Some(current);
    tracing::warn!(from = change.0, to = change.1, "device sample rate changed");
    Some(OutputEvent::SampleRateChanged {
        from: change.0,
        to: change.1,
    })
}

fn rate_change(baseline: Option<u32>, current: u32) -> Option<(u32, u32)> {
    match baseline {
        Some(from) if from != current => Some((from, current)),
        _ => None,
    }
}

fn open_stream(
    engine: &Arc<Mutex<RenderEngine>>,
    config: &OutputConfig,
    target_rate: Option<u32>,
    events: &Sender<OutputEvent>,
) -> Result<(RunningStream, u16)> {
    let host = cpal::default_host();
    let device = pick_device(&host, config.device.as_deref())?;
    let supported = pick_output_config(&device, target_rate)?;
    let mut stream_config: cpal::StreamConfig = supported.clone().into();
    if let Some(buf) = pick_buffer_size(&supported) {
        stream_config.buffer_size = buf;
    }

    let stream = build_output_stream(
        &device,
        &stream_config,
        supported.sample_format(),
        engine.clone(),
        events.clone(),
    )?;
    stream.play().context("start output stream")?;

    let name = device_name(&device).unwrap_or_else(|| "unknown".to_string());
    tracing::info!(
        device = %name,
        rate_hz = stream_config.sample_rate,
        channels = stream_config.channels,
        format = ?supported.sample_format(),
        "audio output started"
    );
    let _ = events.send(OutputEvent::Started {
        device: name,
        sample_rate: stream_config.sample_rate,
        channels: stream_config.channels,
    });

    let baseline_default_rate = default_output_rate(&device);
    Ok((
        RunningStream {
            _stream: stream,
            device,
            sample_rate: stream_config.sample_rate,
            baseline_default_rate,
        },
        stream_config.channels,
    ))
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    engine: Arc<Mutex<RenderEngine>>,
    events: Sender<OutputEvent>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, engine, events),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, engine, events),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, engine, events),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, engine, events),
        other => Err(anyhow!("unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    engine: Arc<Mutex<RenderEngine>>,
    events: Sender<OutputEvent>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;
    let status = engine
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .status()
        .clone();
    let initial_frames = match config.buffer_size {
        cpal::BufferSize::Fixed(n) => n as usize,
        cpal::BufferSize::Default => 8_192,
    };
    let mut scratch = vec![0.0f32; initial_frames * channels.max(1)];

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            if scratch.len() < data.len() {
                // Only when the backend grows its buffer beyond what was negotiated.
                scratch.resize(data.len(), 0.0);
            }
            let buf = &mut scratch[..data.len()];
            match engine.try_lock() {
                Ok(mut engine) => engine.render(buf, channels),
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().render(buf, channels),
                Err(TryLockError::WouldBlock) => {
                    buf.fill(0.0);
                    status.add_underrun((data.len() / channels.max(1)) as u64);
                }
            }
            for (dst, src) in data.iter_mut().zip(buf.iter()) {
                *dst = <T as cpal::Sample>::from_sample::<f32>(*src);
            }
        },
        move |err| {
            tracing::warn!("output stream error: {err}");
            let _ = events.send(OutputEvent::StreamError(err.to_string()));
        },
        None,
    )?;
    Ok(stream)
}
