//! Audio capture and playback at the link's fixed format
//!
//! The stream carries 8 kHz mono 8-bit unsigned PCM. The rest of the crate
//! treats audio strictly as an opaque byte source/sink, so everything here
//! stays behind a channel (capture) or the [`PlaybackSink`] trait (playback)
//! and headless setups can swap in [`ChannelSink`].

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::constants::{CAPTURE_CHANNEL_CAPACITY, SAMPLE_RATE};
use crate::error::AudioError;

/// Destination for received audio chunks
pub trait PlaybackSink {
    /// Append one opaque chunk to the playback buffer, in arrival order
    fn write(&mut self, chunk: &[u8]);
}

/// Sink that hands chunks to a channel; used headless and in tests
pub struct ChannelSink {
    tx: Sender<Vec<u8>>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = bounded(CAPTURE_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }
}

impl PlaybackSink for ChannelSink {
    fn write(&mut self, chunk: &[u8]) {
        if self.tx.try_send(chunk.to_vec()).is_err() {
            tracing::warn!("Playback channel full, dropping {} bytes", chunk.len());
        }
    }
}

/// Capture from the default input device, delivering raw u8 PCM chunks.
///
/// The cpal stream lives on its own thread (cpal streams are not `Send`);
/// captured chunks flow out through a bounded channel.
pub struct CaptureSource {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    frames: Receiver<Vec<u8>>,
}

impl CaptureSource {
    pub fn start() -> Result<Self, AudioError> {
        let (frame_tx, frame_rx) = bounded::<Vec<u8>>(CAPTURE_CHANNEL_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();

        let handle = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                if let Err(e) = run_capture(frame_tx, running_for_loop) {
                    tracing::error!("Capture thread failed: {}", e);
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Self {
            running,
            thread_handle: Some(handle),
            frames: frame_rx,
        })
    }

    /// Channel the captured chunks arrive on
    pub fn frames(&self) -> Receiver<Vec<u8>> {
        self.frames.clone()
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture(frame_tx: Sender<Vec<u8>>, running: Arc<AtomicBool>) -> Result<(), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceNotFound("no default input device".into()))?;

    let default_config = device
        .default_input_config()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_fn = |err| tracing::error!("Capture stream error: {}", err);

    // Prefer the link's native u8 format; otherwise capture f32 and rescale,
    // the cpal equivalent of taking the nearest supported format
    let stream = match default_config.sample_format() {
        cpal::SampleFormat::U8 => device
            .build_input_stream(
                &config,
                move |data: &[u8], _: &cpal::InputCallbackInfo| {
                    let _ = frame_tx.try_send(data.to_vec());
                },
                err_fn,
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))?,
        other => {
            tracing::warn!("Input format {:?} not u8, rescaling from f32", other);
            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let chunk: Vec<u8> = data
                            .iter()
                            .map(|&s| ((s.clamp(-1.0, 1.0) * 127.0) + 127.0) as u8)
                            .collect();
                        let _ = frame_tx.try_send(chunk);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| AudioError::StreamError(e.to_string()))?
        }
    };

    stream
        .play()
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    while running.load(Ordering::Relaxed) {
        thread::sleep(std::time::Duration::from_millis(50));
    }
    Ok(())
}

/// Playback through the default output device, fed from a lock-free queue.
/// Underruns play midpoint silence.
pub struct CpalPlayback {
    queue: Arc<ArrayQueue<u8>>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalPlayback {
    /// `capacity` is in samples; at 8 kHz, 16000 holds two seconds
    pub fn start(capacity: usize) -> Result<Self, AudioError> {
        let queue = Arc::new(ArrayQueue::new(capacity));
        let queue_for_stream = queue.clone();
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();

        let handle = thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || {
                if let Err(e) = run_playback(queue_for_stream, running_for_loop) {
                    tracing::error!("Playback thread failed: {}", e);
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Self {
            queue,
            running,
            thread_handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl PlaybackSink for CpalPlayback {
    fn write(&mut self, chunk: &[u8]) {
        for &sample in chunk {
            // On overflow, drop the oldest audio rather than the newest
            if self.queue.push(sample).is_err() {
                let _ = self.queue.pop();
                let _ = self.queue.push(sample);
            }
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_playback(queue: Arc<ArrayQueue<u8>>, running: Arc<AtomicBool>) -> Result<(), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::DeviceNotFound("no default output device".into()))?;

    let default_config = device
        .default_output_config()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_fn = |err| tracing::error!("Playback stream error: {}", err);

    let stream = match default_config.sample_format() {
        cpal::SampleFormat::U8 => device
            .build_output_stream(
                &config,
                move |data: &mut [u8], _: &cpal::OutputCallbackInfo| {
                    for slot in data.iter_mut() {
                        *slot = queue.pop().unwrap_or(127);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))?,
        other => {
            tracing::warn!("Output format {:?} not u8, rescaling to f32", other);
            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        for slot in data.iter_mut() {
                            let sample = queue.pop().unwrap_or(127);
                            *slot = (sample as f32 - 127.0) / 127.0;
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| AudioError::StreamError(e.to_string()))?
        }
    };

    stream
        .play()
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    while running.load(Ordering::Relaxed) {
        thread::sleep(std::time::Duration::from_millis(50));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_preserves_chunk_content_and_order() {
        let (mut sink, rx) = ChannelSink::new();
        sink.write(&[1, 2, 3]);
        sink.write(&[4]);

        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);
        assert_eq!(rx.try_recv().unwrap(), vec![4]);
        assert!(rx.try_recv().is_err());
    }
}
