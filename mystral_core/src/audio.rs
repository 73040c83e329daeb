//! Audio engine.
//!
//! A minimal audio graph ({context, destination, buffer-source, gain})
//! mixed by a real-time OS callback at the context sample rate, stereo
//! f32. The callback is held to a strict discipline: it zeroes the output,
//! takes exactly one lock (the sources mutex), never allocates beyond the
//! pre-reserved ended list, and never calls into the script engine. Ended
//! sources are collected under the same mutex and their completion
//! callbacks fire later on the main thread.

pub mod wav;

use crate::prelude::*;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Context lifecycle. Closed is terminal; the callback checks it at entry
/// and writes silence only.
pub const STATE_SUSPENDED: u8 = 0;
pub const STATE_RUNNING: u8 = 1;
pub const STATE_CLOSED: u8 = 2;

/// Immutable-after-freeze PCM storage shared between the script wrapper
/// and the mixer.
pub type PcmData = Arc<Vec<Vec<f32>>>;

/// A playing (or scheduled) buffer source inside the mixer.
pub struct ActiveSource {
  pub id: u64,
  pub data: PcmData,
  pub buffer_rate: u32,
  /// Gain node ids whose values multiply this source's samples.
  pub gain_chain: Vec<u64>,
  pub looping: bool,
  pub loop_start: f64,
  pub loop_end: f64,
  /// Context-time seconds.
  pub start_time: f64,
  pub stop_time: Option<f64>,
  /// Playback limit in seconds from the first mixed frame.
  pub duration: Option<f64>,
  /// Read cursor in buffer frames.
  pub cursor: f64,
  /// Frames this source has contributed.
  pub played: u64,
  pub playing: bool,
}

/// Everything the real-time callback touches, under one mutex.
pub struct SourceList {
  pub sources: Vec<ActiveSource>,
  /// Gain node values, looked up by id at mix time so `gain.value` writes
  /// apply live.
  pub gains: HashMap<u64, f32>,
  /// Sources that ended this block; drained by the main thread.
  pub ended: Vec<u64>,
}

/// State shared with the audio thread.
pub struct ContextShared {
  pub sample_rate: u32,
  /// Frames rendered since the context started running.
  pub sample_clock: AtomicU64,
  pub state: AtomicU8,
  pub sources: Mutex<SourceList>,
}

impl ContextShared {
  pub fn new(sample_rate: u32) -> Self {
    ContextShared {
      sample_rate,
      sample_clock: AtomicU64::new(0),
      state: AtomicU8::new(STATE_SUSPENDED),
      sources: Mutex::new(SourceList {
        sources: Vec::with_capacity(64),
        gains: HashMap::new(),
        ended: Vec::with_capacity(64),
      }),
    }
  }

  pub fn current_time(&self) -> f64 {
    self.sample_clock.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
  }

  pub fn state_name(&self) -> &'static str {
    match self.state.load(Ordering::Relaxed) {
      STATE_RUNNING => "running",
      STATE_CLOSED => "closed",
      _ => "suspended",
    }
  }
}

/// The real-time mix. `output` is interleaved stereo f32.
///
/// Kept free-standing so tests can drive it without an output device.
pub fn mix_block(shared: &ContextShared, output: &mut [f32]) {
  for sample in output.iter_mut() {
    *sample = 0.0;
  }

  match shared.state.load(Ordering::Acquire) {
    STATE_RUNNING => {}
    // Closed or suspended: silence, no clock progress.
    _ => return,
  }

  let frames = output.len() / 2;
  let rate = shared.sample_rate as f64;
  let clock = shared.sample_clock.load(Ordering::Relaxed);

  {
    let mut list = shared.sources.lock();
    let list = &mut *list;

    for source in list.sources.iter_mut() {
      let mut gain = 1.0f32;
      for id in source.gain_chain.iter() {
        gain *= list.gains.get(id).copied().unwrap_or(1.0);
      }

      let channel_count = source.data.len();
      if channel_count == 0 || source.data[0].is_empty() {
        source.playing = false;
        continue;
      }
      let buffer_frames = source.data[0].len();
      let step = source.buffer_rate as f64 / rate;
      let loop_start_frame = (source.loop_start * source.buffer_rate as f64).max(0.0);
      let loop_end_frame = if source.loop_end > 0.0 {
        (source.loop_end * source.buffer_rate as f64).min(buffer_frames as f64)
      } else {
        buffer_frames as f64
      };

      for i in 0..frames {
        let t = (clock + i as u64) as f64 / rate;
        if t < source.start_time {
          continue;
        }
        if let Some(stop) = source.stop_time {
          if t >= stop {
            source.playing = false;
            break;
          }
        }
        if let Some(duration) = source.duration {
          if source.played as f64 / rate >= duration {
            source.playing = false;
            break;
          }
        }

        if source.cursor >= loop_end_frame || source.cursor >= buffer_frames as f64 {
          if source.looping {
            source.cursor = loop_start_frame;
          } else {
            source.playing = false;
            break;
          }
        }

        let index = source.cursor as usize;
        let left = source.data[0][index.min(buffer_frames - 1)];
        let right = source.data[channel_count.min(2) - 1][index.min(buffer_frames - 1)];

        output[i * 2] += left * gain;
        output[i * 2 + 1] += right * gain;

        source.cursor += step;
        source.played += 1;
      }
    }

    // Collect and drop ended sources; completion dispatch happens on the
    // main thread.
    let ended = &mut list.ended;
    list.sources.retain(|source| {
      if source.playing {
        true
      } else {
        ended.push(source.id);
        false
      }
    });
  }

  for sample in output.iter_mut() {
    *sample = sample.clamp(-1.0, 1.0);
  }

  shared
    .sample_clock
    .fetch_add(frames as u64, Ordering::AcqRel);
}

/// One audio context: shared mixer state plus the output stream driving it.
pub struct AudioContext {
  pub shared: Arc<ContextShared>,
  stream: Option<cpal::Stream>,
  /// Why the output stream could not be opened, if it could not.
  pub device_error: Option<String>,
}

impl AudioContext {
  /// Opens the default output device. On any failure the context is
  /// created suspended with no stream; audio errors never crash.
  pub fn new() -> Self {
    match Self::open_stream() {
      Ok((shared, stream)) => AudioContext {
        shared,
        stream: Some(stream),
        device_error: None,
      },
      Err(e) => {
        warn!("Audio device unavailable: {e}");
        AudioContext {
          shared: Arc::new(ContextShared::new(44100)),
          stream: None,
          device_error: Some(e.to_string()),
        }
      }
    }
  }

  fn open_stream() -> AnyResult<(Arc<ContextShared>, cpal::Stream)> {
    let host = cpal::default_host();
    let device = host
      .default_output_device()
      .ok_or_else(|| TheErr::Audio("no output device".into()))?;
    let config = device
      .default_output_config()
      .map_err(|e| TheErr::Audio(e.to_string()))?;

    if config.sample_format() != cpal::SampleFormat::F32 {
      anyhow::bail!(TheErr::Audio(format!(
        "unsupported output sample format {:?}",
        config.sample_format()
      )));
    }
    if config.channels() != 2 {
      anyhow::bail!(TheErr::Audio(format!(
        "expected stereo output, device has {} channels",
        config.channels()
      )));
    }

    let shared = Arc::new(ContextShared::new(config.sample_rate().0));
    let mixer = shared.clone();

    let stream = device
      .build_output_stream(
        &config.into(),
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
          mix_block(&mixer, data);
        },
        move |e| {
          error!("Audio stream error: {e}");
        },
        None,
      )
      .map_err(|e| TheErr::Audio(e.to_string()))?;
    stream.play().map_err(|e| TheErr::Audio(e.to_string()))?;

    Ok((shared, stream))
  }

  /// Offline context for tests and headless mixing; no device involved.
  pub fn offline(sample_rate: u32) -> Self {
    AudioContext {
      shared: Arc::new(ContextShared::new(sample_rate)),
      stream: None,
      device_error: None,
    }
  }

  pub fn resume(&self) {
    if self.shared.state.load(Ordering::Relaxed) != STATE_CLOSED {
      self.shared.state.store(STATE_RUNNING, Ordering::Release);
    }
  }

  pub fn suspend(&self) {
    if self.shared.state.load(Ordering::Relaxed) != STATE_CLOSED {
      self.shared.state.store(STATE_SUSPENDED, Ordering::Release);
    }
  }

  /// Terminal: the callback sees the flag at entry and writes silence.
  pub fn close(&mut self) {
    self.shared.state.store(STATE_CLOSED, Ordering::Release);
    if let Some(stream) = self.stream.take() {
      drop(stream);
    }
  }

  /// Registers a source with the mixer.
  pub fn add_source(&self, source: ActiveSource) {
    self.shared.sources.lock().sources.push(source);
  }

  /// Schedules a stop for a playing source.
  pub fn stop_source(&self, id: u64, when: f64) {
    let mut list = self.shared.sources.lock();
    if let Some(source) = list.sources.iter_mut().find(|s| s.id == id) {
      source.stop_time = Some(when.max(0.0));
    }
  }

  pub fn set_gain(&self, id: u64, value: f32) {
    self.shared.sources.lock().gains.insert(id, value);
  }

  pub fn remove_gain(&self, id: u64) {
    self.shared.sources.lock().gains.remove(&id);
  }

  /// Drains sources that finished since the last call.
  pub fn take_ended(&self) -> Vec<u64> {
    std::mem::take(&mut self.shared.sources.lock().ended)
  }
}

impl Default for AudioContext {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod audio_tests;
