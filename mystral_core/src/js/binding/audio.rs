//! Audio natives and the host-side registry pairing script wrappers with
//! mixer resources.

use crate::audio::{ActiveSource, AudioContext, PcmData};
use crate::js::binding::{arg_f64, arg_string, runtime_state, unwrap_handle, wrap_handle};
use crate::js::engine::{CallArgs, Scope, Value};
use crate::prelude::*;

use std::sync::Arc;

/// Channel data storage: writable until first playback, then frozen and
/// shared with the mixer by reference.
enum BufferData {
  Building(Vec<Vec<f32>>),
  Frozen(PcmData),
}

pub struct AudioBufferHandle {
  pub sample_rate: u32,
  pub channels: usize,
  pub frames: usize,
  data: BufferData,
}

impl AudioBufferHandle {
  fn building(channels: usize, frames: usize, sample_rate: u32) -> Self {
    AudioBufferHandle {
      sample_rate,
      channels,
      frames,
      data: BufferData::Building(vec![vec![0.0; frames]; channels]),
    }
  }

  fn frozen(sample_rate: u32, data: Vec<Vec<f32>>) -> Self {
    let channels = data.len();
    let frames = data.first().map(|c| c.len()).unwrap_or(0);
    AudioBufferHandle {
      sample_rate,
      channels,
      frames,
      data: BufferData::Frozen(Arc::new(data)),
    }
  }

  fn freeze(&mut self) -> PcmData {
    match &mut self.data {
      BufferData::Frozen(data) => data.clone(),
      BufferData::Building(channels) => {
        let data = Arc::new(std::mem::take(channels));
        self.data = BufferData::Frozen(data.clone());
        data
      }
    }
  }

  fn write_channel(&mut self, channel: usize, samples: &[f32]) -> Result<(), String> {
    match &mut self.data {
      BufferData::Frozen(_) => Err("buffer contents are frozen once playback starts".to_string()),
      BufferData::Building(channels) => {
        let target = channels
          .get_mut(channel)
          .ok_or_else(|| format!("no channel {channel}"))?;
        let n = samples.len().min(target.len());
        target[..n].copy_from_slice(&samples[..n]);
        Ok(())
      }
    }
  }

  fn channel_copy(&self, channel: usize) -> Result<Vec<f32>, String> {
    match &self.data {
      BufferData::Frozen(data) => data
        .get(channel)
        .cloned()
        .ok_or_else(|| format!("no channel {channel}")),
      BufferData::Building(channels) => channels
        .get(channel)
        .cloned()
        .ok_or_else(|| format!("no channel {channel}")),
    }
  }
}

/// Pre-start source configuration, main-thread only.
pub struct SourceConfig {
  pub context: u64,
  pub buffer: Option<u64>,
  pub looping: bool,
  pub loop_start: f64,
  pub loop_end: f64,
  pub gain_chain: Vec<u64>,
  pub started: bool,
}

/// Host-side audio object registry. Ids are attached to script wrappers
/// as private data.
pub struct AudioRegistry {
  pub contexts: HashMap<u64, AudioContext>,
  buffers: HashMap<u64, AudioBufferHandle>,
  sources: HashMap<u64, SourceConfig>,
  next_id: u64,
}

impl AudioRegistry {
  pub fn new() -> Self {
    AudioRegistry {
      contexts: HashMap::new(),
      buffers: HashMap::new(),
      sources: HashMap::new(),
      next_id: 1,
    }
  }

  fn alloc_id(&mut self) -> u64 {
    let id = self.next_id;
    self.next_id += 1;
    id
  }

  pub fn close_all(&mut self) {
    for (_, context) in self.contexts.iter_mut() {
      context.close();
    }
    self.contexts.clear();
    self.buffers.clear();
    self.sources.clear();
  }
}

impl Default for AudioRegistry {
  fn default() -> Self {
    Self::new()
  }
}

fn handle_arg(scope: &mut Scope, args: &CallArgs, index: usize) -> Result<u64, String> {
  let value = args
    .get(index)
    .ok_or_else(|| format!("missing argument {index}"))?;
  let value = value.clone();
  unwrap_handle(scope, &value).ok_or_else(|| format!("argument {index} is not a native handle"))
}

/// `audioNewContext() -> handle`. Device failures leave the context
/// suspended; they never throw.
pub fn new_context(scope: &mut Scope, _args: &CallArgs) -> Result<Value, String> {
  let state = runtime_state(scope);
  let mut context = AudioContext::new();
  if context.device_error.is_none() {
    context.resume();
  }

  let id = {
    let mut state = state.borrow_mut();
    let id = state.audio.alloc_id();
    state.audio.contexts.insert(id, context);
    id
  };
  Ok(wrap_handle(scope, id))
}

/// `audioContextInfo(handle) -> {currentTime, sampleRate, state}`
pub fn context_info(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let id = handle_arg(scope, args, 0)?;
  let state = runtime_state(scope);

  let (current_time, sample_rate, state_name) = {
    let state = state.borrow();
    let context = state.audio.contexts.get(&id).ok_or("unknown audio context")?;
    (
      context.shared.current_time(),
      context.shared.sample_rate,
      context.shared.state_name(),
    )
  };

  let info = scope.create_object();
  let value = scope.number(current_time);
  scope.set(&info, "currentTime", &value);
  let value = scope.number(sample_rate as f64);
  scope.set(&info, "sampleRate", &value);
  let value = scope.string(state_name);
  scope.set(&info, "state", &value);
  Ok(info)
}

pub fn context_resume(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let id = handle_arg(scope, args, 0)?;
  let state = runtime_state(scope);
  if let Some(context) = state.borrow().audio.contexts.get(&id) {
    context.resume();
  }
  Ok(scope.undefined())
}

pub fn context_suspend(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let id = handle_arg(scope, args, 0)?;
  let state = runtime_state(scope);
  if let Some(context) = state.borrow().audio.contexts.get(&id) {
    context.suspend();
  }
  Ok(scope.undefined())
}

pub fn context_close(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let id = handle_arg(scope, args, 0)?;
  let state = runtime_state(scope);
  if let Some(context) = state.borrow_mut().audio.contexts.get_mut(&id) {
    context.close();
  }
  Ok(scope.undefined())
}

/// `audioCreateBuffer(ctx, channels, frames, rate) -> handle`
pub fn create_buffer(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let _context = handle_arg(scope, args, 0)?;
  let channels = arg_f64(scope, args, 1)?.max(1.0) as usize;
  let frames = arg_f64(scope, args, 2)?.max(0.0) as usize;
  let rate = arg_f64(scope, args, 3)?.max(1.0) as u32;

  let state = runtime_state(scope);
  let id = {
    let mut state = state.borrow_mut();
    let id = state.audio.alloc_id();
    state
      .audio
      .buffers
      .insert(id, AudioBufferHandle::building(channels, frames, rate));
    id
  };
  Ok(wrap_handle(scope, id))
}

/// `audioDecode(ctx, bytes) -> handle | null`. Decode failures return
/// null, they never throw.
pub fn decode(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let _context = handle_arg(scope, args, 0)?;
  let bytes = args
    .get(1)
    .cloned()
    .and_then(|v| scope.typed_array_bytes(&v))
    .ok_or("audioDecode: bytes required")?;

  match crate::audio::wav::decode_wav(&bytes) {
    Ok((rate, data)) => {
      let state = runtime_state(scope);
      let id = {
        let mut state = state.borrow_mut();
        let id = state.audio.alloc_id();
        state
          .audio
          .buffers
          .insert(id, AudioBufferHandle::frozen(rate, data));
        id
      };
      Ok(wrap_handle(scope, id))
    }
    Err(e) => {
      warn!("decodeAudioData failed: {e}");
      Ok(scope.null())
    }
  }
}

pub fn buffer_info(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let id = handle_arg(scope, args, 0)?;
  let state = runtime_state(scope);

  let (rate, channels, frames) = {
    let state = state.borrow();
    let buffer = state.audio.buffers.get(&id).ok_or("unknown audio buffer")?;
    (buffer.sample_rate, buffer.channels, buffer.frames)
  };

  let info = scope.create_object();
  let value = scope.number(rate as f64);
  scope.set(&info, "sampleRate", &value);
  let value = scope.number(channels as f64);
  scope.set(&info, "numberOfChannels", &value);
  let value = scope.number(frames as f64);
  scope.set(&info, "length", &value);
  let value = scope.number(frames as f64 / rate as f64);
  scope.set(&info, "duration", &value);
  Ok(info)
}

pub fn copy_to_channel(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let id = handle_arg(scope, args, 0)?;
  let channel = arg_f64(scope, args, 1)? as usize;
  let samples = args
    .get(2)
    .cloned()
    .and_then(|v| scope.read_float32_array(&v))
    .ok_or("copyToChannel: Float32Array required")?;

  let state = runtime_state(scope);
  let mut state = state.borrow_mut();
  let buffer = state
    .audio
    .buffers
    .get_mut(&id)
    .ok_or("unknown audio buffer")?;
  buffer.write_channel(channel, &samples)?;
  Ok(scope.undefined())
}

pub fn get_channel_data(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let id = handle_arg(scope, args, 0)?;
  let channel = arg_f64(scope, args, 1)? as usize;

  let state = runtime_state(scope);
  let samples = {
    let state = state.borrow();
    let buffer = state.audio.buffers.get(&id).ok_or("unknown audio buffer")?;
    buffer.channel_copy(channel)?
  };
  Ok(scope.create_float32_array(&samples))
}

/// `audioNewSource(ctx) -> handle`
pub fn new_source(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let context = handle_arg(scope, args, 0)?;
  let state = runtime_state(scope);
  let id = {
    let mut state = state.borrow_mut();
    let id = state.audio.alloc_id();
    state.audio.sources.insert(
      id,
      SourceConfig {
        context,
        buffer: None,
        looping: false,
        loop_start: 0.0,
        loop_end: 0.0,
        gain_chain: Vec::new(),
        started: false,
      },
    );
    id
  };
  Ok(wrap_handle(scope, id))
}

/// `audioSourceConfig(source, key, value)` for loop/loopStart/loopEnd.
pub fn source_config(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let id = handle_arg(scope, args, 0)?;
  let key = arg_string(scope, args, 1)?;
  let value = arg_f64(scope, args, 2)?;

  let state = runtime_state(scope);
  let mut state = state.borrow_mut();
  let source = state.audio.sources.get_mut(&id).ok_or("unknown source")?;
  match key.as_str() {
    "loop" => source.looping = value != 0.0,
    "loopStart" => source.loop_start = value,
    "loopEnd" => source.loop_end = value,
    other => return Err(format!("unknown source option {other:?}")),
  }
  Ok(scope.undefined())
}

pub fn source_set_buffer(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let id = handle_arg(scope, args, 0)?;
  let buffer = handle_arg(scope, args, 1)?;

  let state = runtime_state(scope);
  let mut state = state.borrow_mut();
  let source = state.audio.sources.get_mut(&id).ok_or("unknown source")?;
  source.buffer = Some(buffer);
  Ok(scope.undefined())
}

/// `audioSourceSetGains(source, [gainHandle…])` — the gain chain between
/// this source and the destination.
pub fn source_set_gains(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let id = handle_arg(scope, args, 0)?;
  let list = args.get(1).cloned().ok_or("gain list required")?;

  let mut chain = Vec::new();
  if let Some(len) = scope.array_length(&list) {
    for i in 0..len {
      if let Some(item) = scope.get_index(&list, i) {
        if let Some(gain) = unwrap_handle(scope, &item) {
          chain.push(gain);
        }
      }
    }
  }

  let state = runtime_state(scope);
  let mut state = state.borrow_mut();
  let source = state.audio.sources.get_mut(&id).ok_or("unknown source")?;
  source.gain_chain = chain;
  Ok(scope.undefined())
}

/// `audioSourceStart(source, when, offset, duration, onended?)`
pub fn source_start(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let id = handle_arg(scope, args, 0)?;
  let when = arg_f64(scope, args, 1).unwrap_or(0.0);
  let offset = arg_f64(scope, args, 2).unwrap_or(0.0);
  let duration = arg_f64(scope, args, 3).ok().filter(|d| *d > 0.0);
  let onended = args.get(4).cloned().filter(|v| scope.is_function(v));

  let protected = onended.map(|cb| scope.protect(&cb));
  let state = runtime_state(scope);
  let mut state = state.borrow_mut();

  let config = state.audio.sources.get_mut(&id).ok_or("unknown source")?;
  if config.started {
    return Err("source already started".to_string());
  }
  config.started = true;
  let context_id = config.context;
  let buffer_id = config.buffer.ok_or("source has no buffer")?;
  let looping = config.looping;
  let loop_start = config.loop_start;
  let loop_end = config.loop_end;
  let gain_chain = config.gain_chain.clone();

  let buffer = state
    .audio
    .buffers
    .get_mut(&buffer_id)
    .ok_or("unknown audio buffer")?;
  let buffer_rate = buffer.sample_rate;
  let data = buffer.freeze();

  let context = state
    .audio
    .contexts
    .get(&context_id)
    .ok_or("unknown audio context")?;
  let now = context.shared.current_time();

  context.add_source(ActiveSource {
    id,
    data,
    buffer_rate,
    gain_chain,
    looping,
    loop_start,
    loop_end,
    start_time: when.max(now),
    stop_time: None,
    duration,
    cursor: (offset.max(0.0) * buffer_rate as f64).floor(),
    played: 0,
    playing: true,
  });

  if let Some(protected) = protected {
    state.audio_ended.insert(id, protected);
  }
  Ok(scope.undefined())
}

/// `audioSourceStop(source, when)`
pub fn source_stop(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let id = handle_arg(scope, args, 0)?;
  let when = arg_f64(scope, args, 1).unwrap_or(0.0);

  let state = runtime_state(scope);
  let state = state.borrow();
  let source = state.audio.sources.get(&id).ok_or("unknown source")?;
  if let Some(context) = state.audio.contexts.get(&source.context) {
    let now = context.shared.current_time();
    context.stop_source(id, when.max(now));
  }
  Ok(scope.undefined())
}

/// `audioGainCreate(ctx) -> handle`, initial value 1.0.
pub fn gain_create(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let context_id = handle_arg(scope, args, 0)?;
  let state = runtime_state(scope);
  let id = {
    let mut state = state.borrow_mut();
    let id = state.audio.alloc_id();
    if let Some(context) = state.audio.contexts.get(&context_id) {
      context.set_gain(id, 1.0);
    }
    id
  };
  Ok(wrap_handle(scope, id))
}

/// `audioGainSet(ctx, gain, value)` — applies live, the mixer reads the
/// value each block.
pub fn gain_set(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let context_id = handle_arg(scope, args, 0)?;
  let gain_id = handle_arg(scope, args, 1)?;
  let value = arg_f64(scope, args, 2)?;

  let state = runtime_state(scope);
  let state = state.borrow();
  if let Some(context) = state.audio.contexts.get(&context_id) {
    context.set_gain(gain_id, value as f32);
  }
  Ok(scope.undefined())
}
