use crate::audio::*;

use std::sync::atomic::Ordering;
use std::sync::Arc;

fn source_from(data: Vec<Vec<f32>>, rate: u32, id: u64) -> ActiveSource {
  ActiveSource {
    id,
    data: Arc::new(data),
    buffer_rate: rate,
    gain_chain: Vec::new(),
    looping: false,
    loop_start: 0.0,
    loop_end: 0.0,
    start_time: 0.0,
    stop_time: None,
    duration: None,
    cursor: 0.0,
    played: 0,
    playing: true,
  }
}

#[test]
fn unit_gain_mix_is_bit_identical() {
  let context = AudioContext::offline(8);
  context.resume();

  let samples = vec![0.1f32, -0.2, 0.3, -0.4, 0.5, -0.6, 0.7, -0.8];
  context.add_source(source_from(vec![samples.clone()], 8, 1));

  let mut output = vec![0.0f32; 16];
  mix_block(&context.shared, &mut output);

  for (i, expected) in samples.iter().enumerate() {
    assert_eq!(output[i * 2], *expected, "left frame {i}");
    assert_eq!(output[i * 2 + 1], *expected, "right frame {i}");
  }
}

#[test]
fn gain_applies_linearly() {
  let context = AudioContext::offline(4);
  context.resume();
  context.set_gain(7, 0.5);

  let mut source = source_from(vec![vec![1.0f32, 1.0, 1.0, 1.0]], 4, 1);
  source.gain_chain = vec![7];
  context.add_source(source);

  let mut output = vec![0.0f32; 8];
  mix_block(&context.shared, &mut output);
  assert!(output.iter().all(|s| (*s - 0.5).abs() < f32::EPSILON));
}

#[test]
fn output_is_clamped() {
  let context = AudioContext::offline(4);
  context.resume();

  context.add_source(source_from(vec![vec![1.0f32; 4]], 4, 1));
  context.add_source(source_from(vec![vec![1.0f32; 4]], 4, 2));

  let mut output = vec![0.0f32; 8];
  mix_block(&context.shared, &mut output);
  assert!(output.iter().all(|s| *s <= 1.0));
}

#[test]
fn ended_sources_are_collected() {
  let context = AudioContext::offline(4);
  context.resume();

  context.add_source(source_from(vec![vec![0.5f32, 0.5]], 4, 42));

  // Two frames of data, four frames mixed: the source ends mid-block.
  let mut output = vec![0.0f32; 8];
  mix_block(&context.shared, &mut output);

  assert_eq!(context.take_ended(), vec![42]);
  assert!(context.take_ended().is_empty());
  assert_eq!(output[0], 0.5);
  assert_eq!(output[4], 0.0);
}

#[test]
fn looping_wraps_to_loop_start() {
  let context = AudioContext::offline(4);
  context.resume();

  let mut source = source_from(vec![vec![0.1f32, 0.2]], 4, 1);
  source.looping = true;
  context.add_source(source);

  let mut output = vec![0.0f32; 8];
  mix_block(&context.shared, &mut output);

  assert_eq!(output[0], 0.1);
  assert_eq!(output[2], 0.2);
  assert_eq!(output[4], 0.1);
  assert_eq!(output[6], 0.2);
  assert!(context.take_ended().is_empty());
}

#[test]
fn scheduled_start_is_sample_accurate() {
  let context = AudioContext::offline(4);
  context.resume();

  // Start half a second in: two frames of silence at 4 Hz.
  let mut source = source_from(vec![vec![0.9f32, 0.9]], 4, 1);
  source.start_time = 0.5;
  context.add_source(source);

  let mut output = vec![0.0f32; 8];
  mix_block(&context.shared, &mut output);

  assert_eq!(output[0], 0.0);
  assert_eq!(output[2], 0.0);
  assert_eq!(output[4], 0.9);
  assert_eq!(output[6], 0.9);
}

#[test]
fn suspended_context_stays_silent() {
  let context = AudioContext::offline(4);
  context.add_source(source_from(vec![vec![1.0f32; 4]], 4, 1));

  let mut output = vec![1.0f32; 8];
  mix_block(&context.shared, &mut output);

  assert!(output.iter().all(|s| *s == 0.0));
  assert_eq!(context.shared.sample_clock.load(Ordering::Relaxed), 0);
}

#[test]
fn closed_context_stays_silent_and_stops_clock() {
  let mut context = AudioContext::offline(4);
  context.resume();
  context.close();

  let mut output = vec![1.0f32; 8];
  mix_block(&context.shared, &mut output);
  assert!(output.iter().all(|s| *s == 0.0));
  assert_eq!(context.shared.sample_clock.load(Ordering::Relaxed), 0);
}

#[test]
fn current_time_advances_with_samples() {
  let context = AudioContext::offline(8);
  context.resume();

  let mut output = vec![0.0f32; 16];
  mix_block(&context.shared, &mut output);
  assert!((context.shared.current_time() - 1.0).abs() < 1e-9);

  mix_block(&context.shared, &mut output);
  assert!((context.shared.current_time() - 2.0).abs() < 1e-9);
}

#[test]
fn stop_time_is_honored() {
  let context = AudioContext::offline(4);
  context.resume();

  let mut source = source_from(vec![vec![0.4f32; 4]], 4, 9);
  source.stop_time = Some(0.5);
  context.add_source(source);

  let mut output = vec![0.0f32; 8];
  mix_block(&context.shared, &mut output);

  assert_eq!(output[0], 0.4);
  assert_eq!(output[2], 0.4);
  assert_eq!(output[4], 0.0);
  assert_eq!(context.take_ended(), vec![9]);
}
