//! WAV decoding.

use crate::prelude::*;

/// Decodes a WAV file into per-channel f32 PCM. Supported encodings:
/// float32, int16, uint8 (plus 24/32-bit int for good measure).
pub fn decode_wav(bytes: &[u8]) -> AnyResult<(u32, Vec<Vec<f32>>)> {
  let reader = hound::WavReader::new(std::io::Cursor::new(bytes))
    .map_err(|e| TheErr::Audio(format!("WAV parse failed: {e}")))?;
  let spec = reader.spec();
  let channels = spec.channels.max(1) as usize;
  let mut data: Vec<Vec<f32>> = vec![Vec::new(); channels];

  match (spec.sample_format, spec.bits_per_sample) {
    (hound::SampleFormat::Float, 32) => {
      for (i, sample) in reader.into_samples::<f32>().enumerate() {
        let sample = sample.map_err(|e| TheErr::Audio(e.to_string()))?;
        data[i % channels].push(sample);
      }
    }
    (hound::SampleFormat::Int, 16) => {
      for (i, sample) in reader.into_samples::<i16>().enumerate() {
        let sample = sample.map_err(|e| TheErr::Audio(e.to_string()))?;
        data[i % channels].push(sample as f32 / 32768.0);
      }
    }
    (hound::SampleFormat::Int, 8) => {
      for (i, sample) in reader.into_samples::<i8>().enumerate() {
        let sample = sample.map_err(|e| TheErr::Audio(e.to_string()))?;
        data[i % channels].push(sample as f32 / 128.0);
      }
    }
    (hound::SampleFormat::Int, 24) | (hound::SampleFormat::Int, 32) => {
      let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
      for (i, sample) in reader.into_samples::<i32>().enumerate() {
        let sample = sample.map_err(|e| TheErr::Audio(e.to_string()))?;
        data[i % channels].push(sample as f32 / scale);
      }
    }
    (format, bits) => {
      anyhow::bail!(TheErr::Audio(format!(
        "unsupported WAV encoding: {format:?} {bits}-bit"
      )));
    }
  }

  Ok((spec.sample_rate, data))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn encode_wav(spec: hound::WavSpec, write: impl FnOnce(&mut hound::WavWriter<std::io::Cursor<&mut Vec<u8>>>)) -> Vec<u8> {
    let mut bytes = Vec::new();
    {
      let cursor = std::io::Cursor::new(&mut bytes);
      let mut writer = hound::WavWriter::new(cursor, spec).unwrap();
      write(&mut writer);
      writer.finalize().unwrap();
    }
    bytes
  }

  #[test]
  fn decode_float32() {
    let spec = hound::WavSpec {
      channels: 2,
      sample_rate: 44100,
      bits_per_sample: 32,
      sample_format: hound::SampleFormat::Float,
    };
    let samples = [0.0f32, 0.5, -0.5, 1.0];
    let bytes = encode_wav(spec, |w| {
      for s in samples {
        w.write_sample(s).unwrap();
      }
    });

    let (rate, channels) = decode_wav(&bytes).unwrap();
    assert_eq!(rate, 44100);
    assert_eq!(channels.len(), 2);
    assert_eq!(channels[0], vec![0.0, -0.5]);
    assert_eq!(channels[1], vec![0.5, 1.0]);
  }

  #[test]
  fn decode_int16() {
    let spec = hound::WavSpec {
      channels: 1,
      sample_rate: 22050,
      bits_per_sample: 16,
      sample_format: hound::SampleFormat::Int,
    };
    let bytes = encode_wav(spec, |w| {
      for s in [0i16, 16384, -16384, -32768] {
        w.write_sample(s).unwrap();
      }
    });

    let (rate, channels) = decode_wav(&bytes).unwrap();
    assert_eq!(rate, 22050);
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0], vec![0.0, 0.5, -0.5, -1.0]);
  }

  #[test]
  fn decode_uint8() {
    let spec = hound::WavSpec {
      channels: 1,
      sample_rate: 8000,
      bits_per_sample: 8,
      sample_format: hound::SampleFormat::Int,
    };
    let bytes = encode_wav(spec, |w| {
      for s in [0i8, 64, -64] {
        w.write_sample(s).unwrap();
      }
    });

    let (rate, channels) = decode_wav(&bytes).unwrap();
    assert_eq!(rate, 8000);
    assert_eq!(channels[0], vec![0.0, 0.5, -0.5]);
  }

  #[test]
  fn reject_garbage() {
    assert!(decode_wav(b"definitely not a wav").is_err());
  }
}
