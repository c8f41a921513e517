//! Raw PCM and WAV helpers.

use std::io::Cursor;

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::Result;

/// Convert little-endian PCM bytes of `sample_width` bytes per sample to
/// 16-bit samples. 32-bit input keeps its high 16 bits; a trailing partial
/// sample is ignored.
pub fn pcm_to_samples(bytes: &[u8], sample_width: u16) -> Vec<i16> {
    match sample_width {
        4 => bytes
            .chunks_exact(4)
            .map(|c| (i32::from_le_bytes([c[0], c[1], c[2], c[3]]) >> 16) as i16)
            .collect(),
        _ => bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect(),
    }
}

pub fn samples_to_pcm(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Root mean square level of a frame.
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Encode mono 16-bit samples as an in-memory WAV file.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use {super::*, hound::WavReader};

    #[test]
    fn pcm_conversion_is_little_endian() {
        let samples = [0i16, 1, -1, i16::MAX, i16::MIN];
        let bytes = samples_to_pcm(&samples);
        assert_eq!(&bytes[2..4], &[1, 0]);
        assert_eq!(pcm_to_samples(&bytes, 2), samples);
        // Odd trailing byte is dropped.
        assert_eq!(pcm_to_samples(&[1, 0, 7], 2), vec![1]);
    }

    #[test]
    fn pcm_32_bit_keeps_high_word() {
        let bytes = 0x1234_0000i32.to_le_bytes();
        assert_eq!(pcm_to_samples(&bytes, 4), vec![0x1234]);
    }

    #[test]
    fn rms_of_constant_signal() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[300, -300, 300, -300]) - 300.0).abs() < f64::EPSILON);
    }

    #[test]
    fn wav_has_expected_header() {
        let samples: Vec<i16> = (0..1600).map(|i| (i % 100) as i16).collect();
        let wav = encode_wav(&samples, 16_000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        let reader = WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len() as usize, samples.len());
    }
}
