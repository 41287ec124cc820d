//! Sample format conversions between hardware floats, wire PCM16, and the
//! text-safe transport encoding.
//!
//! All functions here are pure; the capture and playback pipelines call
//! them outside their real-time callbacks.

use crate::error::{Result, TutorlinkError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Convert normalized f32 samples to PCM16.
///
/// Each sample is clamped to [-1.0, 1.0] before scaling so out-of-range
/// input cannot overflow, and scaled values are rounded to the nearest
/// integer rather than truncated.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i16)
        .collect()
}

/// Convert PCM16 samples to normalized f32 in [-1.0, 1.0).
pub fn pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Serialize PCM16 samples to little-endian bytes for the wire.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Parse little-endian bytes as PCM16 samples.
///
/// # Errors
/// Returns `TutorlinkError::Decode` when the byte count is odd.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(TutorlinkError::Decode {
            message: format!("PCM16 payload has odd length {}", bytes.len()),
        });
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Encode raw bytes into the text-safe transport form (standard base64).
pub fn encode_transport(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode the text-safe transport form back into raw bytes.
///
/// # Errors
/// Returns `TutorlinkError::Decode` for malformed base64.
pub fn decode_transport(text: &str) -> Result<Vec<u8>> {
    BASE64.decode(text).map_err(TutorlinkError::decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_to_pcm16_full_scale() {
        let samples = vec![0.0f32, 1.0, -1.0];
        let pcm = float_to_pcm16(&samples);
        assert_eq!(pcm, vec![0i16, 32767, -32767]);
    }

    #[test]
    fn test_float_to_pcm16_clamps_out_of_range() {
        let samples = vec![2.0f32, -3.5];
        let pcm = float_to_pcm16(&samples);
        assert_eq!(pcm, vec![32767i16, -32767]);
    }

    #[test]
    fn test_float_to_pcm16_rounds_to_nearest() {
        // 0.5 * 32767 = 16383.5 — rounds to 16384, not truncates to 16383
        let pcm = float_to_pcm16(&[0.5f32]);
        assert_eq!(pcm, vec![16384i16]);
    }

    #[test]
    fn test_pcm16_to_float_range() {
        let floats = pcm16_to_float(&[i16::MIN, 0, i16::MAX]);
        assert_eq!(floats[0], -1.0);
        assert_eq!(floats[1], 0.0);
        assert!(floats[2] < 1.0 && floats[2] > 0.999);
    }

    #[test]
    fn test_roundtrip_within_one_quantization_step() {
        let samples: Vec<f32> = (0..1000)
            .map(|i| ((i as f32) * 0.013).sin() * 0.9)
            .collect();
        let recovered = pcm16_to_float(&float_to_pcm16(&samples));
        for (orig, back) in samples.iter().zip(recovered.iter()) {
            assert!(
                (orig - back).abs() <= 1.0 / 32768.0,
                "sample drifted by more than one quantization step: {} vs {}",
                orig,
                back
            );
        }
    }

    #[test]
    fn test_pcm16_bytes_little_endian() {
        let bytes = pcm16_to_bytes(&[0x0102i16, -2]);
        assert_eq!(bytes, vec![0x02, 0x01, 0xFE, 0xFF]);
    }

    #[test]
    fn test_bytes_to_pcm16_roundtrip() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN, 12345];
        let back = bytes_to_pcm16(&pcm16_to_bytes(&samples)).unwrap();
        assert_eq!(back, samples);
    }

    #[test]
    fn test_bytes_to_pcm16_odd_length_is_decode_error() {
        let result = bytes_to_pcm16(&[0x00, 0x01, 0x02]);
        match result {
            Err(TutorlinkError::Decode { message }) => {
                assert!(message.contains("odd length"));
            }
            other => panic!("Expected Decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_transport_roundtrip_byte_exact() {
        // Cover empty input and every alignment relative to the 3-byte
        // base64 grouping.
        for len in [0usize, 1, 2, 3, 4, 5, 100, 3200] {
            let bytes: Vec<u8> = (0..len).map(|i| (i * 37 % 256) as u8).collect();
            let encoded = encode_transport(&bytes);
            let decoded = decode_transport(&encoded).unwrap();
            assert_eq!(decoded, bytes, "roundtrip failed for length {}", len);
        }
    }

    #[test]
    fn test_decode_transport_rejects_garbage() {
        assert!(decode_transport("not base64 !!!").is_err());
    }

    #[test]
    fn test_capture_block_scenario() {
        // One 100ms capture block at 16kHz: 1600 mono samples → 3200 bytes
        // of PCM16 → base64 of ceil(3200/3)*4 characters → original bytes.
        let samples: Vec<f32> = (0..1600).map(|i| ((i as f32) * 0.02).sin()).collect();
        let pcm = float_to_pcm16(&samples);
        let bytes = pcm16_to_bytes(&pcm);
        assert_eq!(bytes.len(), 3200);

        let encoded = encode_transport(&bytes);
        assert_eq!(encoded.len(), 3200_usize.div_ceil(3) * 4);

        let decoded = decode_transport(&encoded).unwrap();
        assert_eq!(decoded, bytes);
    }
}
