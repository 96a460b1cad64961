//! On-disk encodings: planar f32 little-endian samples and reversible field masking.

use base64::{Engine as _, engine::general_purpose};

use crate::error::StoreError;

const MASK: &[u8] = b"stream-player/chunk-store";

/// Concatenate channels as little-endian `f32`.
pub(crate) fn encode_planar(channels: &[Vec<f32>]) -> Vec<u8> {
    let total: usize = channels.iter().map(|c| c.len() * 4).sum();
    let mut out = Vec::with_capacity(total);
    for channel in channels {
        for sample in channel {
            out.extend_from_slice(&sample.to_le_bytes());
        }
    }
    out
}

pub(crate) fn decode_planar(
    bytes: &[u8],
    channels: usize,
    frames: usize,
) -> Result<Vec<Vec<f32>>, StoreError> {
    let expected = channels * frames * 4;
    if bytes.len() != expected {
        return Err(StoreError::Corrupt {
            what: "block payload",
            message: format!("expected {expected} bytes, found {}", bytes.len()),
        });
    }
    if frames == 0 {
        return Ok(vec![Vec::new(); channels]);
    }
    Ok(bytes
        .chunks_exact(frames * 4)
        .map(|channel| {
            channel
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        })
        .collect())
}

/// Keeps names and URLs out of plain sight in the database file. Not encryption.
pub(crate) fn obfuscate(value: &str) -> String {
    general_purpose::STANDARD.encode(mask(value.as_bytes()))
}

pub(crate) fn deobfuscate(value: &str) -> Result<String, StoreError> {
    let raw = general_purpose::STANDARD
        .decode(value)
        .map_err(|err| StoreError::Corrupt {
            what: "masked field",
            message: err.to_string(),
        })?;
    String::from_utf8(mask(&raw)).map_err(|err| StoreError::Corrupt {
        what: "masked field",
        message: err.to_string(),
    })
}

fn mask(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .zip(MASK.iter().cycle())
        .map(|(b, k)| b ^ k)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planar_samples_are_bit_identical() {
        let channels = vec![
            vec![0.0, -0.0, 1.0, f32::MIN_POSITIVE, 0.123_456_79],
            vec![-1.0, f32::MAX, f32::EPSILON, -0.5, 3.0e-9],
        ];
        let bytes = encode_planar(&channels);
        assert_eq!(bytes.len(), 2 * 5 * 4);
        let back = decode_planar(&bytes, 2, 5).expect("decode");
        for (a, b) in channels.iter().flatten().zip(back.iter().flatten()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn wrong_length_payload_is_corrupt() {
        let err = decode_planar(&[0u8; 12], 2, 2).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn zero_frames_decode_to_empty_channels() {
        let back = decode_planar(&[], 2, 0).expect("decode");
        assert_eq!(back, vec![Vec::<f32>::new(), Vec::new()]);
    }

    #[test]
    fn masked_fields_round_trip_and_hide_plaintext() {
        let url = "https://cdn.example.com/music/track.mp3?sig=abc";
        let masked = obfuscate(url);
        assert!(!masked.contains("example"));
        assert_eq!(deobfuscate(&masked).expect("unmask"), url);
        assert_eq!(deobfuscate(&obfuscate("")).expect("unmask"), "");
    }

    #[test]
    fn garbage_masked_field_is_corrupt() {
        assert!(matches!(
            deobfuscate("not base64 !!"),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
