use crate::Error;
use tracing::{trace, warn};

/// Length of the original-size header prefixed to every frame.
const SIZE_HEADER: usize = 8;

/// Compresses payloads into size-prefixed frames.
///
/// A frame is the original payload length (little-endian `u64`) followed by the zstd
/// compressed payload. A length of zero marks a stored frame: the rest of the frame is the
/// payload itself. Payloads are stored when they are empty, when compression fails, or when
/// compression does not make them smaller.
#[derive(Clone, Debug)]
pub struct Compressor {
    level: i32,
    max_size: usize,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(3, 64 * 1024 * 1024)
    }
}

impl Compressor {
    /// Create a compressor using the zstd `level` that refuses to inflate frames larger than
    /// `max_size` bytes.
    pub fn new(level: i32, max_size: usize) -> Self {
        Self { level, max_size }
    }

    /// Return a frame for `data`.
    pub fn compress(&self, data: &[u8]) -> Vec<u8> {
        if !data.is_empty() {
            match zstd::bulk::compress(data, self.level) {
                Ok(compressed) if compressed.len() < data.len() => {
                    let mut frame = Vec::with_capacity(SIZE_HEADER + compressed.len());
                    frame.extend_from_slice(&(data.len() as u64).to_le_bytes());
                    frame.extend_from_slice(&compressed);
                    return frame;
                }
                Ok(_) => trace!(len = data.len(), "payload incompressible, storing"),
                Err(err) => warn!(?err, len = data.len(), "compression failed, storing"),
            }
        }
        let mut frame = Vec::with_capacity(SIZE_HEADER + data.len());
        frame.extend_from_slice(&0u64.to_le_bytes());
        frame.extend_from_slice(data);
        frame
    }

    /// Return the payload stored in `frame`.
    pub fn decompress(&self, frame: &[u8]) -> Result<Vec<u8>, Error> {
        if frame.len() < SIZE_HEADER {
            return Err(Error::FrameTooShort(frame.len()));
        }
        let (header, body) = frame.split_at(SIZE_HEADER);
        let mut size = [0u8; SIZE_HEADER];
        size.copy_from_slice(header);
        let size = u64::from_le_bytes(size);
        if size == 0 {
            return Ok(body.to_vec());
        }
        let expected = usize::try_from(size)
            .ok()
            .filter(|expected| *expected <= self.max_size)
            .ok_or(Error::FrameTooLarge(size, self.max_size))?;
        let payload =
            zstd::bulk::decompress(body, expected).map_err(Error::DecompressionFailed)?;
        if payload.len() != expected {
            return Err(Error::SizeMismatch {
                expected,
                actual: payload.len(),
            });
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressible_payload_is_compressed() {
        let compressor = Compressor::default();
        let data = b"abcd".repeat(1024);
        let frame = compressor.compress(&data);
        assert!(frame.len() < data.len());
        assert_eq!(&frame[..SIZE_HEADER], &(data.len() as u64).to_le_bytes());
        assert_eq!(compressor.decompress(&frame).unwrap(), data);
    }

    #[test]
    fn test_empty_and_tiny_payloads_are_stored() {
        let compressor = Compressor::default();
        for data in [&b""[..], &b"x"[..], &b"xy"[..]] {
            let frame = compressor.compress(data);
            assert_eq!(&frame[..SIZE_HEADER], &[0u8; SIZE_HEADER]);
            assert_eq!(&frame[SIZE_HEADER..], data);
            assert_eq!(compressor.decompress(&frame).unwrap(), data);
        }
    }

    #[test]
    fn test_short_frame() {
        let compressor = Compressor::default();
        assert!(matches!(
            compressor.decompress(&[0u8; 7]),
            Err(Error::FrameTooShort(7))
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let compressor = Compressor::new(3, 1024);
        let frame = Compressor::default().compress(&[0u8; 4096]);
        assert!(matches!(
            compressor.decompress(&frame),
            Err(Error::FrameTooLarge(4096, 1024))
        ));
    }

    #[test]
    fn test_corrupted_frame() {
        let compressor = Compressor::default();
        let mut frame = compressor.compress(&b"abcd".repeat(1024));
        let len = frame.len();
        frame.truncate(len / 2);
        assert!(compressor.decompress(&frame).is_err());
    }
}
