//! Bounded zlib inflation for compressed GGEP payloads.
//!
//! Payloads come from untrusted peers, so decompression output is grown
//! incrementally and hard-capped instead of trusting any advertised size.

use flate2::{Decompress, FlushDecompress, Status};

/// Output-size policy for inflating a single payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InflateLimits {
    /// Hard cap on the inflated size; exceeding it fails the decode.
    pub max_size: usize,
    /// Minimum growth increment when the output buffer fills up.
    pub growth: usize,
}

impl Default for InflateLimits {
    fn default() -> Self {
        Self {
            max_size: 65535,
            growth: 512,
        }
    }
}

/// Error inflating a payload.
#[derive(Debug, thiserror::Error)]
pub enum InflateError {
    #[error("inflated payload exceeds {0} bytes")]
    TooLarge(usize),
    #[error("truncated or corrupt deflated stream")]
    Truncated,
    #[error("zlib error: {0}")]
    Stream(#[from] flate2::DecompressError),
}

/// Quick structural check for a zlib stream header: deflate method nibble
/// and the header checksum (big-endian 16-bit value divisible by 31).
pub fn is_valid_zlib_header(buf: &[u8]) -> bool {
    if buf.len() < 2 {
        return false;
    }
    if buf[0] & 0x0f != 8 {
        return false;
    }
    (u16::from(buf[0]) << 8 | u16::from(buf[1])) % 31 == 0
}

/// Inflate a complete zlib stream into an owned buffer.
///
/// The output starts at twice the input size and grows by at least
/// `limits.growth` (or the input size, whichever is larger) up to
/// `limits.max_size`; hitting the cap with data still pending is an error.
pub fn inflate(input: &[u8], limits: &InflateLimits) -> Result<Vec<u8>, InflateError> {
    let initial = input.len().saturating_mul(2).clamp(1, limits.max_size);
    let mut out = Vec::with_capacity(initial);
    let mut z = Decompress::new(true);

    loop {
        let consumed = z.total_in() as usize;
        let status = z.decompress_vec(&input[consumed..], &mut out, FlushDecompress::Finish)?;
        match status {
            Status::StreamEnd => return Ok(out),
            Status::Ok | Status::BufError => {
                if out.len() < out.capacity() {
                    // Output space left but the stream stalled: input ended
                    // before the stream did.
                    return Err(InflateError::Truncated);
                }
                if out.capacity() >= limits.max_size {
                    return Err(InflateError::TooLarge(limits.max_size));
                }
                let grow = input
                    .len()
                    .max(limits.growth)
                    .min(limits.max_size - out.capacity());
                out.reserve_exact(grow + out.capacity() - out.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn header_check() {
        assert!(is_valid_zlib_header(&[0x78, 0x9c]));
        assert!(is_valid_zlib_header(&[0x78, 0x01]));
        assert!(!is_valid_zlib_header(&[0x78, 0x9d])); // bad checksum
        assert!(!is_valid_zlib_header(&[0x79, 0x9c])); // not deflate method
        assert!(!is_valid_zlib_header(&[0x78]));
        assert!(!is_valid_zlib_header(&[]));
    }

    #[test]
    fn real_streams_pass_header_check() {
        assert!(is_valid_zlib_header(&deflate(b"hello")));
        assert!(is_valid_zlib_header(&deflate(&[])));
    }

    #[test]
    fn roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let out = inflate(&deflate(data), &InflateLimits::default()).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn empty_payload() {
        let out = inflate(&deflate(&[]), &InflateLimits::default()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn grows_past_initial_estimate() {
        // Highly compressible data inflates far beyond 2x the input size.
        let data = vec![0u8; 40_000];
        let out = inflate(&deflate(&data), &InflateLimits::default()).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn cap_is_enforced() {
        let data = vec![0u8; 100_000];
        let err = inflate(&deflate(&data), &InflateLimits::default()).unwrap_err();
        assert!(matches!(err, InflateError::TooLarge(65535)));
    }

    #[test]
    fn custom_cap() {
        let data = vec![7u8; 100_000];
        let limits = InflateLimits {
            max_size: 200_000,
            growth: 512,
        };
        let out = inflate(&deflate(&data), &limits).unwrap();
        assert_eq!(out.len(), 100_000);
    }

    #[test]
    fn truncated_stream_fails() {
        let z = deflate(b"some data worth compressing, repeated a few times over");
        let cut = &z[..z.len() - 4];
        assert!(inflate(cut, &InflateLimits::default()).is_err());
    }

    #[test]
    fn garbage_fails() {
        assert!(inflate(&[0xde, 0xad, 0xbe, 0xef], &InflateLimits::default()).is_err());
    }
}
