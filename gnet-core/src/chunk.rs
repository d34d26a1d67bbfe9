//! Chunked transfer encoding: resumable decoder for HTTP "chunked" framing.

use tracing::warn;

/// Decoding state, persisted across input fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Accumulating hexadecimal chunk-size digits.
    Size,
    /// Skipping a chunk-extension up to the end of the size line.
    Ext,
    /// Copying chunk payload bytes through to the destination.
    Data,
    /// Expecting the CRLF that terminates chunk payload.
    DataCrlf,
    /// At the start of a (possibly empty) trailer line.
    TrailerStart,
    /// Skipping a non-empty trailer line.
    Trailer,
    /// The terminating zero-size chunk and trailers have been seen.
    End,
    /// A protocol error was reported; the decoder is unusable.
    Error,
}

/// Error decoding a chunked stream. All of these are fatal for the stream.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("overflow in chunk-size")]
    SizeOverflow,
    #[error("bad chunk-size byte 0x{0:02x}")]
    BadSizeByte(u8),
    #[error("remaining data after chunk end")]
    TrailingData,
}

/// Bytes consumed from the source and produced into the destination by one
/// `decode` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub consumed: usize,
    pub produced: usize,
}

/// Maximum number of chunk-size hex digits (64-bit sizes).
const HEX_DIGITS_MAX: usize = 16;

/// Resumable decoder for chunked transfer encoding.
///
/// Feed it source fragments as they arrive; it copies de-framed payload bytes
/// into the destination buffer and keeps all parse state internally, so a
/// chunk header or payload may be split at any byte boundary between calls.
pub struct ChunkDecoder {
    state: State,
    /// Payload bytes still expected for the current chunk.
    data_remain: u64,
    hex_buf: [u8; HEX_DIGITS_MAX],
    hex_pos: usize,
    /// Tolerated a missing CR/LF after chunk data (warned once).
    no_crlf: bool,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Size,
            data_remain: 0,
            hex_buf: [0; HEX_DIGITS_MAX],
            hex_pos: 0,
            no_crlf: false,
        }
    }

    /// True once the terminating chunk and its trailers have been decoded.
    pub fn is_finished(&self) -> bool {
        self.state == State::End
    }

    /// Decode as much of `src` as possible, writing payload bytes to `dst`.
    ///
    /// Stops when the source is exhausted, the destination is full, or the
    /// end of the chunked stream is reached; call again with the unconsumed
    /// remainder later. Any byte arriving after the stream has ended is a
    /// protocol error. After an error the decoder must not be used again.
    pub fn decode(&mut self, src: &[u8], dst: &mut [u8]) -> Result<ChunkProgress, ChunkError> {
        assert!(self.state != State::Error, "decode called after error");

        let mut sp = 0; // source cursor
        let mut dp = 0; // destination cursor

        while sp < src.len() {
            match self.state {
                State::Data => {
                    debug_assert!(self.data_remain > 0);
                    let n = (src.len() - sp)
                        .min(dst.len() - dp)
                        .min(usize::try_from(self.data_remain).unwrap_or(usize::MAX));
                    if n == 0 {
                        break; // destination full, resume later
                    }
                    dst[dp..dp + n].copy_from_slice(&src[sp..sp + n]);
                    sp += n;
                    dp += n;
                    self.data_remain -= n as u64;
                    if self.data_remain == 0 {
                        self.state = State::DataCrlf;
                    }
                }

                State::DataCrlf => {
                    // Chunk data must be followed by CRLF; swallow extra CRs.
                    while sp < src.len() {
                        let c = src[sp];
                        sp += 1;
                        if c == b'\r' {
                            continue;
                        }
                        if c == b'\n' {
                            self.state = State::Size;
                        } else {
                            // The sender forgot the CRLF. If what follows is
                            // a valid chunk size we can resync: unread the
                            // byte and decode a size.
                            if !self.no_crlf {
                                self.no_crlf = true;
                                warn!("missing CRLF after chunk data");
                            }
                            sp -= 1;
                            self.state = State::Size;
                        }
                        break;
                    }
                }

                State::Size => {
                    while sp < src.len() {
                        let c = src[sp];
                        sp += 1;
                        if c.is_ascii_hexdigit() {
                            if self.hex_pos >= HEX_DIGITS_MAX {
                                return self.fail(ChunkError::SizeOverflow);
                            }
                            self.hex_buf[self.hex_pos] = c;
                            self.hex_pos += 1;
                        } else {
                            // A chunk-extension may follow the size, nothing
                            // else may.
                            if !c.is_ascii_whitespace() && c != b';' {
                                return self.fail(ChunkError::BadSizeByte(c));
                            }
                            let mut v: u64 = 0;
                            for &d in &self.hex_buf[..self.hex_pos] {
                                v = (v << 4) | u64::from(hex_value(d));
                            }
                            self.data_remain = v;
                            self.hex_pos = 0;
                            // A bare LF ends the size line right here;
                            // anything else leaves an extension to skip.
                            self.state = if c == b'\n' {
                                if v != 0 {
                                    State::Data
                                } else {
                                    State::TrailerStart
                                }
                            } else {
                                State::Ext
                            };
                            break;
                        }
                    }
                }

                State::Ext => {
                    // Skip over the chunk-extension up to the line end.
                    while sp < src.len() {
                        let c = src[sp];
                        sp += 1;
                        if c == b'\n' {
                            self.state = if self.data_remain != 0 {
                                State::Data
                            } else {
                                State::TrailerStart
                            };
                            break;
                        }
                    }
                }

                State::TrailerStart => {
                    if src[sp] == b'\r' {
                        sp += 1;
                    }
                    if sp >= src.len() {
                        break;
                    }
                    if src[sp] == b'\n' {
                        // An empty line ends the trailers and the stream.
                        sp += 1;
                        self.state = State::End;
                    } else {
                        self.state = State::Trailer;
                    }
                }

                State::Trailer => {
                    // Skip the trailer line, then look for another.
                    while sp < src.len() {
                        let c = src[sp];
                        sp += 1;
                        if c == b'\n' {
                            self.state = State::TrailerStart;
                            break;
                        }
                    }
                }

                State::End => {
                    return self.fail(ChunkError::TrailingData);
                }

                State::Error => unreachable!(),
            }

            if self.state == State::End {
                break;
            }
        }

        Ok(ChunkProgress {
            consumed: sp,
            produced: dp,
        })
    }

    fn fail(&mut self, e: ChunkError) -> Result<ChunkProgress, ChunkError> {
        self.state = State::Error;
        Err(e)
    }
}

fn hex_value(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => unreachable!(),
    }
}
