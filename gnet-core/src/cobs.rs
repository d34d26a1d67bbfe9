//! COBS (Consistent Overhead Byte Stuffing): zero-free encoding of byte
//! buffers, used by GGEP payloads carried in NUL-terminated message fields.
//!
//! Encoded form is a sequence of blocks, each a non-zero code byte `c`
//! followed by `c - 1` literal non-zero bytes. A code below 0xFF implies a
//! zero byte after the block (except for the final block); 0xFF implies none.

/// Check whether `buf` is structurally valid COBS data: the chain of code
/// bytes must tile the buffer exactly and no code byte may be zero.
pub fn is_valid(buf: &[u8]) -> bool {
    if buf.is_empty() {
        return false;
    }
    let mut i = 0;
    while i < buf.len() {
        let code = buf[i];
        if code == 0 {
            return false;
        }
        i += code as usize;
    }
    i == buf.len()
}

/// Decode a COBS buffer into its original form. Returns `None` when the
/// buffer is not valid COBS data. The decoded form is always at least one
/// byte shorter than the encoded one.
pub fn decode(buf: &[u8]) -> Option<Vec<u8>> {
    if buf.is_empty() {
        return None;
    }
    let mut out = Vec::with_capacity(buf.len() - 1);
    let mut i = 0;
    while i < buf.len() {
        let code = buf[i] as usize;
        if code == 0 || i + code > buf.len() {
            return None;
        }
        out.extend_from_slice(&buf[i + 1..i + code]);
        i += code;
        if code < 0xff && i < buf.len() {
            out.push(0);
        }
    }
    Some(out)
}

/// Encode a buffer with COBS, yielding a zero-free result.
pub fn encode(buf: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len() + 1 + buf.len() / 254);
    let mut code_at = out.len();
    out.push(1u8);
    for &b in buf {
        if b == 0 {
            code_at = out.len();
            out.push(1);
        } else {
            out.push(b);
            out[code_at] += 1;
            if out[code_at] == 0xff {
                // Full block; open a new one unless the input ends here.
                code_at = out.len();
                out.push(1);
            }
        }
    }
    // A trailing empty block forced by a full 0xFF block decodes to nothing
    // and implies no zero at end of input, so it can stay.
    out
}
