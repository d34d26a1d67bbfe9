//! Extension decoder: splits the trailing bytes of a message into typed
//! extension records.
//!
//! A buffer may interleave GGEP blocks (binary, self-delimiting), legacy
//! "urn:" words, XML fragments, separator padding and plain garbage. The
//! parser makes a single forward pass, never fails as a whole, and wraps
//! anything it cannot make sense of as an opaque "unknown" record, resuming
//! at the next recognizable boundary. GGEP payloads may additionally be
//! COBS-encoded and deflated; those are decoded lazily on first access and
//! degrade to an empty payload when the encoding turns out to be broken.
//!
//! The input buffer is attacker-controlled: every length and flag is
//! validated against the remaining bytes before being trusted.

use std::collections::HashMap;

use once_cell::unsync::OnceCell;
use tracing::warn;

use crate::atom::{Atom, AtomTable};
use crate::cobs;
use crate::inflate::{self, InflateLimits};

/// Leading byte of a GGEP block.
pub const GGEP_MAGIC: u8 = 0xc3;

/// Field separator used between legacy extensions.
pub const HUGE_FS: u8 = 0x1c;

// GGEP flag byte layout.
const GGEP_F_MBZ: u8 = 0x80;
const GGEP_F_COBS: u8 = 0x40;
const GGEP_F_DEFLATE: u8 = 0x20;
const GGEP_F_LAST: u8 = 0x10;
const GGEP_F_IDLEN: u8 = 0x0f;

// GGEP length byte layout: 6 value bits, one of the two top flags set.
const GGEP_L_CONT: u8 = 0x80;
const GGEP_L_LAST: u8 = 0x40;
const GGEP_L_VALUE: u8 = 0x3f;
const GGEP_L_VSHIFT: u32 = 6;

/// Broad family of an extension record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtKind {
    /// GGEP binary sub-extension.
    Ggep,
    /// Legacy "urn:" extension.
    Huge,
    /// Opaque XML fragment.
    Xml,
    /// Unrecognized bytes kept for inspection.
    Unknown,
    /// A run of separator bytes: pure overhead.
    None,
}

/// Recognized extension sub-type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtToken {
    Unknown,
    /// Separator padding.
    Overhead,
    Xml,
    UrnEmpty,
    UrnBitprint,
    UrnSha1,
    /// GGEP extension whose ID is not reserved.
    UnknownGgep,
    GgepLimeXml,
    GgepAlt,
    GgepBh,
    GgepCt,
    GgepDu,
    GgepGtkgv1,
    GgepGue,
    GgepH,
    GgepHname,
    GgepIp,
    GgepIpp,
    GgepLf,
    GgepLoc,
    GgepPath,
    GgepPhc,
    GgepPush,
    GgepScp,
    GgepT,
    GgepUdphc,
    GgepUp,
    GgepVc,
    GgepU,
}

/// Reserved URN namespaces, sorted, matched case-insensitively.
static URN_WORDS: &[(&str, ExtToken)] = &[
    ("bitprint", ExtToken::UrnBitprint),
    ("sha1", ExtToken::UrnSha1),
];

/// Reserved GGEP IDs, sorted by byte value, matched case-sensitively.
/// '<' sorts before any letter, 'u' after the uppercase block.
static GGEP_WORDS: &[(&str, ExtToken)] = &[
    ("<", ExtToken::GgepLimeXml),
    ("ALT", ExtToken::GgepAlt),
    ("BH", ExtToken::GgepBh),
    ("CT", ExtToken::GgepCt),
    ("DU", ExtToken::GgepDu),
    ("GTKGV1", ExtToken::GgepGtkgv1),
    ("GUE", ExtToken::GgepGue),
    ("H", ExtToken::GgepH),
    ("HNAME", ExtToken::GgepHname),
    ("IP", ExtToken::GgepIp),
    ("IPP", ExtToken::GgepIpp),
    ("LF", ExtToken::GgepLf),
    ("LOC", ExtToken::GgepLoc),
    ("PATH", ExtToken::GgepPath),
    ("PHC", ExtToken::GgepPhc),
    ("PUSH", ExtToken::GgepPush),
    ("SCP", ExtToken::GgepScp),
    ("T", ExtToken::GgepT),
    ("UDPHC", ExtToken::GgepUdphc),
    ("UP", ExtToken::GgepUp),
    ("VC", ExtToken::GgepVc),
    ("u", ExtToken::GgepU),
];

/// Case-sensitive lookup in the GGEP reserved table.
fn screen_ggep(word: &[u8]) -> (ExtToken, Option<&'static str>) {
    match GGEP_WORDS.binary_search_by(|(name, _)| name.as_bytes().cmp(word)) {
        Ok(i) => (GGEP_WORDS[i].1, Some(GGEP_WORDS[i].0)),
        Err(_) => (ExtToken::UnknownGgep, None),
    }
}

/// Case-insensitive lookup in the URN namespace table.
fn screen_urn(word: &[u8]) -> (ExtToken, Option<&'static str>) {
    let res = URN_WORDS.binary_search_by(|(name, _)| {
        let a = name.as_bytes().iter().map(u8::to_ascii_lowercase);
        let b = word.iter().map(u8::to_ascii_lowercase);
        a.cmp(b)
    });
    match res {
        Ok(i) => (URN_WORDS[i].1, Some(URN_WORDS[i].0)),
        Err(_) => (ExtToken::Unknown, None),
    }
}

/// Identifier of a GGEP record: a reserved static word or an interned,
/// printable rendition of the raw ID.
#[derive(Debug, Clone)]
enum GgepId {
    Reserved(&'static str),
    Interned(Atom),
}

/// GGEP-specific record state.
#[derive(Debug, Clone)]
struct GgepInfo {
    cobs: bool,
    deflate: bool,
    id: GgepId,
    limits: InflateLimits,
}

/// One extension extracted from a buffer.
///
/// Physical spans index into the parsed buffer and are never copied; only a
/// lazily decoded GGEP payload owns memory of its own. Records from one
/// parse tile the consumed prefix of the buffer exactly.
#[derive(Debug)]
pub struct Extension<'a> {
    buf: &'a [u8],
    kind: ExtKind,
    token: ExtToken,
    name: Option<&'static str>,
    /// Offset of the record's first byte, header included.
    base: usize,
    payload_off: usize,
    payload_len: usize,
    ggep: Option<GgepInfo>,
    /// Lazy decode result: `Some(bytes)` decoded, `None` failed (empty).
    decoded: OnceCell<Option<Vec<u8>>>,
}

impl<'a> Extension<'a> {
    /// Record with no separate header, covering `base..end` verbatim.
    fn opaque(buf: &'a [u8], kind: ExtKind, token: ExtToken, base: usize, end: usize) -> Self {
        Extension {
            buf,
            kind,
            token,
            name: None,
            base,
            payload_off: base,
            payload_len: end - base,
            ggep: None,
            decoded: OnceCell::new(),
        }
    }

    pub fn kind(&self) -> ExtKind {
        self.kind
    }

    pub fn token(&self) -> ExtToken {
        self.token
    }

    /// Reserved-word name, when the token is a recognized one.
    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    /// Printable GGEP ID, or "" for non-GGEP records.
    pub fn id_str(&self) -> &str {
        match &self.ggep {
            Some(g) => match &g.id {
                GgepId::Reserved(s) => s,
                GgepId::Interned(a) => a.as_str().unwrap_or(""),
            },
            None => "",
        }
    }

    /// Offset of the record's first byte in the parsed buffer.
    pub fn base_offset(&self) -> usize {
        self.base
    }

    /// The header bytes preceding the physical payload.
    pub fn header(&self) -> &'a [u8] {
        &self.buf[self.base..self.payload_off]
    }

    pub fn header_len(&self) -> usize {
        self.payload_off - self.base
    }

    /// Payload bytes as they sit on the wire, before any decoding.
    pub fn phys_payload(&self) -> &'a [u8] {
        &self.buf[self.payload_off..self.payload_off + self.payload_len]
    }

    /// Total bytes the record occupies in the buffer.
    pub fn phys_len(&self) -> usize {
        self.header_len() + self.payload_len
    }

    /// Decoded payload. For a COBS/deflated GGEP record the first call
    /// decodes and caches; a record whose encoding is broken yields an
    /// empty slice. Everything else returns the physical payload.
    pub fn payload(&self) -> &[u8] {
        let needs_decode = self
            .ggep
            .as_ref()
            .map(|g| g.cobs || g.deflate)
            .unwrap_or(false);
        if !needs_decode {
            return self.phys_payload();
        }
        match self.decoded.get_or_init(|| self.decode()) {
            Some(bytes) => bytes,
            None => &[],
        }
    }

    /// Length of the decoded payload.
    pub fn payload_len(&self) -> usize {
        self.payload().len()
    }

    /// Header length plus decoded payload length.
    pub fn total_len(&self) -> usize {
        self.header_len() + self.payload_len()
    }

    /// Whether the decoded payload is entirely printable characters.
    pub fn is_printable(&self) -> bool {
        self.payload()
            .iter()
            .all(|&c| (0x20..0x7f).contains(&c))
    }

    /// Whether the decoded payload is entirely 7-bit ASCII.
    pub fn is_ascii(&self) -> bool {
        self.payload().iter().all(|c| c.is_ascii())
    }

    /// Whether the decoded payload is ASCII and holds at least one
    /// alphanumeric character.
    pub fn has_ascii_word(&self) -> bool {
        let mut has_alnum = false;
        for c in self.payload() {
            if !c.is_ascii() {
                return false;
            }
            has_alnum |= c.is_ascii_alphanumeric();
        }
        has_alnum
    }

    /// Run the COBS/deflate pipeline over the physical payload.
    fn decode(&self) -> Option<Vec<u8>> {
        let g = self.ggep.as_ref()?;
        let raw = self.phys_payload();
        if raw.is_empty() {
            return None;
        }
        if g.cobs {
            let plain = match cobs::decode(raw) {
                Some(v) => v,
                None => {
                    warn!(id = self.id_str(), "unable to decode COBS payload");
                    return None;
                }
            };
            if !g.deflate {
                return Some(plain);
            }
            if plain.is_empty() {
                warn!(id = self.id_str(), "COBS-decoded payload is empty");
                return None;
            }
            return match inflate::inflate(&plain, &g.limits) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(id = self.id_str(), error = %e, "payload inflation failed");
                    None
                }
            };
        }
        match inflate::inflate(raw, &g.limits) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(id = self.id_str(), error = %e, "payload inflation failed");
                None
            }
        }
    }
}

/// Extension parser.
///
/// Stateless across buffers apart from the reserved-word tables, the cache
/// of interned printable names for non-reserved GGEP IDs, and the inflation
/// limits applied to compressed payloads.
pub struct ExtParser {
    atoms: AtomTable,
    names: HashMap<Box<[u8]>, Atom>,
    limits: InflateLimits,
}

impl ExtParser {
    pub fn new(atoms: AtomTable) -> Self {
        Self::with_limits(atoms, InflateLimits::default())
    }

    pub fn with_limits(atoms: AtomTable, limits: InflateLimits) -> Self {
        ExtParser {
            atoms,
            names: HashMap::new(),
            limits,
        }
    }

    /// Parse `buf` into extension records appended to `out`, stopping after
    /// `cap` records. Returns the number of bytes consumed; this is below
    /// `buf.len()` only when the record capacity ran out first.
    ///
    /// The records reference `buf` and tile the consumed prefix exactly.
    pub fn parse<'a>(&mut self, buf: &'a [u8], out: &mut Vec<Extension<'a>>, cap: usize) -> usize {
        let start_count = out.len();
        let mut p = 0;

        while p < buf.len() && out.len() - start_count < cap {
            let old_p = p;
            let before = out.len();
            let room = cap - (out.len() - start_count);

            match buf[p] {
                GGEP_MAGIC => {
                    if let Some(next) = self.parse_ggep(buf, p, out, room) {
                        p = next;
                    }
                }
                b'u' | b'U' => {
                    if let Some((ext, next)) = parse_huge(buf, p) {
                        out.push(ext);
                        p = next;
                    }
                }
                b'<' => {
                    let (ext, next) = parse_xml(buf, p);
                    out.push(ext);
                    p = next;
                }
                0 | HUGE_FS => {
                    let (ext, next) = parse_none(buf, p);
                    out.push(ext);
                    p = next;
                }
                _ => {
                    let (ext, next) = parse_unknown(buf, p, false);
                    out.push(ext);
                    p = next;
                }
            }

            // Zero progress means the leading byte promised a structure the
            // bytes do not deliver: take the span up to the next plausible
            // boundary as unknown, skipping the boundary we started on.
            if p == old_p {
                debug_assert_eq!(out.len(), before);
                let (ext, next) = parse_unknown(buf, p, true);
                out.push(ext);
                p = next;
            }
            debug_assert!(p > old_p, "parser must consume at least one byte");

            // Coalesce separator padding and garbage into a preceding
            // unknown record to keep the output compact.
            let added = out.len() - before;
            if added == 1 && before > start_count {
                let last_kind = out[out.len() - 1].kind;
                let prev_kind = out[out.len() - 2].kind;
                if (last_kind == ExtKind::Unknown || last_kind == ExtKind::None)
                    && prev_kind == ExtKind::Unknown
                {
                    let next = out.pop().expect("just added");
                    merge_adjacent(out.last_mut().expect("previous exists"), &next);
                }
            }
        }

        p
    }

    /// Parse one GGEP block, appending a record per sub-extension. Returns
    /// the new cursor, or `None` when the bytes are not a valid GGEP block:
    /// any malformed sub-extension discards the whole block, records already
    /// appended included, and leaves the cursor untouched.
    fn parse_ggep<'a>(
        &mut self,
        buf: &'a [u8],
        start: usize,
        out: &mut Vec<Extension<'a>>,
        room: usize,
    ) -> Option<usize> {
        let end = buf.len();
        let rollback = out.len();
        let mut q = start + 1; // past the magic byte
        let mut last = start; // magic accounted to the first record
        let mut count = 0;

        while count < room && q < end {
            let flags = buf[q];
            q += 1;

            if flags & GGEP_F_MBZ != 0 {
                out.truncate(rollback);
                return None;
            }
            let id_len = (flags & GGEP_F_IDLEN) as usize;
            if id_len == 0 || end - q < id_len {
                out.truncate(rollback);
                return None;
            }

            // IDs must be printable 7-bit ASCII: anything else is likely
            // garbage that happened to start with the magic byte.
            let id = &buf[q..q + id_len];
            if id
                .iter()
                .any(|&c| c == 0 || !c.is_ascii() || c.is_ascii_control())
            {
                out.truncate(rollback);
                return None;
            }
            q += id_len;

            // Payload length: up to 3 bytes of 6 value bits each, exactly
            // one of the two top flag bits set per byte.
            let mut data_len: usize = 0;
            let mut length_ended = false;
            for _ in 0..3 {
                if q >= end {
                    break;
                }
                let b = buf[q];
                q += 1;
                let flags_bits = b & (GGEP_L_CONT | GGEP_L_LAST);
                if flags_bits == 0 || flags_bits == GGEP_L_CONT | GGEP_L_LAST {
                    length_ended = false;
                    break;
                }
                data_len = (data_len << GGEP_L_VSHIFT) | (b & GGEP_L_VALUE) as usize;
                if b & GGEP_L_LAST != 0 {
                    length_ended = true;
                    break;
                }
            }
            if !length_ended || end - q < data_len {
                out.truncate(rollback);
                return None;
            }

            let payload = &buf[q..q + data_len];
            let is_cobs = flags & GGEP_F_COBS != 0;
            let is_deflate = flags & GGEP_F_DEFLATE != 0;
            if !ggep_payload_plausible(payload, is_cobs, is_deflate) {
                out.truncate(rollback);
                return None;
            }

            let (token, name) = screen_ggep(id);
            let ggep_id = match name {
                Some(s) => GgepId::Reserved(s),
                None => GgepId::Interned(self.name_atom(id)),
            };
            out.push(Extension {
                buf,
                kind: ExtKind::Ggep,
                token,
                name,
                base: last,
                payload_off: q,
                payload_len: data_len,
                ggep: Some(GgepInfo {
                    cobs: is_cobs,
                    deflate: is_deflate,
                    id: ggep_id,
                    limits: self.limits,
                }),
                decoded: OnceCell::new(),
            });
            count += 1;
            last = q + data_len;
            q = last;

            if flags & GGEP_F_LAST != 0 {
                break;
            }
        }

        if count == 0 {
            out.truncate(rollback);
            return None;
        }
        Some(last)
    }

    /// Printable atom for a non-reserved GGEP ID, cached per raw ID.
    fn name_atom(&mut self, id: &[u8]) -> Atom {
        if let Some(a) = self.names.get(id) {
            return a.clone();
        }
        let printable = hex_escape(id);
        let atom = self.atoms.intern_str(&printable);
        self.names.insert(Box::from(id), atom.clone());
        atom
    }
}

/// Cheap structural screen of a GGEP payload before committing to a record:
/// COBS framing must be well-formed, and a deflated stream must be long
/// enough to carry a valid zlib header (one COBS byte in, when stacked).
fn ggep_payload_plausible(payload: &[u8], is_cobs: bool, is_deflate: bool) -> bool {
    if !is_cobs && !is_deflate {
        return true;
    }
    let mut d_len = payload.len();
    if is_cobs {
        if payload.is_empty() || !cobs::is_valid(payload) {
            return false;
        }
        d_len -= 1; // COBS carries one byte of overhead
    }
    if is_deflate {
        if d_len < 6 {
            return false;
        }
        let offset = if is_cobs {
            // Neither zlib header byte can be NUL, so the leading COBS
            // code must cover both as literals.
            if payload[0] < 3 {
                return false;
            }
            1
        } else {
            0
        };
        if !inflate::is_valid_zlib_header(&payload[offset..]) {
            return false;
        }
    }
    true
}

/// Show non-printable ID bytes as \xHH escapes.
fn hex_escape(raw: &[u8]) -> String {
    let mut s = String::with_capacity(raw.len());
    for &b in raw {
        if (0x20..0x7f).contains(&b) {
            s.push(b as char);
        } else {
            s.push_str(&format!("\\x{b:02X}"));
        }
    }
    s
}

/// Parse a legacy "urn:" word. Returns the record and new cursor, or `None`
/// when the bytes are not a URN.
fn parse_huge(buf: &[u8], start: usize) -> Option<(Extension<'_>, usize)> {
    let end = buf.len();
    if end - start < 4 || !buf[start..start + 4].eq_ignore_ascii_case(b"urn:") {
        return None;
    }
    let mut q = start + 4;

    // Bare "urn:" with nothing behind it.
    if q == end || buf[q] == 0 || buf[q] == HUGE_FS {
        return Some((
            Extension {
                buf,
                kind: ExtKind::Huge,
                token: ExtToken::UrnEmpty,
                name: None,
                base: start,
                payload_off: q,
                payload_len: 0,
                ggep: None,
                decoded: OnceCell::new(),
            },
            q,
        ));
    }

    // Namespace runs to the next ':'.
    let name_start = q;
    while q < end && buf[q] != b':' {
        q += 1;
    }
    if q == end || q == name_start {
        return None;
    }
    let (token, name) = screen_urn(&buf[name_start..q]);
    q += 1;

    // Payload is a run of alphanumerics, stopped by anything else.
    let payload_start = q;
    while q < end {
        let c = buf[q];
        if !c.is_ascii_alphanumeric() || c == GGEP_MAGIC {
            break;
        }
        q += 1;
    }

    Some((
        Extension {
            buf,
            kind: ExtKind::Huge,
            token,
            name,
            base: start,
            payload_off: payload_start,
            payload_len: q - payload_start,
            ggep: None,
            decoded: OnceCell::new(),
        },
        q,
    ))
}

/// Grab an XML fragment up to the next NUL or field separator.
fn parse_xml(buf: &[u8], start: usize) -> (Extension<'_>, usize) {
    let mut q = start;
    while q < buf.len() && buf[q] != 0 && buf[q] != HUGE_FS {
        q += 1;
    }
    (
        Extension::opaque(buf, ExtKind::Xml, ExtToken::Xml, start, q),
        q,
    )
}

/// Wrap a run of separator bytes as one overhead record.
fn parse_none(buf: &[u8], start: usize) -> (Extension<'_>, usize) {
    let mut q = start;
    while q < buf.len() && (buf[q] == 0 || buf[q] == HUGE_FS) {
        q += 1;
    }
    debug_assert!(q > start);
    (
        Extension::opaque(buf, ExtKind::None, ExtToken::Overhead, start, q),
        q,
    )
}

/// Wrap bytes up to the next resynchronization point as an unknown record.
/// With `skip` set the first resynchronization point found is passed over,
/// which guarantees progress when the current byte itself looks like one.
fn parse_unknown(buf: &[u8], start: usize, mut skip: bool) -> (Extension<'_>, usize) {
    let end = buf.len();
    let mut q = start;
    while q < end {
        let c = buf[q];
        q += 1;
        let resync = c == 0
            || c == HUGE_FS
            || c == GGEP_MAGIC
            || ((c == b'u' || c == b'U')
                && end - q >= 3
                && buf[q..q + 3].eq_ignore_ascii_case(b"rn:"))
            || (c == b'<' && q < end && buf[q].is_ascii_alphabetic());
        if resync {
            if skip {
                skip = false;
                continue;
            }
            q -= 1;
            break;
        }
    }
    debug_assert!(q > start);
    (
        Extension::opaque(buf, ExtKind::Unknown, ExtToken::Unknown, start, q),
        q,
    )
}

/// Extend `prev` to also cover `next`; the merged record keeps its own
/// kind and token.
fn merge_adjacent<'a>(prev: &mut Extension<'a>, next: &Extension<'a>) {
    let prev_end = prev.payload_off + prev.payload_len;
    let next_end = next.payload_off + next.payload_len;
    debug_assert_eq!(next.base, prev_end, "merged records must be adjacent");
    debug_assert!(next_end > prev_end);
    prev.payload_len += next_end - prev_end;
}
