//! Atom table: reference-counted interning of small immutable values.
//!
//! Interning equal bytes twice yields the same backing storage, so equality
//! of atoms is pointer equality and each distinct value is stored once.
//! Atoms are handles: cloning bumps the reference count, dropping the last
//! clone removes the value from the table.

use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

/// The value families the table can intern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomKind {
    /// UTF-8 string.
    Str,
    /// 16-byte globally unique identifier.
    Guid,
    /// 20-byte SHA-1 digest.
    Sha1,
    /// 64-bit integer, stored big-endian.
    Uint64,
    /// 64-bit file size, stored big-endian.
    Filesize,
}

const KINDS: usize = 5;

impl AtomKind {
    /// Required byte length for fixed-size kinds.
    fn fixed_len(self) -> Option<usize> {
        match self {
            AtomKind::Str => None,
            AtomKind::Guid => Some(16),
            AtomKind::Sha1 => Some(20),
            AtomKind::Uint64 | AtomKind::Filesize => Some(8),
        }
    }

    fn index(self) -> usize {
        match self {
            AtomKind::Str => 0,
            AtomKind::Guid => 1,
            AtomKind::Sha1 => 2,
            AtomKind::Uint64 => 3,
            AtomKind::Filesize => 4,
        }
    }

    fn name(self) -> &'static str {
        match self {
            AtomKind::Str => "string",
            AtomKind::Guid => "GUID",
            AtomKind::Sha1 => "SHA1",
            AtomKind::Uint64 => "uint64",
            AtomKind::Filesize => "filesize",
        }
    }
}

/// Error interning a value.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AtomError {
    #[error("{kind} atom requires {expected} bytes, got {got}")]
    InvalidLength {
        kind: &'static str,
        expected: usize,
        got: usize,
    },
}

struct Tables {
    /// Per-kind interning map: value bytes to reference count. The boxed
    /// key is the backing storage the atoms point into.
    by_kind: [HashMap<Box<[u8]>, usize>; KINDS],
    /// Backing address to kind, kept in step with the per-kind maps.
    by_addr: HashMap<usize, AtomKind>,
}

/// Shared interning table. Cheap to clone; all clones intern into the same
/// storage.
#[derive(Clone)]
pub struct AtomTable {
    inner: Arc<Mutex<Tables>>,
}

impl Default for AtomTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomTable {
    pub fn new() -> Self {
        AtomTable {
            inner: Arc::new(Mutex::new(Tables {
                by_kind: Default::default(),
                by_addr: HashMap::new(),
            })),
        }
    }

    /// Intern `bytes` under `kind`: returns the existing atom with a bumped
    /// reference count, or copies the bytes in with a count of one.
    pub fn intern(&self, kind: AtomKind, bytes: &[u8]) -> Result<Atom, AtomError> {
        if let Some(expected) = kind.fixed_len() {
            if bytes.len() != expected {
                return Err(AtomError::InvalidLength {
                    kind: kind.name(),
                    expected,
                    got: bytes.len(),
                });
            }
        }
        let mut t = self.inner.lock();
        let map = &mut t.by_kind[kind.index()];
        let (ptr, len) = if let Some((key, _)) = map.get_key_value(bytes) {
            let p = (key.as_ptr() as *mut u8, key.len());
            *map.get_mut(bytes).expect("key just found") += 1;
            p
        } else {
            let key: Box<[u8]> = Box::from(bytes);
            let p = key.as_ptr() as *mut u8;
            let len = key.len();
            map.insert(key, 1);
            t.by_addr.insert(p as usize, kind);
            (p, len)
        };
        Ok(Atom {
            table: Arc::clone(&self.inner),
            kind,
            // SAFETY: points into a live boxed slice owned by the table.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            len,
        })
    }

    /// Intern a string atom.
    pub fn intern_str(&self, s: &str) -> Atom {
        self.intern(AtomKind::Str, s.as_bytes())
            .unwrap_or_else(|_| unreachable!("strings have no fixed length"))
    }

    /// Intern a 16-byte GUID atom.
    pub fn intern_guid(&self, guid: &[u8; 16]) -> Atom {
        self.intern(AtomKind::Guid, guid)
            .unwrap_or_else(|_| unreachable!("length checked by type"))
    }

    /// Intern a 20-byte SHA-1 atom.
    pub fn intern_sha1(&self, sha1: &[u8; 20]) -> Atom {
        self.intern(AtomKind::Sha1, sha1)
            .unwrap_or_else(|_| unreachable!("length checked by type"))
    }

    /// Intern a 64-bit integer atom.
    pub fn intern_u64(&self, v: u64) -> Atom {
        self.intern(AtomKind::Uint64, &v.to_be_bytes())
            .unwrap_or_else(|_| unreachable!("length checked by type"))
    }

    /// Intern a file-size atom.
    pub fn intern_filesize(&self, v: u64) -> Atom {
        self.intern(AtomKind::Filesize, &v.to_be_bytes())
            .unwrap_or_else(|_| unreachable!("length checked by type"))
    }

    /// Kind of the atom whose backing storage starts at `addr`, if any.
    pub fn kind_of(&self, addr: usize) -> Option<AtomKind> {
        self.inner.lock().by_addr.get(&addr).copied()
    }

    /// Number of distinct interned values, all kinds combined.
    pub fn len(&self) -> usize {
        self.inner.lock().by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Teardown check: log every value still interned and return how many
    /// there are. Nothing is freed; outstanding atoms stay valid.
    pub fn report_leaks(&self) -> usize {
        let t = self.inner.lock();
        let mut leaked = 0;
        for (i, map) in t.by_kind.iter().enumerate() {
            for (bytes, rc) in map {
                let kind = KIND_BY_INDEX[i];
                warn!(
                    kind = kind.name(),
                    refs = rc,
                    value = %printable(kind, bytes),
                    "atom still interned at teardown"
                );
                leaked += 1;
            }
        }
        leaked
    }
}

const KIND_BY_INDEX: [AtomKind; KINDS] = [
    AtomKind::Str,
    AtomKind::Guid,
    AtomKind::Sha1,
    AtomKind::Uint64,
    AtomKind::Filesize,
];

/// Human-readable rendering for diagnostics: text for strings, decimal for
/// integers, hex for binary kinds.
fn printable(kind: AtomKind, bytes: &[u8]) -> String {
    match kind {
        AtomKind::Str => String::from_utf8_lossy(bytes).into_owned(),
        AtomKind::Uint64 | AtomKind::Filesize => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            u64::from_be_bytes(raw).to_string()
        }
        AtomKind::Guid | AtomKind::Sha1 => {
            let mut s = String::with_capacity(bytes.len() * 2);
            for b in bytes {
                s.push_str(&format!("{b:02x}"));
            }
            s
        }
    }
}

/// A reference-counted interned value.
///
/// Two atoms of the same kind compare equal exactly when they share backing
/// storage, which the table guarantees for equal bytes.
pub struct Atom {
    table: Arc<Mutex<Tables>>,
    kind: AtomKind,
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the backing bytes are immutable and owned by the table, which is
// kept alive by the Arc; the reference count is only touched under the lock.
unsafe impl Send for Atom {}
unsafe impl Sync for Atom {}

impl Atom {
    pub fn kind(&self) -> AtomKind {
        self.kind
    }

    /// The interned bytes. Valid for as long as any clone of this atom
    /// lives.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the table retains the allocation while our count is held.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The interned string, for string atoms.
    pub fn as_str(&self) -> Option<&str> {
        if self.kind == AtomKind::Str {
            std::str::from_utf8(self.as_bytes()).ok()
        } else {
            None
        }
    }

    /// Integer value of a `Uint64` or `Filesize` atom.
    pub fn as_u64(&self) -> Option<u64> {
        match self.kind {
            AtomKind::Uint64 | AtomKind::Filesize => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(self.as_bytes());
                Some(u64::from_be_bytes(raw))
            }
            _ => None,
        }
    }

    /// Address of the shared backing storage; equal atoms share it.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Current reference count, for diagnostics.
    pub fn ref_count(&self) -> usize {
        let t = self.table.lock();
        *t.by_kind[self.kind.index()]
            .get(self.as_bytes())
            .expect("interned atom present in table")
    }
}

impl Clone for Atom {
    fn clone(&self) -> Self {
        let mut t = self.table.lock();
        let rc = t.by_kind[self.kind.index()]
            .get_mut(self.as_bytes())
            .expect("interned atom present in table");
        *rc += 1;
        Atom {
            table: Arc::clone(&self.table),
            kind: self.kind,
            ptr: self.ptr,
            len: self.len,
        }
    }
}

impl Drop for Atom {
    fn drop(&mut self) {
        let mut t = self.table.lock();
        let map = &mut t.by_kind[self.kind.index()];
        let rc = map
            .get_mut(self.as_bytes())
            .expect("dropped atom present in table");
        *rc -= 1;
        if *rc == 0 {
            let addr = self.ptr.as_ptr() as usize;
            map.remove(self.as_bytes());
            t.by_addr.remove(&addr);
        }
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.ptr == other.ptr
    }
}

impl Eq for Atom {}

impl std::hash::Hash for Atom {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        (self.ptr.as_ptr() as usize).hash(state);
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Atom({}: {})",
            self.kind.name(),
            printable(self.kind, self.as_bytes())
        )
    }
}
