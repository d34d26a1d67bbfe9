//! Message-layer building blocks for a Gnutella-style servent.
//! Host-driven: no I/O; callers feed wire bytes and manage allocation.

pub mod atom;
pub mod chunk;
pub mod cobs;
pub mod ext;
pub mod inflate;
pub mod zone;

pub use atom::{Atom, AtomKind, AtomTable};
pub use chunk::{ChunkDecoder, ChunkError, ChunkProgress};
pub use ext::{ExtKind, ExtParser, ExtToken, Extension};
pub use inflate::InflateLimits;
pub use zone::{Zone, ZonePool};
