//! Zone allocator: fixed-size block allocation from page-rounded arenas.
//!
//! A zone hands out blocks of one size from "subzone" arenas obtained from
//! the system allocator. Free blocks are chained through their own first
//! word, so allocation and release are list operations. Zones that grow
//! several subzones and then drain can be put in garbage-collecting mode,
//! where free blocks are tracked per subzone so that empty subzones can be
//! returned to the system.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::collections::HashMap;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Largest block arena a zone will use for one subzone.
pub const MAX_ZONE_SIZE: usize = 32768;

/// Default number of blocks per subzone when the caller gives no hint.
pub const DEFAULT_HINT: usize = 8;

/// Block size at and above which zones are always garbage-collected.
const ALWAYS_GC_THRESH: usize = 4096;

/// Sweep passes an oversized zone must survive before GC mode kicks in.
const OVERSIZE_THRESH: u32 = 90;

/// Minimum subzone age before it may be released.
const GC_SUBZONE_MINLIFE: Duration = Duration::from_secs(5);

/// Maximum subzones released during one sweep.
const GC_SUBZONE_FREEMAX: usize = 64;

/// Initial quota consumption when the process is overloaded.
const GC_SUBZONE_OVERBASE: usize = 48;

/// Tag written into the first word of a live block in debug builds.
const BLOCK_USED_TAG: usize = 0xff12aa35;

const ALIGN: usize = mem::align_of::<*mut u8>();
const PAGE_SIZE: usize = 4096;

/// Per-block bookkeeping ahead of the user area, debug builds only:
/// a used-tag word and the owning zone, so that double frees and frees to
/// the wrong zone are caught instead of corrupting a free list.
const fn block_overhead() -> usize {
    if cfg!(debug_assertions) {
        2 * mem::size_of::<usize>()
    } else {
        0
    }
}

const fn round_align(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

const fn round_page(n: usize) -> usize {
    (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Whether successive heap allocations tend to get increasing addresses.
/// Decides which end of a zone's address range allocation favors, so that
/// subzones at the other end can drain and be released.
static ADDR_GROWS_UPWARDS: Lazy<bool> = Lazy::new(|| {
    let a = Box::new(0u8);
    let b = Box::new(0u8);
    (&*b as *const u8) > (&*a as *const u8)
});

/// Round a block size up so blocks fit the free-list link and debug
/// overhead, are aligned, and tile a page-rounded arena without waste.
/// Returns the adjusted size and the adjusted blocks-per-subzone count.
fn adjust_size(requested: usize, hint: usize) -> (usize, usize) {
    let mut size = requested.max(mem::size_of::<*mut u8>());
    size += block_overhead();
    size = round_align(size);
    assert!(size < MAX_ZONE_SIZE, "zone block size too large: {requested}");

    let mut hint = if hint == 0 { DEFAULT_HINT } else { hint };
    if hint > MAX_ZONE_SIZE / size {
        hint = MAX_ZONE_SIZE / size;
    }
    let rounded = round_page(size * hint);
    hint = rounded / size;
    let wasted = rounded - size * hint;

    // Tail waste in the page-rounded arena means a slightly bigger block
    // can tile it better; this also makes nearby sizes share one zone.
    if wasted > 0 {
        let adjusted = (rounded / hint / ALIGN) * ALIGN;
        debug_assert!(adjusted >= size);
        size = adjusted;
    }
    debug_assert_eq!(rounded / size, hint);
    (size, hint)
}

/// One arena of `hint` blocks.
struct Subzone {
    base: NonNull<u8>,
    size: usize,
    ctime: Instant,
}

impl Subzone {
    fn new(arena_size: usize) -> Self {
        let layout = Layout::from_size_align(arena_size, ALIGN).expect("arena layout");
        // SAFETY: layout has non-zero size.
        let p = unsafe { alloc(layout) };
        let base = match NonNull::new(p) {
            Some(nn) => nn,
            None => handle_alloc_error(layout),
        };
        Subzone {
            base,
            size: arena_size,
            ctime: Instant::now(),
        }
    }

    fn end(&self) -> *mut u8 {
        // SAFETY: one-past-the-end of the owned arena.
        unsafe { self.base.as_ptr().add(self.size) }
    }

    fn contains(&self, p: *mut u8) -> bool {
        p >= self.base.as_ptr() && p < self.end()
    }

    fn release(self) {
        let layout = Layout::from_size_align(self.size, ALIGN).expect("arena layout");
        // SAFETY: base was returned by alloc() with this layout.
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

/// Per-subzone free-block tracking, sorted by base address.
struct SubzInfo {
    base: *mut u8,
    end: *mut u8,
    /// Head of this subzone's free list (null when none).
    free: *mut u8,
    free_cnt: usize,
}

impl SubzInfo {
    fn contains(&self, p: *mut u8) -> bool {
        p >= self.base && p < self.end
    }
}

/// Garbage-collection state for a zone.
struct Gc {
    subzinfo: Vec<SubzInfo>,
    /// Index of the first subzone to allocate from (direction-aware).
    first_free: usize,
    /// Re-scan every subzone at the next sweep.
    scan_all: bool,
    start: Instant,
    zones_freed: u64,
    zones_defragmented: u64,
}

/// Quota shared by all zones during one sweep.
struct SweepQuota {
    subzones_freed: usize,
    /// False when coming from the regular free path, where no quota applies.
    sweeping: bool,
}

impl SweepQuota {
    fn run(overloaded: bool) -> Self {
        SweepQuota {
            subzones_freed: if overloaded { GC_SUBZONE_OVERBASE } else { 0 },
            sweeping: true,
        }
    }

    fn free_path() -> Self {
        SweepQuota {
            subzones_freed: 0,
            sweeping: false,
        }
    }

    fn exhausted(&self) -> bool {
        self.sweeping && self.subzones_freed >= GC_SUBZONE_FREEMAX
    }
}

/// Counters for one zone, readable as a snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ZoneStats {
    pub allocations: u64,
    pub freeings: u64,
    pub subzones_allocated: u64,
    pub subzones_freed: u64,
    pub zmove_attempts: u64,
    pub zmove_successful: u64,
    pub blocks: usize,
    pub used: usize,
    pub subzones: usize,
    pub gc_on: bool,
}

struct ZoneInner {
    size: usize,
    hint: usize,
    subzones: Vec<Subzone>,
    /// Free-list head when not in GC mode; blocks link through their first
    /// word.
    free: *mut u8,
    blocks: usize,
    used: usize,
    oversized: u32,
    always_gc: bool,
    min_lifetime: Duration,
    gc: Option<Gc>,
    stats: ZoneStats,
}

// SAFETY: the raw pointers all reference arenas exclusively owned by this
// value and only dereferenced under the zone mutex.
unsafe impl Send for ZoneInner {}

/// A zone allocating fixed-size blocks.
///
/// `alloc` hands out a block of `block_capacity()` bytes; the caller must
/// return each block exactly once with `free`. Zones are shared through
/// `Arc` and internally locked.
pub struct Zone {
    size: usize,
    hint: usize,
    /// Explicit sharing count for registry-managed zones.
    refcnt: AtomicUsize,
    inner: Mutex<ZoneInner>,
}

impl Zone {
    /// Create a private zone for blocks of `requested` bytes, sized for
    /// about `hint` blocks per subzone (0 picks a default).
    pub fn new(requested: usize, hint: usize) -> Arc<Zone> {
        Self::create(requested, hint, false)
    }

    fn create(requested: usize, hint: usize, always_gc: bool) -> Arc<Zone> {
        let (size, hint) = adjust_size(requested, hint);
        let arena_size = size * hint;
        let sz = Subzone::new(arena_size);
        let free = sz.base.as_ptr();
        // SAFETY: fresh arena of arena_size bytes.
        unsafe { cram(free, arena_size, size) };
        let inner = ZoneInner {
            size,
            hint,
            subzones: vec![sz],
            free,
            blocks: hint,
            used: 0,
            oversized: 0,
            always_gc: always_gc || size >= ALWAYS_GC_THRESH,
            min_lifetime: GC_SUBZONE_MINLIFE,
            gc: None,
            stats: ZoneStats::default(),
        };
        Arc::new(Zone {
            size,
            hint,
            refcnt: AtomicUsize::new(1),
            inner: Mutex::new(inner),
        })
    }

    /// Adjusted block size, including any debug overhead.
    pub fn block_size(&self) -> usize {
        self.size
    }

    /// Usable bytes in each allocated block.
    pub fn block_capacity(&self) -> usize {
        self.size - block_overhead()
    }

    /// Blocks per subzone after size adjustment.
    pub fn hint(&self) -> usize {
        self.hint
    }

    /// Number of blocks currently handed out.
    pub fn used_count(&self) -> usize {
        self.inner.lock().used
    }

    /// Allocate one block.
    pub fn alloc(&self) -> NonNull<u8> {
        let mut inner = self.inner.lock();
        inner.stats.allocations += 1;
        let blk = if inner.gc.is_some() {
            inner.gc_alloc()
        } else if !inner.free.is_null() {
            let blk = inner.free;
            // SAFETY: blk heads the free list; its first word links onward.
            inner.free = unsafe { *(blk as *const *mut u8) };
            blk
        } else {
            let blk = inner.extend();
            // SAFETY: extend crammed a fresh subzone headed by blk.
            inner.free = unsafe { *(blk as *const *mut u8) };
            blk
        };
        inner.used += 1;
        let p = inner.prepare(blk);
        // SAFETY: blocks are non-null arena interior pointers.
        unsafe { NonNull::new_unchecked(p) }
    }

    /// Return a block to the zone.
    ///
    /// # Safety
    ///
    /// `p` must come from `alloc` on this zone and not have been freed.
    pub unsafe fn free(&self, p: NonNull<u8>) {
        let mut inner = self.inner.lock();
        inner.stats.freeings += 1;
        let blk = inner.check(p.as_ptr());
        assert!(inner.used > 0, "freeing into an empty zone");
        inner.used -= 1;
        if inner.gc.is_some() {
            let mut quota = SweepQuota::free_path();
            inner.gc_insert_freelist(blk, &mut quota);
        } else {
            // SAFETY: blk is a free block now; use its first word as link.
            unsafe { *(blk as *mut *mut u8) = inner.free };
            inner.free = blk;
        }
    }

    /// Move a block to a better location when the zone is garbage
    /// collected, so that its original subzone can drain. Returns the new
    /// block address, or `p` unchanged when no better place exists.
    ///
    /// # Safety
    ///
    /// `p` must come from `alloc` on this zone and not have been freed.
    /// The caller must update every pointer to the block.
    pub unsafe fn move_block(&self, p: NonNull<u8>) -> NonNull<u8> {
        let mut inner = self.inner.lock();
        inner.stats.zmove_attempts += 1;
        // SAFETY: per contract, p is a live block of this zone.
        unsafe { inner.gc_move(p) }
    }

    /// One sweep pass over this zone: detect oversizing, run or retire the
    /// garbage collector. Normally invoked via [`ZonePool::sweep`].
    fn sweep_pass(&self, quota: &mut SweepQuota) {
        self.inner.lock().spot_oversized(quota);
    }

    /// Snapshot of the zone's counters.
    pub fn stats(&self) -> ZoneStats {
        let inner = self.inner.lock();
        let mut s = inner.stats;
        s.blocks = inner.blocks;
        s.used = inner.used;
        s.subzones = inner.subzones.len();
        s.gc_on = inner.gc.is_some();
        s
    }

    #[cfg(test)]
    fn set_min_lifetime(&self, d: Duration) {
        self.inner.lock().min_lifetime = d;
    }

    #[cfg(test)]
    fn force_sweep(&self, quota: &mut SweepQuota) {
        self.sweep_pass(quota);
    }
}

impl Drop for Zone {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.used > 0 {
            warn!(
                block_size = inner.size,
                used = inner.used,
                "destroyed zone still holds blocks"
            );
        }
        for sz in inner.subzones.drain(..) {
            sz.release();
        }
    }
}

/// Chain all blocks of a fresh arena through their first word, last block
/// linking to null.
unsafe fn cram(base: *mut u8, arena_size: usize, size: usize) {
    let n = arena_size / size;
    for i in 0..n {
        // SAFETY: caller guarantees base..base+arena_size is owned.
        unsafe {
            let p = base.add(i * size) as *mut *mut u8;
            *p = if i + 1 < n {
                base.add((i + 1) * size)
            } else {
                ptr::null_mut()
            };
        }
    }
}

impl ZoneInner {
    fn arena_size(&self) -> usize {
        self.size * self.hint
    }

    /// Mark a block used and return the user pointer past the overhead.
    fn prepare(&mut self, blk: *mut u8) -> *mut u8 {
        if cfg!(debug_assertions) {
            // SAFETY: blk points at a full-size block of this zone.
            unsafe {
                let w = blk as *mut usize;
                *w = BLOCK_USED_TAG;
                *w.add(1) = self as *const ZoneInner as usize;
            }
        }
        // SAFETY: overhead is included in the block size.
        unsafe { blk.add(block_overhead()) }
    }

    /// Map a user pointer back to its block, verifying the debug tag.
    fn check(&self, p: *mut u8) -> *mut u8 {
        // SAFETY: per free() contract, p sits block_overhead() bytes into
        // a block of this zone.
        let blk = unsafe { p.sub(block_overhead()) };
        if cfg!(debug_assertions) {
            // SAFETY: same block, reading the two overhead words.
            unsafe {
                let w = blk as *const usize;
                assert!(
                    *w == BLOCK_USED_TAG,
                    "block {p:?} already freed or corrupted"
                );
                assert!(
                    *w.add(1) == self as *const ZoneInner as usize,
                    "block {p:?} freed to the wrong zone"
                );
            }
        }
        blk
    }

    /// Grow the zone by one subzone; returns its first (free) block with
    /// the rest of the subzone crammed behind it.
    fn extend(&mut self) -> *mut u8 {
        let arena_size = self.arena_size();
        let sz = Subzone::new(arena_size);
        let base = sz.base.as_ptr();
        // SAFETY: fresh arena.
        unsafe { cram(base, arena_size, self.size) };
        self.subzones.push(sz);
        self.blocks += self.hint;
        self.stats.subzones_allocated += 1;
        base
    }

    /// Drop every subzone but the first and restart from a full free list.
    /// Only correct when no block is allocated.
    fn shrink(&mut self) {
        debug_assert_eq!(self.used, 0);
        debug_assert!(self.gc.is_none());
        for sz in self.subzones.drain(1..) {
            sz.release();
            self.stats.subzones_freed += 1;
        }
        let arena_size = self.arena_size();
        let base = self.subzones[0].base.as_ptr();
        // SAFETY: sole remaining arena, and no live blocks.
        unsafe { cram(base, arena_size, self.size) };
        self.free = base;
        self.blocks = self.hint;
        self.oversized = 0;
        debug!(block_size = self.size, "zone shrunk back to one subzone");
    }

    /// A subzone is considered an address-space fragment when no sibling
    /// subzone lies within one arena length of it.
    fn is_fragment(&self, base: *mut u8) -> bool {
        let arena = self.arena_size() as isize;
        !self.subzones.iter().any(|sz| {
            let other = sz.base.as_ptr();
            other != base && (other as isize - base as isize).abs() <= 2 * arena
        })
    }

    // --- garbage-collection mode ---

    /// Binary search of the sorted subzinfo array. `Ok` holds the index of
    /// the subzone containing `p`, `Err` the insertion point.
    fn gc_find(gc: &Gc, p: *mut u8) -> Result<usize, usize> {
        gc.subzinfo.binary_search_by(|szi| {
            if szi.end <= p {
                std::cmp::Ordering::Less
            } else if szi.base > p {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        })
    }

    /// Switch the zone into garbage-collecting mode, dispatching the free
    /// list onto per-subzone lists.
    fn gc_enable(&mut self, quota: &mut SweepQuota) {
        debug_assert!(self.gc.is_none());
        let mut subzinfo: Vec<SubzInfo> = self
            .subzones
            .iter()
            .map(|sz| SubzInfo {
                base: sz.base.as_ptr(),
                end: sz.end(),
                free: ptr::null_mut(),
                free_cnt: 0,
            })
            .collect();
        subzinfo.sort_by_key(|szi| szi.base as usize);
        let first_free = if *ADDR_GROWS_UPWARDS {
            0
        } else {
            subzinfo.len() - 1
        };
        debug!(
            block_size = self.size,
            subzones = self.subzones.len(),
            free = self.blocks - self.used,
            "zone enters garbage-collecting mode"
        );
        self.gc = Some(Gc {
            subzinfo,
            first_free,
            scan_all: false,
            start: Instant::now(),
            zones_freed: 0,
            zones_defragmented: 0,
        });
        while !self.free.is_null() {
            let blk = self.free;
            // SAFETY: free-list block; first word is the link.
            self.free = unsafe { *(blk as *const *mut u8) };
            self.gc_insert_freelist(blk, quota);
        }
    }

    /// Leave garbage-collecting mode, folding per-subzone free lists back
    /// into the main one.
    fn gc_disable(&mut self) {
        let gc = match self.gc.take() {
            Some(g) => g,
            None => return,
        };
        debug!(
            block_size = self.size,
            freed = gc.zones_freed,
            defragmented = gc.zones_defragmented,
            elapsed_secs = gc.start.elapsed().as_secs(),
            "zone leaves garbage-collecting mode"
        );
        // Reinsert in reverse subzone order to keep each subzone's blocks
        // adjacent in the rebuilt list.
        for szi in gc.subzinfo.iter().rev() {
            let mut blk = szi.free;
            while !blk.is_null() {
                // SAFETY: blocks on a subzone free list.
                unsafe {
                    let next = *(blk as *const *mut u8);
                    *(blk as *mut *mut u8) = self.free;
                    self.free = blk;
                    blk = next;
                }
            }
        }
    }

    /// Push a free block onto its subzone's list; release the subzone when
    /// it becomes fully free and policy allows.
    fn gc_insert_freelist(&mut self, blk: *mut u8, quota: &mut SweepQuota) {
        let hint = self.hint;
        let gc = self.gc.as_mut().expect("gc mode");
        let idx = match Self::gc_find(gc, blk) {
            Ok(i) => i,
            Err(_) => panic!("freed block {blk:?} belongs to no subzone"),
        };
        let szi = &mut gc.subzinfo[idx];
        debug_assert!(szi.contains(blk));
        // SAFETY: blk is free; its first word becomes the list link.
        unsafe { *(blk as *mut *mut u8) = szi.free };
        szi.free = blk;
        szi.free_cnt += 1;

        // Keep allocations coming from the subzones least likely to become
        // reclaimable, so the others can drain.
        if *ADDR_GROWS_UPWARDS {
            if idx < gc.first_free {
                gc.first_free = idx;
            }
        } else if idx > gc.first_free {
            gc.first_free = idx;
        }

        if gc.subzinfo[idx].free_cnt == hint {
            self.gc_subzone_free(idx, quota);
        }
    }

    /// Try to release a fully-free subzone. Policy keeps the last subzone,
    /// young subzones and anything beyond the sweep quota.
    fn gc_subzone_free(&mut self, idx: usize, quota: &mut SweepQuota) -> bool {
        debug_assert!(self.gc.is_some());
        debug_assert_eq!(self.gc.as_ref().map(|g| g.subzinfo[idx].free_cnt), Some(self.hint));
        let base = self.gc.as_ref().map(|g| g.subzinfo[idx].base).unwrap_or(ptr::null_mut());
        let szidx = self
            .subzones
            .iter()
            .position(|sz| sz.base.as_ptr() == base)
            .expect("subzone for subzinfo");

        // The sole subzone is never released: that would leave the zone
        // without free blocks. If it is an address-space fragment, though,
        // reallocate it elsewhere to help defragmenting.
        if self.subzones.len() == 1 {
            if self.is_fragment(base) {
                self.gc_defragment(idx, szidx);
            }
            return false;
        }

        let fragment = self.is_fragment(base);
        if !fragment {
            // Rapid alloc/free cycles should not thrash subzones: keep
            // young ones, and be extra patient when exactly one subzone
            // worth of blocks is free.
            let age = self.subzones[szidx].ctime.elapsed();
            if age < self.min_lifetime {
                if let Some(gc) = self.gc.as_mut() {
                    gc.scan_all = true;
                }
                return false;
            }
            if self.blocks - self.used == self.hint && age < 5 * self.min_lifetime {
                if let Some(gc) = self.gc.as_mut() {
                    gc.scan_all = true;
                }
                return false;
            }
        }

        if quota.exhausted() {
            if let Some(gc) = self.gc.as_mut() {
                gc.scan_all = true;
            }
            return false;
        }

        let sz = self.subzones.swap_remove(szidx);
        sz.release();
        self.blocks -= self.hint;
        self.stats.subzones_freed += 1;
        quota.subzones_freed += 1;

        let gc = self.gc.as_mut().expect("gc mode");
        gc.zones_freed += 1;
        gc.subzinfo.remove(idx);
        // Keep the allocation start index valid and on the right side.
        if idx == gc.subzinfo.len() {
            if gc.first_free == gc.subzinfo.len() && !gc.subzinfo.is_empty() {
                gc.first_free -= 1;
            }
        } else if gc.first_free > idx {
            gc.first_free -= 1;
        }
        debug!(
            block_size = self.size,
            subzones = self.subzones.len(),
            fragment,
            "released an empty subzone"
        );
        true
    }

    /// Free a fragment subzone's arena and recreate it elsewhere.
    fn gc_defragment(&mut self, idx: usize, szidx: usize) {
        let arena_size = self.arena_size();
        let old = mem::replace(&mut self.subzones[szidx], Subzone::new(arena_size));
        old.release();
        let base = self.subzones[szidx].base.as_ptr();
        // SAFETY: fresh arena, fully free.
        unsafe { cram(base, arena_size, self.size) };
        let hint = self.hint;
        let gc = self.gc.as_mut().expect("gc mode");
        gc.zones_defragmented += 1;
        gc.subzinfo.remove(idx);
        let end = unsafe { base.add(arena_size) };
        let at = match Self::gc_find(gc, base) {
            Ok(_) => panic!("recreated subzone already tracked"),
            Err(low) => low,
        };
        gc.subzinfo.insert(
            at,
            SubzInfo {
                base,
                end,
                free: base,
                free_cnt: hint,
            },
        );
        gc.first_free = at;
        debug!(block_size = self.size, "fragment subzone reallocated");
    }

    /// GC-mode allocation: take from the first direction-preferred subzone
    /// holding free blocks, extending or retiring GC when all are full.
    fn gc_alloc(&mut self) -> *mut u8 {
        let gc = self.gc.as_mut().expect("gc mode");
        let n = gc.subzinfo.len();
        let found = if *ADDR_GROWS_UPWARDS {
            (gc.first_free..n).find(|&i| {
                if gc.subzinfo[i].free.is_null() {
                    if i + 1 < n {
                        gc.first_free = i + 1;
                    }
                    false
                } else {
                    true
                }
            })
        } else {
            (0..=gc.first_free).rev().find(|&i| {
                if gc.subzinfo[i].free.is_null() {
                    if i > 0 {
                        gc.first_free = i - 1;
                    }
                    false
                } else {
                    true
                }
            })
        };

        if let Some(i) = found {
            let szi = &mut gc.subzinfo[i];
            let blk = szi.free;
            // SAFETY: non-null free-list head of this subzone.
            szi.free = unsafe { *(blk as *const *mut u8) };
            szi.free_cnt -= 1;
            return blk;
        }

        // Every subzone is full. Zones in permanent collection extend
        // under GC tracking; others fall back to plain allocation.
        debug_assert_eq!(self.blocks, self.used);
        if self.always_gc {
            self.gc_extend()
        } else {
            self.gc_disable();
            let blk = self.extend();
            // SAFETY: fresh crammed subzone headed by blk.
            self.free = unsafe { *(blk as *const *mut u8) };
            blk
        }
    }

    /// Extend a zone kept under GC tracking; returns the first free block
    /// of the new subzone.
    fn gc_extend(&mut self) -> *mut u8 {
        let blk = self.extend();
        self.free = ptr::null_mut(); // GC mode never uses the main list
        let sz = self.subzones.last().expect("extended");
        let base = sz.base.as_ptr();
        let end = sz.end();
        let hint = self.hint;
        let gc = self.gc.as_mut().expect("gc mode");
        let at = match Self::gc_find(gc, base) {
            Ok(_) => panic!("new subzone already tracked"),
            Err(low) => low,
        };
        // SAFETY: blk is the crammed subzone's first block.
        let next = unsafe { *(blk as *const *mut u8) };
        gc.subzinfo.insert(
            at,
            SubzInfo {
                base,
                end,
                free: next,
                free_cnt: hint - 1,
            },
        );
        if *ADDR_GROWS_UPWARDS {
            if gc.first_free > at {
                gc.first_free = at;
            }
        } else if gc.first_free <= at {
            gc.first_free = at;
        } else {
            gc.first_free += 1;
        }
        blk
    }

    /// Relocate a live block into an "earlier" subzone with free space.
    ///
    /// # Safety
    ///
    /// `p` must be a live block of this zone.
    unsafe fn gc_move(&mut self, p: NonNull<u8>) -> NonNull<u8> {
        if self.gc.is_none() || self.blocks == self.used {
            return p;
        }
        let blk = self.check(p.as_ptr());
        let gc = self.gc.as_ref().expect("gc mode");
        let i = match Self::gc_find(gc, blk) {
            Ok(i) => i,
            Err(_) => panic!("moved block {blk:?} belongs to no subzone"),
        };
        // Nothing to gain when all free blocks sit in this same subzone.
        if self.blocks - self.used == gc.subzinfo[i].free_cnt {
            return p;
        }

        let target = if *ADDR_GROWS_UPWARDS {
            (gc.first_free..i).find(|&j| !gc.subzinfo[j].free.is_null())
        } else {
            (i + 1..=gc.first_free).rev().find(|&j| !gc.subzinfo[j].free.is_null())
        };
        let j = match target {
            Some(j) => j,
            None => return p,
        };

        let gc = self.gc.as_mut().expect("gc mode");
        let nszi = &mut gc.subzinfo[j];
        let nblk = nszi.free;
        // SAFETY: non-null free block of the target subzone.
        nszi.free = unsafe { *(nblk as *const *mut u8) };
        nszi.free_cnt -= 1;

        // SAFETY: both blocks span self.size bytes and cannot overlap.
        unsafe { ptr::copy_nonoverlapping(blk, nblk, self.size) };
        let np = self.prepare(nblk);
        self.stats.zmove_successful += 1;

        let mut quota = SweepQuota::free_path();
        self.gc_insert_freelist(blk, &mut quota);
        // SAFETY: np points into an owned arena.
        unsafe { NonNull::new_unchecked(np) }
    }

    /// Walk subzones looking for fully-free ones old enough to release.
    fn gc_scan(&mut self, quota: &mut SweepQuota) {
        let mut must_continue = false;
        let mut i = self.gc.as_ref().map(|g| g.first_free).unwrap_or(0);
        loop {
            let gc = match self.gc.as_ref() {
                Some(g) => g,
                None => return,
            };
            if i >= gc.subzinfo.len() {
                break;
            }
            // A zone below one subzone worth of free blocks cannot hold a
            // free subzone; no point continuing.
            if self.blocks - self.used < self.hint {
                must_continue = false;
                break;
            }
            if quota.exhausted() {
                must_continue = true;
                break;
            }
            if gc.subzinfo[i].free_cnt == self.hint {
                if self.gc_subzone_free(i, quota) {
                    continue;
                }
                must_continue = true;
            }
            i += 1;
        }
        if !must_continue {
            if let Some(gc) = self.gc.as_mut() {
                gc.scan_all = false;
            }
        }
    }

    /// One sweep step: spot oversized zones, shrink or collect them, and
    /// run pending scans.
    fn spot_oversized(&mut self, quota: &mut SweepQuota) {
        let free_blocks = self.blocks - self.used;
        if self.gc.is_none()
            && self.subzones.len() > 1
            && free_blocks >= self.hint + self.hint / 2
        {
            self.oversized += 1;
            if self.oversized >= OVERSIZE_THRESH
                || self.always_gc
                || free_blocks >= 4 * self.hint
            {
                if self.used == 0 {
                    self.shrink();
                } else {
                    self.gc_enable(quota);
                    if self.subzones.len() == 1 && !self.always_gc {
                        self.gc_disable();
                    }
                }
                self.oversized = 0;
            }
        } else if self.always_gc {
            if self.gc.is_none() {
                self.gc_enable(quota);
            } else if self.gc.as_ref().map(|g| g.scan_all).unwrap_or(false) {
                self.gc_scan(quota);
            }
        } else {
            if self.gc.as_ref().map(|g| g.scan_all).unwrap_or(false) {
                self.gc_scan(quota);
            }
            self.oversized = 0;
        }
    }
}

/// Registry of shared zones keyed by adjusted block size.
///
/// `get` returns the zone for a size, creating it on first use; equal
/// adjusted sizes share one zone through reference counting. `sweep` is
/// the periodic garbage-collection entry point.
pub struct ZonePool {
    zones: Mutex<HashMap<usize, Arc<Zone>>>,
    last_sweep: Mutex<Option<Instant>>,
    always_gc: AtomicBool,
    sweeps: AtomicUsize,
    sweeps_throttled: AtomicUsize,
}

impl Default for ZonePool {
    fn default() -> Self {
        Self::new()
    }
}

impl ZonePool {
    pub fn new() -> Self {
        ZonePool {
            zones: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(None),
            always_gc: AtomicBool::new(false),
            sweeps: AtomicUsize::new(0),
            sweeps_throttled: AtomicUsize::new(0),
        }
    }

    /// Put every zone permanently in garbage-collecting mode, present and
    /// future.
    pub fn set_always_gc(&self, on: bool) {
        self.always_gc.store(on, Ordering::Relaxed);
        if on {
            for z in self.zones.lock().values() {
                z.inner.lock().always_gc = true;
            }
        }
    }

    /// Get or create the shared zone for blocks of `requested` bytes.
    pub fn get(&self, requested: usize, hint: usize) -> Arc<Zone> {
        let (size, _) = adjust_size(requested, hint);
        let mut zones = self.zones.lock();
        if let Some(z) = zones.get(&size) {
            z.refcnt.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(z);
        }
        let z = Zone::create(requested, hint, self.always_gc.load(Ordering::Relaxed));
        zones.insert(size, Arc::clone(&z));
        z
    }

    /// Drop one reference to a shared zone; the last release removes it
    /// from the registry and frees its arenas. The zone must have been
    /// obtained from `get` on this pool.
    pub fn release(&self, zone: &Arc<Zone>) {
        if zone.refcnt.fetch_sub(1, Ordering::Relaxed) == 1 {
            let mut zones = self.zones.lock();
            if let Some(z) = zones.get(&zone.block_size()) {
                debug_assert!(
                    Arc::ptr_eq(z, zone),
                    "released zone does not come from this pool"
                );
                if Arc::ptr_eq(z, zone) {
                    zones.remove(&zone.block_size());
                }
            }
        }
    }

    /// Number of live zones in the registry.
    pub fn len(&self) -> usize {
        self.zones.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.lock().is_empty()
    }

    /// Periodic garbage collection over every zone, throttled to one run
    /// per second. With `overloaded` set, most of the per-run subzone
    /// release quota is withheld.
    pub fn sweep(&self, overloaded: bool) {
        {
            let mut last = self.last_sweep.lock();
            let now = Instant::now();
            if let Some(prev) = *last {
                if now.duration_since(prev) < Duration::from_secs(1) {
                    self.sweeps_throttled.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
            *last = Some(now);
        }
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        let mut quota = SweepQuota::run(overloaded);
        let zones: Vec<Arc<Zone>> = self.zones.lock().values().cloned().collect();
        for z in zones {
            z.sweep_pass(&mut quota);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn drain(zone: &Arc<Zone>, n: usize) -> Vec<NonNull<u8>> {
        (0..n).map(|_| zone.alloc()).collect()
    }

    unsafe fn free_all(zone: &Arc<Zone>, blocks: Vec<NonNull<u8>>) {
        for b in blocks {
            zone.free(b);
        }
    }

    #[test]
    fn adjusted_size_fits_pointer_and_alignment() {
        let (size, hint) = adjust_size(1, 0);
        assert!(size >= mem::size_of::<*mut u8>() + block_overhead());
        assert_eq!(size % ALIGN, 0);
        assert!(hint > 0);
        assert_eq!(round_page(size * hint), size * hint);
    }

    #[test]
    fn nearby_sizes_share_adjusted_size() {
        // Block sizes tile page-rounded arenas, so close requests collapse.
        let (a, _) = adjust_size(3100, 0);
        let (b, _) = adjust_size(3101, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn hint_zero_uses_default() {
        let z = Zone::new(64, 0);
        assert!(z.hint() >= DEFAULT_HINT);
    }

    #[test]
    fn alloc_free_accounting() {
        let z = Zone::new(32, 16);
        assert_eq!(z.used_count(), 0);
        let blocks = drain(&z, 10);
        assert_eq!(z.used_count(), 10);
        let set: HashSet<usize> = blocks.iter().map(|p| p.as_ptr() as usize).collect();
        assert_eq!(set.len(), 10, "blocks must be distinct");
        unsafe { free_all(&z, blocks) };
        assert_eq!(z.used_count(), 0);
    }

    #[test]
    fn blocks_hold_their_capacity() {
        let z = Zone::new(24, 8);
        assert!(z.block_capacity() >= 24);
        let p = z.alloc();
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), 0xa5, z.block_capacity());
            assert_eq!(*p.as_ptr(), 0xa5);
            z.free(p);
        }
    }

    #[test]
    fn freed_block_is_reused_first() {
        let z = Zone::new(32, 8);
        let a = z.alloc();
        let keep = z.alloc();
        unsafe { z.free(a) };
        let b = z.alloc();
        assert_eq!(a.as_ptr(), b.as_ptr());
        unsafe {
            z.free(b);
            z.free(keep);
        }
    }

    #[test]
    fn zone_extends_past_first_subzone() {
        let z = Zone::new(32, 4);
        let hint = z.hint();
        let blocks = drain(&z, hint * 3 + 1);
        assert!(z.stats().subzones >= 4);
        assert_eq!(z.used_count(), hint * 3 + 1);
        unsafe { free_all(&z, blocks) };
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "already freed")]
    fn double_free_panics() {
        let z = Zone::new(32, 8);
        let p = z.alloc();
        unsafe {
            z.free(p);
            z.free(p);
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "wrong zone")]
    fn wrong_zone_free_panics() {
        let a = Zone::new(32, 8);
        let b = Zone::new(32, 8);
        let p = a.alloc();
        unsafe { b.free(p) };
    }

    #[test]
    fn randomized_alloc_free_churn() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let z = Zone::new(40, 8);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut live: Vec<NonNull<u8>> = Vec::new();
        for i in 0..4000u32 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let p = z.alloc();
                unsafe {
                    std::ptr::write_bytes(p.as_ptr(), (i & 0xff) as u8, z.block_capacity());
                }
                live.push(p);
            } else {
                let idx = rng.gen_range(0..live.len());
                let p = live.swap_remove(idx);
                unsafe { z.free(p) };
            }
            assert_eq!(z.used_count(), live.len());
        }
        unsafe { free_all(&z, live) };
        assert_eq!(z.used_count(), 0);
    }

    #[test]
    fn concurrent_alloc_free_on_shared_zone() {
        let z = Zone::new(32, 8);
        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let z = Arc::clone(&z);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let blocks: Vec<NonNull<u8>> = (0..8)
                            .map(|_| {
                                let p = z.alloc();
                                // Scribble the thread id so cross-thread
                                // block sharing would be caught below.
                                unsafe {
                                    std::ptr::write_bytes(p.as_ptr(), t, z.block_capacity());
                                }
                                p
                            })
                            .collect();
                        for p in blocks {
                            unsafe {
                                assert_eq!(*p.as_ptr(), t, "block handed to two threads");
                                z.free(p);
                            }
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(z.used_count(), 0);
        let s = z.stats();
        assert_eq!(s.allocations, s.freeings);
        assert_eq!(s.allocations, 4 * 200 * 8);
    }

    #[test]
    fn pool_shares_zones_by_adjusted_size() {
        let pool = ZonePool::new();
        let a = pool.get(3100, 0);
        let b = pool.get(3101, 0);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
        pool.release(&a);
        assert_eq!(pool.len(), 1);
        pool.release(&b);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn pool_distinct_sizes_get_distinct_zones() {
        let pool = ZonePool::new();
        let a = pool.get(16, 0);
        let b = pool.get(512, 0);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 2);
        pool.release(&a);
        pool.release(&b);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "does not come from this pool")]
    fn pool_release_of_foreign_zone_panics() {
        let pool = ZonePool::new();
        let _pooled = pool.get(64, 0);
        let foreign = Zone::new(64, 0);
        pool.release(&foreign);
    }

    #[test]
    fn sweep_is_throttled() {
        let pool = ZonePool::new();
        let _z = pool.get(64, 0);
        pool.sweep(false);
        pool.sweep(false);
        assert_eq!(pool.sweeps_throttled.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn empty_oversized_zone_shrinks() {
        let z = Zone::new(32, 4);
        let hint = z.hint();
        let blocks = drain(&z, hint * 6);
        unsafe { free_all(&z, blocks) };
        assert!(z.stats().subzones >= 6);
        // Free blocks >= 4 * hint triggers collection unconditionally and,
        // with nothing allocated, a shrink.
        let mut quota = SweepQuota::run(false);
        z.force_sweep(&mut quota);
        let s = z.stats();
        assert_eq!(s.subzones, 1);
        assert_eq!(s.blocks, hint);
        assert!(!s.gc_on);
    }

    #[test]
    fn gc_releases_drained_subzones() {
        let z = Zone::new(32, 4);
        z.set_min_lifetime(Duration::from_millis(0));
        let hint = z.hint();
        let mut blocks = drain(&z, hint * 6);
        let keep = blocks.remove(0); // keep the zone non-empty
        unsafe { free_all(&z, blocks) };

        let before = z.stats();
        assert!(before.subzones >= 6);
        let mut quota = SweepQuota::run(false);
        z.force_sweep(&mut quota);
        let after = z.stats();
        assert!(after.subzones < before.subzones);
        assert_eq!(z.used_count(), 1);
        unsafe { z.free(keep) };
    }

    #[test]
    fn gc_mode_allocates_and_frees() {
        let z = Zone::new(32, 4);
        z.set_min_lifetime(Duration::from_secs(3600)); // keep subzones
        let hint = z.hint();
        let mut blocks = drain(&z, hint * 5);
        // Pin one block per subzone so none can be released and collection
        // stays on.
        let keep: Vec<_> = (0..5).rev().map(|i| blocks.remove(i * hint)).collect();
        unsafe { free_all(&z, blocks) };
        let mut quota = SweepQuota::run(false);
        z.force_sweep(&mut quota);
        assert!(z.stats().gc_on);

        // Allocation and release keep working under collection.
        let more = drain(&z, hint * 2);
        assert_eq!(z.used_count(), hint * 2 + 5);
        unsafe { free_all(&z, more) };
        assert_eq!(z.used_count(), 5);
        unsafe { free_all(&z, keep) };
    }

    #[test]
    fn move_block_relocates_under_gc() {
        let z = Zone::new(32, 4);
        z.set_min_lifetime(Duration::from_secs(3600)); // no releases
        let hint = z.hint();
        let blocks = drain(&z, hint * 5);

        // Free everything except one block, keeping GC from releasing.
        let (last, rest) = blocks.split_last().unwrap();
        let last = *last;
        unsafe {
            for &b in rest {
                z.free(b);
            }
        }
        let mut quota = SweepQuota::run(false);
        z.force_sweep(&mut quota);
        assert!(z.stats().gc_on);

        unsafe {
            std::ptr::write_bytes(last.as_ptr(), 0x5c, z.block_capacity());
            let moved = z.move_block(last);
            assert_eq!(*moved.as_ptr(), 0x5c, "content must follow the block");
            z.free(moved);
        }
        assert_eq!(z.used_count(), 0);
    }

    #[test]
    fn move_block_without_gc_is_identity() {
        let z = Zone::new(32, 8);
        let p = z.alloc();
        let q = unsafe { z.move_block(p) };
        assert_eq!(p.as_ptr(), q.as_ptr());
        unsafe { z.free(q) };
    }

    #[test]
    fn large_blocks_always_collect() {
        let z = Zone::new(ALWAYS_GC_THRESH + 16, 2);
        z.set_min_lifetime(Duration::from_millis(0));
        let hint = z.hint();
        let mut blocks = drain(&z, hint * 3);
        let keep = blocks.remove(0);
        unsafe { free_all(&z, blocks) };
        let mut quota = SweepQuota::run(false);
        z.force_sweep(&mut quota);
        assert!(z.stats().gc_on, "big-block zones stay under collection");
        unsafe { z.free(keep) };
    }

    #[test]
    fn stats_track_subzone_churn() {
        let z = Zone::new(32, 4);
        z.set_min_lifetime(Duration::from_millis(0));
        let hint = z.hint();
        let mut blocks = drain(&z, hint * 6);
        let keep = blocks.remove(0);
        unsafe { free_all(&z, blocks) };
        let mut quota = SweepQuota::run(false);
        z.force_sweep(&mut quota);
        let s = z.stats();
        assert!(s.subzones_allocated >= 5);
        assert!(s.subzones_freed > 0);
        assert_eq!(s.allocations, (hint * 6) as u64);
        unsafe { z.free(keep) };
    }
}
