#![no_std]

//! Slub allocator: fixed-size object pools over buddy-allocated slabs.
//!
//! Each cache keeps its slabs on three lists (free, partial, full) and each
//! slab chains its free objects through their own first bytes. The
//! allocator hosts itself: cache descriptors come from a cache-of-caches
//! and slab descriptors from a cache-of-slabs, both embedded in the
//! [`SlubHeap`] together with their first slabs so that no allocation is
//! needed to bring the allocator up.
//!
//! A [`SlubHeap`] must not move once [`SlubHeap::setup`] has run: the
//! embedded bootstrap slabs are linked into the embedded caches' lists.

#[cfg(test)]
extern crate std;

mod bucket;
mod cache;

use core::marker::PhantomData;
use core::ptr::NonNull;

use argon_log::{println_debug, println_warn};
use argon_mm::frame;
use argon_mm::paging::{BlockAlloc, PAGE_SIZE};
use argon_mm::phys::PhysAccess;
use intrusive_list::{Link, container_of};

pub use bucket::{BUCKET_COUNT, BucketAllocator};
pub use cache::{CachePtr, Slab, SlabList, SlabStats, SlubCache, SlubFlags};

/// Minimum object size: a free object must be able to hold its list node.
pub const SLUB_MIN_SIZE: usize = size_of::<Link>();

/// Minimum object alignment.
pub const SLUB_MIN_ALIGN: usize = 8;

/// Default slab size, in page order (2^2 pages, 16 KiB).
pub const DEFAULT_SLAB_ORDER: u32 = 2;

pub struct SlubHeap<A: BlockAlloc, P: PhysAccess> {
    /// The cache all other cache descriptors are allocated from.
    cache_cache: SlubCache,
    /// The cache all slab descriptors are allocated from.
    slab_cache: SlubCache,
    cache_boot_slab: Slab,
    slab_boot_slab: Slab,
    ready: bool,
    alloc: A,
    _phys: PhantomData<P>,
}

// SAFETY: The heap is only driven from the single kernel CPU; the global
// instance sits behind a spinlock.
unsafe impl<A: BlockAlloc + Send, P: PhysAccess> Send for SlubHeap<A, P> {}

impl<A: BlockAlloc, P: PhysAccess> SlubHeap<A, P> {
    pub const fn new(alloc: A) -> Self {
        Self {
            cache_cache: SlubCache::empty(),
            slab_cache: SlubCache::empty(),
            cache_boot_slab: Slab::empty(),
            slab_boot_slab: Slab::empty(),
            ready: false,
            alloc,
            _phys: PhantomData,
        }
    }

    /// Bootstrap the allocator: install the two embedded caches and hand
    /// each its first slab. Panics on out-of-memory, as nothing can run
    /// without the object allocator.
    pub fn setup(&mut self) {
        assert!(!self.ready, "slub heap set up twice");

        let slab_pages = 1usize << DEFAULT_SLAB_ORDER;
        let slab_bytes = PAGE_SIZE << DEFAULT_SLAB_ORDER;

        let cache_region = self
            .alloc
            .alloc_exact(slab_pages)
            .expect("slub_setup(): no memory for the bootstrap cache slab");
        let slab_region = self
            .alloc
            .alloc_exact(slab_pages)
            .expect("slub_setup(): no memory for the bootstrap slab slab");

        unsafe {
            let cache_cache = NonNull::from(&mut self.cache_cache);
            SlubCache::init_at(
                cache_cache,
                "slub cache",
                size_of::<SlubCache>() as u16,
                0,
                1,
                SlubFlags::STICKY,
            );
            Slab::init_at(
                NonNull::from(&mut self.cache_boot_slab),
                cache_cache,
                cache_region,
                slab_bytes,
            );

            let slab_cache = NonNull::from(&mut self.slab_cache);
            SlubCache::init_at(
                slab_cache,
                "slub",
                size_of::<Slab>() as u16,
                0,
                1,
                SlubFlags::STICKY,
            );
            Slab::init_at(
                NonNull::from(&mut self.slab_boot_slab),
                slab_cache,
                slab_region,
                slab_bytes,
            );
        }

        let cache_boot_slab = NonNull::from(&mut self.cache_boot_slab);
        let slab_boot_slab = NonNull::from(&mut self.slab_boot_slab);
        self.set_region_owner(cache_region, slab_pages, Some(cache_boot_slab));
        self.set_region_owner(slab_region, slab_pages, Some(slab_boot_slab));

        self.ready = true;
    }

    pub fn cache_of_caches(&mut self) -> CachePtr {
        CachePtr(NonNull::from(&mut self.cache_cache))
    }

    pub fn cache_of_slabs(&mut self) -> CachePtr {
        CachePtr(NonNull::from(&mut self.slab_cache))
    }

    /// Create a cache, allocating its descriptor from the cache-of-caches.
    /// `None` on out-of-memory.
    pub fn create_cache(
        &mut self,
        name: &'static str,
        obj_size: u16,
        obj_align: u16,
        min_free: u16,
        flags: SlubFlags,
    ) -> Option<CachePtr> {
        let cache_cache = self.cache_of_caches();
        let descriptor = self.alloc(cache_cache)?.cast::<SlubCache>();

        unsafe { SlubCache::init_at(descriptor, name, obj_size, obj_align, min_free, flags) };
        Some(CachePtr(descriptor))
    }

    /// Destroy a cache, returning its slabs to the buddy allocator and its
    /// descriptors to the bootstrap caches. Refuses, with a warning, while
    /// any object is still allocated, and always refuses the embedded
    /// caches.
    pub fn destroy_cache(&mut self, cache: CachePtr) -> bool {
        let c = cache.raw();

        unsafe {
            if (*c).flags.contains(SlubFlags::STICKY) {
                println_warn!("cannot destroy sticky cache {}", (*c).name);
                return false;
            }
            if !(*c).partial_slabs.is_empty() || !(*c).full_slabs.is_empty() {
                println_warn!("cannot destroy cache {}: objects still allocated", (*c).name);
                return false;
            }
            if (*c).flags.contains(SlubFlags::DEBUG) {
                println_debug!("destroying cache {}", (*c).name);
            }
        }

        let slab_cache = self.cache_of_slabs();
        loop {
            let Some(link) = (unsafe { &mut *c }).free_slabs.pop_front() else {
                break;
            };
            let slab = unsafe { container_of!(link.as_ptr(), Slab, node) };

            let (base, pages, objects) = unsafe {
                let slab = slab.as_ptr();
                (
                    (*slab).base,
                    (*slab).size.div_ceil(PAGE_SIZE),
                    (*slab).max_objects as u32,
                )
            };

            self.set_region_owner(base, pages, None);
            unsafe {
                self.alloc.free_exact(base, pages);
                (*c).total_objects -= objects;
                (*c).free_objects -= objects;
            }
            self.free(slab_cache, slab.cast::<u8>().as_ptr());
        }

        let cache_cache = self.cache_of_caches();
        self.free(cache_cache, c.cast::<u8>());
        true
    }

    /// Allocate one object from `cache`. `None` on out-of-memory.
    ///
    /// The watermark is honored *before* the pop: if the free-object count
    /// has fallen to `min_free`, the cache grows by one slab first, so the
    /// pool can never run dry mid-operation.
    pub fn alloc(&mut self, cache: CachePtr) -> Option<NonNull<u8>> {
        let (free, min_free) = unsafe {
            let c = cache.raw();
            ((*c).free_objects, (*c).min_free as u32)
        };

        if free == min_free && !self.add_slab(cache) {
            println_warn!(
                "slub: failed to grow cache {} at its watermark",
                unsafe { (*cache.raw()).name }
            );
            return None;
        }

        self.alloc_object(cache)
    }

    /// Return `obj` to `cache`. Pointers that belong to no slab of the
    /// cache are ignored; the `DEBUG` flag makes them visible.
    pub fn free(&mut self, cache: CachePtr, obj: *mut u8) {
        let Some(obj) = NonNull::new(obj) else {
            return;
        };
        let c = cache.raw();

        let found = Self::find_slab(unsafe { &(*c).partial_slabs }, obj)
            .map(|slab| (slab, false))
            .or_else(|| Self::find_slab(unsafe { &(*c).full_slabs }, obj).map(|slab| (slab, true)));

        let Some((slab, from_full)) = found else {
            unsafe {
                if (*c).flags.contains(SlubFlags::DEBUG) {
                    println_debug!(
                        "{} cache: cannot free unknown object {:p}",
                        (*c).name,
                        obj.as_ptr()
                    );
                }
            }
            return;
        };

        unsafe {
            let s = slab.as_ptr();
            (*s).push_object(obj);
            (*s).free_objects += 1;
            (*c).free_objects += 1;

            // A slab with every object back goes to the free list; one
            // that just left the full list goes to partial.
            if (*s).free_objects == (*s).max_objects {
                if from_full {
                    (*c).full_slabs.remove(&mut (*s).node);
                } else {
                    (*c).partial_slabs.remove(&mut (*s).node);
                }
                (*c).free_slabs.push_front(&mut (*s).node);
            } else if from_full {
                (*c).full_slabs.remove(&mut (*s).node);
                (*c).partial_slabs.push_front(&mut (*s).node);
            }
        }
    }

    /// The cache owning `ptr`, resolved through the frame's slab cookie.
    pub fn cache_of(ptr: NonNull<u8>) -> Option<CachePtr> {
        let paddr = unsafe { P::from_ptr(ptr) };
        let slab = frame::info(paddr)?.slab()?.cast::<Slab>();
        Some(CachePtr(unsafe { (*slab.as_ptr()).cache }))
    }

    fn find_slab(slabs: &intrusive_list::List, obj: NonNull<u8>) -> Option<NonNull<Slab>> {
        for link in slabs.iter() {
            let slab = unsafe { container_of!(link.as_ptr(), Slab, node) };
            if unsafe { (*slab.as_ptr()).contains(obj) } {
                return Some(slab);
            }
        }
        None
    }

    /// Pop one object: partial slabs first, then free slabs, growing the
    /// cache if both are empty. Does not look at the watermark.
    fn alloc_object(&mut self, cache: CachePtr) -> Option<NonNull<u8>> {
        let c = cache.raw();

        let link = unsafe {
            match (*c).partial_slabs.front() {
                Some(link) => link,
                None => {
                    if (*c).free_slabs.is_empty() && !self.add_slab(cache) {
                        println_warn!("slub: failed to add slab to cache {}", (*c).name);
                        return None;
                    }
                    (*c).free_slabs
                        .front()
                        .expect("freshly grown cache has no free slab")
                }
            }
        };
        let slab = unsafe { container_of!(link.as_ptr(), Slab, node) }.as_ptr();

        unsafe {
            let was_fully_free = (*slab).free_objects == (*slab).max_objects;
            let obj = (*slab)
                .pop_object()
                .expect("slab with a free count but an empty free list");

            (*slab).free_objects -= 1;
            (*c).free_objects -= 1;

            if (*slab).free_objects == 0 {
                if was_fully_free {
                    (*c).free_slabs.remove(&mut (*slab).node);
                } else {
                    (*c).partial_slabs.remove(&mut (*slab).node);
                }
                (*c).full_slabs.push_front(&mut (*slab).node);
            } else if was_fully_free {
                (*c).free_slabs.remove(&mut (*slab).node);
                (*c).partial_slabs.push_front(&mut (*slab).node);
            }

            Some(obj)
        }
    }

    /// Grow `cache` by one slab: a descriptor from the cache-of-slabs and a
    /// region from the buddy allocator.
    fn add_slab(&mut self, cache: CachePtr) -> bool {
        let slab_cache = self.cache_of_slabs();

        // Growing any other cache consumes a slab descriptor. If that pop
        // would drain the descriptor pool to its watermark, provision the
        // cache-of-slabs first; the provisioning pop below then finds a
        // descriptor ready, which bounds the recursion at one level.
        if cache != slab_cache {
            let at_watermark = unsafe {
                let sc = slab_cache.raw();
                (*sc).free_objects == (*sc).min_free as u32
            };
            if at_watermark && !self.add_slab(slab_cache) {
                return false;
            }
        }

        let Some(descriptor) = self.alloc_object(slab_cache) else {
            return false;
        };
        let descriptor = descriptor.cast::<Slab>();

        let (size, pages) = unsafe {
            let c = cache.raw();
            let size = (*c).obj_size as usize * (*c).obj_per_slab as usize;
            (size, size.div_ceil(PAGE_SIZE))
        };

        let Some(base) = self.alloc.alloc_exact(pages) else {
            self.free(slab_cache, descriptor.cast::<u8>().as_ptr());
            return false;
        };

        unsafe { Slab::init_at(descriptor, cache.0, base, size) };
        self.set_region_owner(base, pages, Some(descriptor));
        true
    }

    /// Stamp (or clear) the owner cookie on every frame of a slab region.
    fn set_region_owner(&self, base: NonNull<u8>, pages: usize, owner: Option<NonNull<Slab>>) {
        let paddr = unsafe { P::from_ptr(base) };
        for i in 0..pages {
            if let Some(frame) = frame::info(paddr + i * PAGE_SIZE) {
                frame.set_slab(owner.map(NonNull::cast));
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use argon_mm::sim::{SimMachine, SimPhys};
    use buddy_allocator::BuddyAllocator;
    use core::cell::RefCell;
    use std::boxed::Box;
    use std::rc::Rc;
    use std::vec::Vec;

    #[derive(Clone)]
    pub(crate) struct TestAlloc(pub(crate) Rc<RefCell<BuddyAllocator<SimPhys>>>);

    impl BlockAlloc for TestAlloc {
        fn alloc_exact(&self, count: usize) -> Option<NonNull<u8>> {
            self.0.borrow_mut().alloc_exact(count)
        }

        unsafe fn free_exact(&self, ptr: NonNull<u8>, count: usize) {
            self.0.borrow_mut().free_exact(ptr.as_ptr(), count);
        }
    }

    pub(crate) struct Fixture {
        pub(crate) heap: Box<SlubHeap<TestAlloc, SimPhys>>,
        pub(crate) buddy: TestAlloc,
        _machine: SimMachine,
    }

    pub(crate) fn fixture(pages: usize) -> Fixture {
        let machine = SimMachine::with_free_frames(pages);
        let buddy = TestAlloc(Rc::new(RefCell::new(BuddyAllocator::new())));
        buddy.0.borrow_mut().setup();

        let mut heap = Box::new(SlubHeap::new(buddy.clone()));
        heap.setup();

        Fixture {
            heap,
            buddy,
            _machine: machine,
        }
    }

    pub(crate) fn cache_of(ptr: NonNull<u8>) -> Option<CachePtr> {
        SlubHeap::<TestAlloc, SimPhys>::cache_of(ptr)
    }

    #[test]
    fn bootstrap_self_hosts() {
        let mut fx = fixture(64);
        let heap = &mut fx.heap;

        assert!(heap.cache_of_caches().free_objects() > 0);
        assert!(heap.cache_of_slabs().free_objects() > 0);

        // One object of each bootstrap cache is usable straight away.
        let cache = heap.create_cache("test", 16, 0, 0, SlubFlags::empty());
        assert!(cache.is_some());
    }

    #[test]
    fn alloc_free_round_trip() {
        let mut fx = fixture(64);
        let heap = &mut fx.heap;

        let cache = heap
            .create_cache("object", 64, 0, 0, SlubFlags::empty())
            .unwrap();

        let free_before = cache.free_objects();
        let a = heap.alloc(cache).unwrap();
        let b = heap.alloc(cache).unwrap();
        assert_ne!(a, b);

        heap.free(cache, a.as_ptr());
        heap.free(cache, b.as_ptr());

        // The cache may have grown, but every object is free again.
        assert!(cache.free_objects() >= free_before);
        assert_eq!(cache.free_objects(), cache.total_objects());
    }

    #[test]
    fn create_populate_destroy_returns_to_baseline() {
        let mut fx = fixture(64);
        let heap = &mut fx.heap;

        let caches_used = heap.cache_of_caches().used_objects();
        let slabs_used = heap.cache_of_slabs().used_objects();

        let cache = heap
            .create_cache("vnode", 24, 8, 2, SlubFlags::empty())
            .unwrap();

        let mut objects = Vec::new();
        for _ in 0..200 {
            let obj = heap.alloc(cache).unwrap();
            assert_eq!(obj.as_ptr() as usize % 8, 0);
            assert!(!objects.contains(&obj));
            objects.push(obj);
        }

        for obj in objects.into_iter().rev() {
            heap.free(cache, obj.as_ptr());
        }

        assert!(heap.destroy_cache(cache));
        assert_eq!(heap.cache_of_caches().used_objects(), caches_used);
        assert_eq!(heap.cache_of_slabs().used_objects(), slabs_used);
    }

    #[test]
    fn slab_lists_match_their_counters() {
        let mut fx = fixture(128);
        let heap = &mut fx.heap;

        let cache = heap
            .create_cache("node", 64, 0, 0, SlubFlags::empty())
            .unwrap();
        let per_slab = {
            let mut max = 0;
            if let Some(p) = heap.alloc(cache) {
                heap.free(cache, p.as_ptr());
            }
            cache.for_each_slab(|s| max = s.max_objects);
            max as usize
        };

        let mut objects = Vec::new();
        for _ in 0..per_slab + per_slab / 4 {
            objects.push(heap.alloc(cache).unwrap());
        }

        let check = |cache: CachePtr| {
            cache.for_each_slab(|slab| match slab.list {
                SlabList::Free => assert_eq!(slab.free_objects, slab.max_objects),
                SlabList::Full => assert_eq!(slab.free_objects, 0),
                SlabList::Partial => {
                    assert!(slab.free_objects > 0 && slab.free_objects < slab.max_objects)
                }
            });
        };

        check(cache);
        check(heap.cache_of_slabs());
        check(heap.cache_of_caches());

        for obj in objects.drain(..) {
            heap.free(cache, obj.as_ptr());
        }
        check(cache);
        assert_eq!(cache.free_objects(), cache.total_objects());
    }

    #[test]
    fn unknown_frees_are_tolerated() {
        let mut fx = fixture(64);
        let heap = &mut fx.heap;

        let a = heap
            .create_cache("a", 32, 0, 0, SlubFlags::empty())
            .unwrap();
        let b = heap.create_cache("b", 32, 0, 0, SlubFlags::DEBUG).unwrap();

        let obj = heap.alloc(a).unwrap();
        let b_free = b.free_objects();
        let a_free = a.free_objects();

        // Wrong cache: silently ignored, with counters untouched.
        heap.free(b, obj.as_ptr());
        assert_eq!(b.free_objects(), b_free);
        assert_eq!(a.free_objects(), a_free);

        heap.free(a, obj.as_ptr());
        assert_eq!(a.free_objects(), a_free + 1);
    }

    #[test]
    fn descriptor_cache_grows_itself_at_the_watermark() {
        let mut fx = fixture(4096);
        let heap = &mut fx.heap;

        let initial_descriptors = heap.cache_of_slabs().total_objects();
        let cache = heap
            .create_cache("page", 4096, 0, 0, SlubFlags::empty())
            .unwrap();

        // Four objects per slab: every fourth allocation consumes a slab
        // descriptor, eventually draining the cache-of-slabs to its
        // watermark and forcing it to grow itself.
        let target = (initial_descriptors as usize + 2) * 4;
        let mut objects = Vec::new();
        for _ in 0..target {
            objects.push(heap.alloc(cache).unwrap());
        }
        assert!(heap.cache_of_slabs().total_objects() > initial_descriptors);

        for obj in objects.into_iter() {
            heap.free(cache, obj.as_ptr());
        }
        assert!(heap.destroy_cache(cache));
        // Only the descriptor of the slab the cache-of-slabs grew for
        // itself remains in use.
        assert_eq!(heap.cache_of_slabs().used_objects(), 1);
    }

    #[test]
    fn destroy_refuses_busy_and_sticky_caches() {
        let mut fx = fixture(64);
        let heap = &mut fx.heap;

        let slab_cache = heap.cache_of_slabs();
        assert!(!heap.destroy_cache(slab_cache));

        let cache = heap
            .create_cache("busy", 48, 0, 0, SlubFlags::empty())
            .unwrap();
        let obj = heap.alloc(cache).unwrap();
        assert!(!heap.destroy_cache(cache));

        heap.free(cache, obj.as_ptr());
        assert!(heap.destroy_cache(cache));
    }

    #[test]
    fn object_pointers_resolve_to_their_cache() {
        let mut fx = fixture(64);
        let heap = &mut fx.heap;

        let cache = heap
            .create_cache("traced", 128, 0, 0, SlubFlags::empty())
            .unwrap();
        let obj = heap.alloc(cache).unwrap();

        let owner = SlubHeap::<TestAlloc, SimPhys>::cache_of(obj).unwrap();
        assert_eq!(owner, cache);

        // A page straight from the buddy allocator has no owner.
        let page = fx.buddy.0.borrow_mut().alloc_exact(1).unwrap();
        assert!(SlubHeap::<TestAlloc, SimPhys>::cache_of(page).is_none());
        fx.buddy.0.borrow_mut().free_exact(page.as_ptr(), 1);

        heap.free(cache, obj.as_ptr());
        assert!(heap.destroy_cache(cache));
    }
}
