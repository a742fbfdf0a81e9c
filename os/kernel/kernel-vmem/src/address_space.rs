//! # Address Space (x86-64, PML4-rooted)

use crate::info::KERNEL_PML4_START;
use crate::{
    ENTRIES, FrameAlloc, PageEntryBits, PageTable, PhysMapper, PteUpdate, TlbInvalidate,
    VmemError, table_at,
};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K, VirtualAddress,
};
use log::trace;

/// A hardware address space rooted at a PML4 frame.
///
/// All methods take `&self`: entries are atomics and the interior tree only
/// grows while the space is in use. Frames of page tables are never returned
/// to the allocator during the space's lifetime.
pub struct AddressSpace<M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: M,
}

impl<M: PhysMapper> AddressSpace<M> {
    /// Allocate an empty PML4.
    ///
    /// # Errors
    /// [`VmemError::OutOfPageTables`] when no frame is available.
    pub fn new(mapper: M, frames: &impl FrameAlloc) -> Result<Self, VmemError> {
        let root = frames.alloc_4k().ok_or(VmemError::OutOfPageTables)?;
        Ok(Self { root, mapper })
    }

    /// Adopt an existing PML4, e.g. the one built by the loader.
    #[must_use]
    pub const fn from_root(mapper: M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    /// A fresh user space whose upper half aliases this (kernel) space.
    ///
    /// The kernel half must already have all PML4 entries it will ever use;
    /// later kernel-half PML4 slots are not propagated.
    ///
    /// # Errors
    /// [`VmemError::OutOfPageTables`] when no frame is available.
    pub fn new_user(&self, frames: &impl FrameAlloc) -> Result<Self, VmemError>
    where
        M: Clone,
    {
        let space = Self::new(self.mapper.clone(), frames)?;
        let (src, dst) = (self.pml4(), space.pml4());
        for i in KERNEL_PML4_START..ENTRIES {
            dst.store(i, src.load(i));
        }
        Ok(space)
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    fn pml4(&self) -> &PageTable {
        // SAFETY: the root frame is a page table for the lifetime of `self`.
        unsafe { table_at(&self.mapper, self.root.base()) }
    }

    #[inline]
    fn child(&self, entry: PageEntryBits) -> &PageTable {
        // SAFETY: present, non-PS interior entries point at page tables
        // that live as long as the space.
        unsafe { table_at(&self.mapper, entry.physical_address()) }
    }

    /// Return the table behind `table[idx]`, creating it if absent.
    ///
    /// A present entry gets the requested rights OR'ed in. An absent one is
    /// filled by CAS with a fresh table; if another core wins, the fresh
    /// table goes back to `frames` and the winner's table is used.
    fn get_or_alloc_pt<'s>(
        &'s self,
        frames: &impl FrameAlloc,
        table: &'s PageTable,
        idx: usize,
        flags: PageEntryBits,
    ) -> Result<&'s PageTable, VmemError> {
        let mut cur = table.load(idx);
        loop {
            if cur.present() {
                if cur.large_page() {
                    return Err(VmemError::LargePageConflict);
                }
                let want = cur.widened_with(flags).with_no_execute(false);
                if want == cur {
                    return Ok(self.child(cur));
                }
                match table.compare_exchange(idx, cur, want) {
                    Ok(()) => return Ok(self.child(want)),
                    Err(seen) => {
                        cur = seen;
                        continue;
                    }
                }
            }

            let frame = frames.alloc_4k().ok_or(VmemError::OutOfPageTables)?;
            let new = PageEntryBits::table(frame.base(), flags);
            match table.compare_exchange(idx, cur, new) {
                Ok(()) => return Ok(self.child(new)),
                Err(seen) => {
                    // Lost the race; the winner's table is at least as good.
                    frames.free_4k(frame);
                    cur = seen;
                }
            }
        }
    }

    /// The PT covering `va`, creating PDPT/PD/PT on the way.
    fn leaf_table(
        &self,
        frames: &impl FrameAlloc,
        va: VirtualAddress,
        flags: PageEntryBits,
    ) -> Result<&PageTable, VmemError> {
        let idx = va.indices();
        let pdpt = self.get_or_alloc_pt(frames, self.pml4(), idx.pml4, flags)?;
        let pd = self.get_or_alloc_pt(frames, pdpt, idx.pdpt, flags)?;
        self.get_or_alloc_pt(frames, pd, idx.pd, flags)
    }

    /// The PT covering `va` if the walk reaches one without creating tables.
    fn existing_leaf_table(&self, va: VirtualAddress) -> Option<&PageTable> {
        let idx = va.indices();
        let mut table = self.pml4();
        for i in [idx.pml4, idx.pdpt, idx.pd] {
            let e = table.load(i);
            if !e.present() || e.large_page() {
                return None;
            }
            table = self.child(e);
        }
        Some(table)
    }

    /// Map `[virt, virt + size)` to `[phys, phys + size)` with 4 KiB leaves.
    ///
    /// Interior entries are created or widened lock-free; leaves are stored
    /// directly and invalidated in the local TLB.
    ///
    /// # Errors
    /// * [`VmemError::Unaligned`] if any argument is not page aligned.
    /// * [`VmemError::OutOfPageTables`] when a table cannot be allocated;
    ///   pages before the failing one stay mapped.
    pub fn view(
        &self,
        frames: &impl FrameAlloc,
        tlb: &impl TlbInvalidate,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        size: u64,
        flags: PageEntryBits,
    ) -> Result<(), VmemError> {
        check_aligned(phys, virt, size)?;
        let mut off = 0;
        while off < size {
            let va = (virt + off).canonical();
            let pt = self.leaf_table(frames, va, flags)?;
            pt.store(va.indices().pt, PageEntryBits::leaf(phys + off, flags));
            tlb.invalidate_page(va);
            off += Size4K::SIZE;
        }
        Ok(())
    }

    /// Clear the 4 KiB leaves of `[virt, virt + size)`; returns how many
    /// were present.
    ///
    /// Backward progress: the caller holds the space exclusively and runs a
    /// cross-core shootdown afterwards.
    ///
    /// # Errors
    /// [`VmemError::Unaligned`] if `virt` or `size` is not page aligned.
    pub fn unview(
        &self,
        tlb: &impl TlbInvalidate,
        virt: VirtualAddress,
        size: u64,
    ) -> Result<usize, VmemError> {
        check_aligned(PhysicalAddress::zero(), virt, size)?;
        let mut cleared = 0;
        let mut off = 0;
        while off < size {
            let va = (virt + off).canonical();
            if let Some(pt) = self.existing_leaf_table(va) {
                let old = pt.swap(va.indices().pt, PageEntryBits::new());
                if old.present() {
                    tlb.invalidate_page(va);
                    cleared += 1;
                }
            }
            off += Size4K::SIZE;
        }
        Ok(cleared)
    }

    /// Resolve `virt` through the tables, including 2 MiB and 1 GiB leaves.
    #[must_use]
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let va = virt.canonical();
        let idx = va.indices();

        let e4 = self.pml4().load(idx.pml4);
        if !e4.present() {
            return None;
        }
        let e3 = self.child(e4).load(idx.pdpt);
        if !e3.present() {
            return None;
        }
        if e3.large_page() {
            return Some(e3.physical_address() + va.offset::<Size1G>());
        }
        let e2 = self.child(e3).load(idx.pd);
        if !e2.present() {
            return None;
        }
        if e2.large_page() {
            return Some(e2.physical_address() + va.offset::<Size2M>());
        }
        let e1 = self.child(e2).load(idx.pt);
        e1.present()
            .then(|| e1.physical_address() + va.offset::<Size4K>())
    }

    /// The present 4 KiB leaf entry for `virt`, if any.
    #[must_use]
    pub fn probe(&self, virt: VirtualAddress) -> Option<PageEntryBits> {
        let va = virt.canonical();
        let e = self.existing_leaf_table(va)?.load(va.indices().pt);
        e.present().then_some(e)
    }

    /// Entries seen at each level while walking to `virt`; `None` past the
    /// first absent level. Used for fault diagnostics.
    #[must_use]
    pub fn walk(&self, virt: VirtualAddress) -> [Option<PageEntryBits>; 4] {
        let idx = virt.canonical().indices().as_array();
        let mut out = [None; 4];
        let mut table = self.pml4();
        for (level, i) in idx.into_iter().enumerate() {
            let e = table.load(i);
            out[level] = Some(e);
            if !e.present() || e.large_page() || level == 3 {
                break;
            }
            table = self.child(e);
        }
        out
    }

    /// Lazy-fault install of one page.
    ///
    /// Every level is updated with a CAS loop, so any number of cores may
    /// install into the same space, even the same page, concurrently. The
    /// resulting leaf grants at least the union of all requested rights.
    /// An already present leaf keeps its frame.
    ///
    /// # Errors
    /// * [`VmemError::Unaligned`] if `update.phys` is not page aligned.
    /// * [`VmemError::OutOfPageTables`] when a table cannot be allocated.
    pub fn install(
        &self,
        frames: &impl FrameAlloc,
        virt: VirtualAddress,
        update: PteUpdate,
    ) -> Result<PageEntryBits, VmemError> {
        if !update.phys.is_aligned::<Size4K>() {
            return Err(VmemError::Unaligned);
        }
        let va = virt.canonical();
        let pt = self.leaf_table(frames, va, update.flags)?;
        let idx = va.indices().pt;

        let mut cur = pt.load(idx);
        loop {
            let new = if cur.present() {
                cur.widened_with(update.flags)
            } else {
                PageEntryBits::leaf(update.phys, update.flags)
            };
            if new == cur {
                return Ok(cur);
            }
            match pt.compare_exchange(idx, cur, new) {
                Ok(()) => {
                    trace!("installed {va} -> {} ({new:?})", new.physical_address());
                    return Ok(new);
                }
                Err(seen) => cur = seen,
            }
        }
    }

    /// Boot-time offset map: `[virt, virt + size)` → `[phys, phys + size)`.
    ///
    /// Walks pages in order and re-walks the upper levels only when the PT
    /// changes. Meant for single-threaded bring-up; no TLB maintenance.
    ///
    /// # Errors
    /// See [`AddressSpace::view`].
    pub fn map_offset(
        &self,
        frames: &impl FrameAlloc,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        size: u64,
        flags: PageEntryBits,
    ) -> Result<(), VmemError> {
        check_aligned(phys, virt, size)?;
        let mut cursor: Option<([usize; 3], &PageTable)> = None;
        let mut off = 0;
        while off < size {
            let va = (virt + off).canonical();
            let idx = va.indices();
            let key = [idx.pml4, idx.pdpt, idx.pd];
            let pt = match cursor {
                Some((k, pt)) if k == key => pt,
                _ => {
                    let pt = self.leaf_table(frames, va, flags)?;
                    cursor = Some((key, pt));
                    pt
                }
            };
            pt.store(idx.pt, PageEntryBits::leaf(phys + off, flags));
            off += Size4K::SIZE;
        }
        Ok(())
    }
}

fn check_aligned(phys: PhysicalAddress, virt: VirtualAddress, size: u64) -> Result<(), VmemError> {
    if phys.is_aligned::<Size4K>() && virt.is_aligned::<Size4K>() && size % Size4K::SIZE == 0 {
        Ok(())
    } else {
        Err(VmemError::Unaligned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoTlb;
    use crate::test_support::{BumpAlloc, TestPhys};
    use std::sync::atomic::Ordering;
    use std::sync::Barrier;
    use std::thread;

    const FRAMES: usize = 256;

    fn setup(phys: &TestPhys) -> (BumpAlloc<'_>, AddressSpace<&TestPhys>) {
        // frame 0 stays unused so that a zero PA is never handed out
        let alloc = BumpAlloc::new(phys, 0x1000, (FRAMES as u64) << 12);
        let space = AddressSpace::new(phys, &alloc).unwrap();
        (alloc, space)
    }

    #[test]
    fn view_then_translate_every_page() {
        let phys = TestPhys::with_frames(FRAMES);
        let (alloc, space) = setup(&phys);

        let va = VirtualAddress::new(0xFFFF_8000_0010_0000);
        let pa = PhysicalAddress::new(0x0040_0000);
        space
            .view(&alloc, &NoTlb, pa, va, 16 * 4096, PageEntryBits::kernel_rw())
            .unwrap();

        for i in 0..16u64 {
            let got = space.translate(va + i * 4096 + 0x123).unwrap();
            assert_eq!(got, pa + i * 4096 + 0x123);
        }
        assert!(space.translate(va + 16 * 4096).is_none());

        let leaf = space.probe(va).unwrap();
        assert!(leaf.writable() && leaf.no_execute() && !leaf.user_access());
        // root + PDPT + PD + PT
        assert_eq!(alloc.live.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn view_rejects_unaligned_input() {
        let phys = TestPhys::with_frames(FRAMES);
        let (alloc, space) = setup(&phys);
        let flags = PageEntryBits::kernel_rw();
        let va = VirtualAddress::new(0x1000);
        assert_eq!(
            space.view(&alloc, &NoTlb, PhysicalAddress::new(0x1001), va, 4096, flags),
            Err(VmemError::Unaligned)
        );
        assert_eq!(
            space.view(&alloc, &NoTlb, PhysicalAddress::new(0x1000), va, 100, flags),
            Err(VmemError::Unaligned)
        );
    }

    #[test]
    fn view_reports_table_exhaustion() {
        let phys = TestPhys::with_frames(8);
        // room for the root and two more tables only
        let alloc = BumpAlloc::new(&phys, 0x1000, 0x4000);
        let space = AddressSpace::new(&phys, &alloc).unwrap();
        let res = space.view(
            &alloc,
            &NoTlb,
            PhysicalAddress::new(0x5000),
            VirtualAddress::new(0x4000_0000),
            4096,
            PageEntryBits::kernel_rw(),
        );
        assert_eq!(res, Err(VmemError::OutOfPageTables));
    }

    #[test]
    fn interior_flags_only_widen() {
        let phys = TestPhys::with_frames(FRAMES);
        let (alloc, space) = setup(&phys);
        let va = VirtualAddress::new(0x0000_0000_A000_0000);

        space
            .view(&alloc, &NoTlb, PhysicalAddress::new(0x10_0000), va, 4096, PageEntryBits::kernel_rw())
            .unwrap();
        space
            .view(&alloc, &NoTlb, PhysicalAddress::new(0x20_0000), va + 4096, 4096, PageEntryBits::user_ro())
            .unwrap();

        let walk = space.walk(va);
        for e in &walk[..3] {
            let e = e.unwrap();
            assert!(e.present() && e.writable() && e.user_access() && !e.no_execute());
        }
        // the first leaf kept its own, narrower rights
        assert!(!walk[3].unwrap().user_access());
    }

    #[test]
    fn unview_clears_leaves() {
        let phys = TestPhys::with_frames(FRAMES);
        let (alloc, space) = setup(&phys);
        let va = VirtualAddress::new(0x0000_0000_A000_0000);
        space
            .view(&alloc, &NoTlb, PhysicalAddress::new(0x10_0000), va, 4 * 4096, PageEntryBits::user_rw())
            .unwrap();

        assert_eq!(space.unview(&NoTlb, va + 4096, 2 * 4096).unwrap(), 2);
        assert!(space.translate(va).is_some());
        assert!(space.translate(va + 4096).is_none());
        assert!(space.translate(va + 2 * 4096).is_none());
        assert!(space.translate(va + 3 * 4096).is_some());
        // clearing twice is harmless
        assert_eq!(space.unview(&NoTlb, va + 4096, 4096).unwrap(), 0);
    }

    #[test]
    fn translate_follows_large_pages() {
        let phys = TestPhys::with_frames(FRAMES);
        let (alloc, space) = setup(&phys);
        let va = VirtualAddress::new(0x0000_0040_0000_0000);
        space
            .view(&alloc, &NoTlb, PhysicalAddress::new(0x1000), va, 4096, PageEntryBits::kernel_rw())
            .unwrap();

        // put a 2 MiB leaf into the PD slot after the one we just used
        let pdpte = space.walk(va)[1].unwrap();
        let pd = unsafe { table_at(&phys, pdpte.physical_address()) };
        pd.store(
            va.indices().pd + 1,
            PageEntryBits::leaf(PhysicalAddress::new(0x4000_0000), PageEntryBits::kernel_rw())
                .with_large_page(true),
        );

        let big = va + Size2M::SIZE + 0x1_2345;
        assert_eq!(space.translate(big), Some(PhysicalAddress::new(0x4001_2345)));
        assert!(space.probe(big).is_none());
        let update = PteUpdate {
            phys: PhysicalAddress::new(0x3000),
            flags: PageEntryBits::kernel_rw(),
        };
        assert_eq!(
            space.install(&alloc, big, update),
            Err(VmemError::LargePageConflict)
        );
    }

    #[test]
    fn map_offset_matches_view() {
        let phys = TestPhys::with_frames(FRAMES);
        let (alloc, space) = setup(&phys);
        // crosses a PT boundary
        let va = VirtualAddress::new(0xFFFF_8880_001F_E000);
        let pa = PhysicalAddress::new(0x001F_E000);
        space
            .map_offset(&alloc, pa, va, 8 * 4096, PageEntryBits::kernel_rw())
            .unwrap();
        for i in 0..8u64 {
            assert_eq!(space.translate(va + i * 4096), Some(pa + i * 4096));
        }
    }

    #[test]
    fn user_space_aliases_kernel_half() {
        let phys = TestPhys::with_frames(FRAMES);
        let (alloc, kernel) = setup(&phys);
        let kva = VirtualAddress::new(0xFFFF_8880_0000_0000);
        kernel
            .view(&alloc, &NoTlb, PhysicalAddress::new(0x7000), kva, 4096, PageEntryBits::kernel_rw())
            .unwrap();

        let user = kernel.new_user(&alloc).unwrap();
        assert_ne!(user.root(), kernel.root());
        assert_eq!(user.translate(kva), Some(PhysicalAddress::new(0x7000)));

        // kernel-half edits below the shared PML4 entry show up in both
        kernel
            .view(&alloc, &NoTlb, PhysicalAddress::new(0x8000), kva + 4096, 4096, PageEntryBits::kernel_rw())
            .unwrap();
        assert_eq!(user.translate(kva + 4096), Some(PhysicalAddress::new(0x8000)));

        // user-half edits stay private
        let uva = VirtualAddress::new(0xA000_0000);
        user.view(&alloc, &NoTlb, PhysicalAddress::new(0x9000), uva, 4096, PageEntryBits::user_rw())
            .unwrap();
        assert!(kernel.translate(uva).is_none());
    }

    #[test]
    fn concurrent_installs_on_disjoint_pages_all_succeed() {
        let phys = TestPhys::with_frames(FRAMES);
        let (alloc, space) = setup(&phys);
        let threads = 8;
        let per_thread = 8u64;
        let base = VirtualAddress::new(0xA000_0000);
        let start = Barrier::new(threads);

        thread::scope(|s| {
            for t in 0..threads as u64 {
                let (space, alloc, start) = (&space, &alloc, &start);
                s.spawn(move || {
                    start.wait();
                    for i in 0..per_thread {
                        let n = t * per_thread + i;
                        let update = PteUpdate {
                            phys: PhysicalAddress::new(0x100_0000 + n * 4096),
                            flags: PageEntryBits::user_rw(),
                        };
                        space.install(alloc, base + n * 4096, update).unwrap();
                    }
                });
            }
        });

        for n in 0..threads as u64 * per_thread {
            assert_eq!(
                space.translate(base + n * 4096),
                Some(PhysicalAddress::new(0x100_0000 + n * 4096))
            );
        }
        // lost races returned their tables: root + PDPT + PD + one PT
        assert_eq!(alloc.live.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn concurrent_installs_on_one_page_converge_to_the_union() {
        let phys = TestPhys::with_frames(FRAMES);
        let (alloc, space) = setup(&phys);
        let va = VirtualAddress::new(0xA000_0000);
        let frame = PhysicalAddress::new(0x200_0000);

        let requests = [
            PageEntryBits::user_ro(),
            PageEntryBits::kernel_rw(),
            PageEntryBits::kernel_rx(),
            PageEntryBits::user_rw(),
        ];
        let start = Barrier::new(requests.len());
        thread::scope(|s| {
            for flags in requests {
                let (space, alloc, start) = (&space, &alloc, &start);
                s.spawn(move || {
                    start.wait();
                    for _ in 0..100 {
                        space.install(alloc, va, PteUpdate { phys: frame, flags }).unwrap();
                    }
                });
            }
        });

        let leaf = space.probe(va).unwrap();
        assert_eq!(leaf.physical_address(), frame);
        for r in requests {
            assert!(leaf.covers(r), "{leaf:?} lost rights of {r:?}");
        }
        assert!(leaf.writable() && leaf.user_access() && !leaf.no_execute());
    }
}
