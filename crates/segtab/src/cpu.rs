//! Per-CPU publication of the active user segment table.
//!
//! On a context switch the engine publishes the incoming space's root node
//! (and on 64-bit targets the first interior node, which the MMU reload path
//! reads directly) to the switching CPU's [`CpuState`]. The kernel space and
//! a deactivated CPU publish a poisoned sentinel instead, so any stray user
//! access through the cached pointers faults rather than walking stale
//! tables. Hardware translation registers are reloaded through the
//! machine-dependent [`MdHooks`].

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::node::SegtabNode;
use crate::segtab::{Segtab, SpaceKind};

/// Poison value published when no user segment table is active.
///
/// Not null: null would read as "tree not yet populated" to a fast path,
/// while the sentinel points at the top of the address space and faults on
/// dereference.
pub const INVALID_SEGTAB_ADDRESS: usize = usize::MAX;

fn invalid_segtab() -> *mut SegtabNode {
    INVALID_SEGTAB_ADDRESS as *mut SegtabNode
}

/// The segment-table fields of one CPU's per-CPU area.
///
/// Owned by the caller (one per CPU, typically embedded in its `cpu_info`
/// equivalent); the engine only ever writes the fields of the CPU it is
/// switching.
pub struct CpuState {
    user_segtab: AtomicPtr<SegtabNode>,
    #[cfg(target_pointer_width = "64")]
    user_seg0tab: AtomicPtr<SegtabNode>,
}

impl CpuState {
    /// Creates the per-CPU fields in the deactivated state.
    pub const fn new() -> Self {
        Self {
            user_segtab: AtomicPtr::new(ptr::null_mut()),
            #[cfg(target_pointer_width = "64")]
            user_seg0tab: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Returns the published user root node, the invalid sentinel, or null
    /// if nothing was ever activated on this CPU.
    pub fn user_segtab(&self) -> *mut SegtabNode {
        self.user_segtab.load(Ordering::Acquire)
    }

    /// Returns the published first interior node (the MMU reload shortcut).
    #[cfg(target_pointer_width = "64")]
    pub fn user_seg0tab(&self) -> *mut SegtabNode {
        self.user_seg0tab.load(Ordering::Acquire)
    }

    fn publish(&self, segtab: *mut SegtabNode, seg0tab: *mut SegtabNode) {
        self.user_segtab.store(segtab, Ordering::Release);
        #[cfg(target_pointer_width = "64")]
        self.user_seg0tab.store(seg0tab, Ordering::Release);
        #[cfg(not(target_pointer_width = "64"))]
        let _ = seg0tab;
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

/// Machine-dependent activation hooks.
///
/// Implemented by the architecture layer above this crate; reloads whatever
/// hardware translation state the MMU keeps per address space.
pub trait MdHooks {
    fn activate(&self, segtab: &Segtab);
    fn deactivate(&self, segtab: &Segtab);
}

impl Segtab {
    /// Publishes this space's segment table to `cpu` and reloads the
    /// hardware translation registers through `md`.
    ///
    /// Call on the CPU that is switching to this address space, with that
    /// CPU's state. The kernel space publishes the invalid sentinel: user
    /// accesses must never resolve through the kernel's table.
    pub fn activate(&self, cpu: &CpuState, md: &dyn MdHooks) {
        md.activate(self);
        if self.kind() == SpaceKind::Kernel {
            cpu.publish(invalid_segtab(), invalid_segtab());
        } else {
            let root = self.root();
            debug_assert!(!root.is_null(), "activate on an uninitialized address space");
            #[cfg(target_pointer_width = "64")]
            // SAFETY: an initialized space's root is a live node.
            let seg0 = unsafe { (*root).seg(0) };
            #[cfg(not(target_pointer_width = "64"))]
            let seg0 = ptr::null_mut();
            cpu.publish(root, seg0);
        }
    }

    /// Resets `cpu`'s published fields to the invalid sentinel and gives the
    /// machine-dependent layer its turn.
    ///
    /// Called on context-switch-out; does not require that this space is the
    /// one currently active.
    pub fn deactivate(&self, cpu: &CpuState, md: &dyn MdHooks) {
        md.deactivate(self);
        cpu.publish(invalid_segtab(), invalid_segtab());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressTranslator, VirtualAddress};
    use crate::frame_source::EmulatedFrames;
    use crate::pool::SegtabPool;
    use crate::segtab::ReserveFlags;
    use std::sync::atomic::AtomicUsize;

    fn setup() {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::new(0));
        }
    }

    /// Records hook invocations.
    #[derive(Default)]
    struct RecordingHooks {
        activations: AtomicUsize,
        deactivations: AtomicUsize,
    }

    impl MdHooks for RecordingHooks {
        fn activate(&self, _segtab: &Segtab) {
            self.activations.fetch_add(1, Ordering::AcqRel);
        }

        fn deactivate(&self, _segtab: &Segtab) {
            self.deactivations.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[test]
    fn activate_publishes_user_root_and_seg0() {
        setup();
        let frames = Box::leak(Box::new(EmulatedFrames::new(8)));
        let pool = SegtabPool::new(frames);
        let space = Segtab::new(SpaceKind::User, VirtualAddress::new(0));
        space.init(&pool);
        space
            .reserve(&pool, VirtualAddress::new(0x1000), ReserveFlags::empty())
            .unwrap();

        let cpu = CpuState::new();
        let md = RecordingHooks::default();
        space.activate(&cpu, &md);

        assert_eq!(cpu.user_segtab(), space.root());
        #[cfg(target_pointer_width = "64")]
        {
            // SAFETY: the root is live while the space is initialized.
            let seg0 = unsafe { (*space.root()).seg(0) };
            assert!(!seg0.is_null());
            assert_eq!(cpu.user_seg0tab(), seg0);
        }
        assert_eq!(md.activations.load(Ordering::Acquire), 1);
    }

    #[test]
    fn kernel_space_publishes_invalid_sentinel() {
        setup();
        let frames = Box::leak(Box::new(EmulatedFrames::new(4)));
        let pool = SegtabPool::new(frames);
        let kernel = Segtab::new(SpaceKind::Kernel, VirtualAddress::new(0));
        kernel.init(&pool);

        let cpu = CpuState::new();
        let md = RecordingHooks::default();
        kernel.activate(&cpu, &md);

        assert_eq!(cpu.user_segtab() as usize, INVALID_SEGTAB_ADDRESS);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(cpu.user_seg0tab() as usize, INVALID_SEGTAB_ADDRESS);
    }

    #[test]
    fn deactivate_resets_to_invalid_sentinel() {
        setup();
        let frames = Box::leak(Box::new(EmulatedFrames::new(8)));
        let pool = SegtabPool::new(frames);
        let space = Segtab::new(SpaceKind::User, VirtualAddress::new(0));
        space.init(&pool);

        let cpu = CpuState::new();
        let md = RecordingHooks::default();
        space.activate(&cpu, &md);
        assert_eq!(cpu.user_segtab(), space.root());

        space.deactivate(&cpu, &md);
        assert_eq!(cpu.user_segtab() as usize, INVALID_SEGTAB_ADDRESS);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(cpu.user_seg0tab() as usize, INVALID_SEGTAB_ADDRESS);
        assert_eq!(md.activations.load(Ordering::Acquire), 1);
        assert_eq!(md.deactivations.load(Ordering::Acquire), 1);
    }
}
