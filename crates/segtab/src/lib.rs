#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Segment-table engine
//!
//! The per-address-space software data structure that translates a virtual
//! address into a pointer to its leaf page-table-entry slot, and manages the
//! lifecycle of the intermediate tables.
//!
//! The engine sits between a higher-level physical map (which owns the
//! address spaces and decides when to populate or tear them down) and a
//! physical-page allocator (reached through the [`FrameSource`] seam). It
//! provides:
//!
//! - A sparse radix tree per address space ([`Segtab`]): two levels on 32-bit
//!   targets, three on 64-bit.
//! - Lock-free lazy population ([`Segtab::reserve`]) with compare-and-swap
//!   installation and clean recycling for the loser of an install race.
//! - A process-wide pool ([`SegtabPool`]) caching node descriptors carved out
//!   of whole pages, and (with the `ptp-cache` feature) zeroed leaf PTE
//!   pages.
//! - Range walks ([`Segtab::process`]) and teardown ([`Segtab::destroy`])
//!   that report each populated segment to a caller-supplied callback.
//! - Per-CPU publication of the active user table ([`CpuState`],
//!   [`Segtab::activate`]).
//!
//! PTE contents are opaque to the engine except for zero, which means
//! "empty"; every node and leaf page entering a pool freelist is audited
//! observably zero under debug builds.
//!
//! # Usage
//!
//! ```ignore
//! static POOL: segtab::SegtabPool = segtab::SegtabPool::new(&FRAME_ALLOCATOR);
//!
//! let space = segtab::Segtab::new(segtab::SpaceKind::User, min_addr);
//! space.init(&POOL);
//! let pte = space.reserve(&POOL, va, segtab::ReserveFlags::empty());
//! ```

pub mod address;
pub mod arch;
pub mod cpu;
pub mod frame_source;
pub mod node;
pub mod pool;
pub mod pte;
pub mod segtab;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use cpu::{CpuState, INVALID_SEGTAB_ADDRESS, MdHooks};
#[cfg(any(test, feature = "software-emulation"))]
pub use frame_source::EmulatedFrames;
pub use frame_source::FrameSource;
pub use node::SegtabNode;
pub use pool::SegtabPool;
pub use pte::PtEntry;
pub use segtab::{PteCallback, ReserveFlags, Segtab, SpaceKind};

// Re-export the tree geometry at the crate root for convenience.
pub use arch::{PAGE_SHIFT, PAGE_SIZE, PTE_PER_PAGE, SEG_SHIFT, SEG_SIZE, SEGTAB_FANOUT};
#[cfg(target_pointer_width = "64")]
pub use arch::{XSEG_SHIFT, XSEG_SIZE};

// A node must fit in one pool page; the descriptor freelist carves pages
// into whole nodes.
const _: () = assert!(core::mem::size_of::<node::SegtabNode>() <= arch::PAGE_SIZE);
