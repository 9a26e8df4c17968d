//! The capability algebra.
//!
//! A capability is exchanged with user space as a packed 64-bit word
//! (`Cap::raw`/`Cap::from_raw`); inside the kernel it is the [`Cap`]
//! enum. The two predicates [`is_child`] and [`is_derivable_from`]
//! define the shape of the derivation tree: `is_child` is the structural
//! relation the revocation loop walks, `is_derivable_from` additionally
//! demands that the parent's watermark is exactly the new capability's
//! begin, so every derivation is an append-only carve.
//!
//! Everything in this module is purely functional.

use bitflags::bitflags;

bitflags! {
    /// Memory access permissions, `pmpcfg`-compatible bit positions.
    pub struct Rwx: u64 {
        const R = 0x1;
        const W = 0x2;
        const X = 0x4;
        const RW = Self::R.bits | Self::W.bits;
        const RX = Self::R.bits | Self::X.bits;
        const RWX = Self::R.bits | Self::W.bits | Self::X.bits;
    }
}

/// Capability kind tags of the wire format.
const TAG_TIME: u64 = 1;
const TAG_MEMORY: u64 = 2;
const TAG_PMP: u64 = 3;
const TAG_MONITOR: u64 = 4;
const TAG_CHANNEL: u64 = 5;
const TAG_SOCKET: u64 = 6;

/// A capability. The zero word is `None`, an empty slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cap {
    None,
    /// Time slots `[begin, end)` on `hart`; `[begin, free)` has been
    /// carved out to children.
    Time { hart: u64, begin: u64, free: u64, end: u64 },
    /// Physical frames `[begin, end)` at base `offset << 27`, in 4 KiB
    /// units. `lock` is set while a PMP child is alive and blocks
    /// further Memory derivation.
    Memory { rwx: Rwx, lock: bool, offset: u64, begin: u64, free: u64, end: u64 },
    /// A NAPOT-encoded region; `used`/`index` track the hardware PMP
    /// slot the owning process bound it to.
    Pmp { rwx: Rwx, used: bool, index: u64, addr: u64 },
    /// Control over processes with pid in `[begin, end)`.
    Monitor { begin: u64, free: u64, end: u64 },
    /// Ownership of IPC channel ids `[begin, end)`.
    Channel { begin: u64, free: u64, end: u64 },
    /// An endpoint on `channel`: `tag == 0` is the server, `tag > 0` a
    /// client.
    Socket { channel: u64, tag: u64 },
}

impl Cap {
    /// A fresh time slice: `free` starts at `begin`.
    pub const fn time(hart: u64, begin: u64, end: u64) -> Self {
        Cap::Time { hart, begin, free: begin, end }
    }

    /// A fresh memory slice, unlocked with nothing carved out.
    pub const fn memory(offset: u64, begin: u64, end: u64, rwx: Rwx) -> Self {
        Cap::Memory { rwx, lock: false, offset, begin, free: begin, end }
    }

    /// A PMP frame not bound to any hardware slot.
    pub const fn pmp(addr: u64, rwx: Rwx) -> Self {
        Cap::Pmp { rwx, used: false, index: 0, addr }
    }

    pub const fn monitor(begin: u64, end: u64) -> Self {
        Cap::Monitor { begin, free: begin, end }
    }

    pub const fn channel(begin: u64, end: u64) -> Self {
        Cap::Channel { begin, free: begin, end }
    }

    pub const fn socket(channel: u64, tag: u64) -> Self {
        Cap::Socket { channel, tag }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Cap::None)
    }

    /// Packs the capability into its 64-bit wire form.
    pub fn raw(&self) -> u64 {
        match *self {
            Cap::None => 0,
            Cap::Time { hart, begin, free, end } => {
                TAG_TIME | hart << 8 | begin << 16 | free << 32 | end << 48
            }
            Cap::Memory { rwx, lock, offset, begin, free, end } => {
                TAG_MEMORY
                    | rwx.bits() << 4
                    | (lock as u64) << 7
                    | offset << 8
                    | begin << 16
                    | free << 32
                    | end << 48
            }
            Cap::Pmp { rwx, used, index, addr } => {
                TAG_PMP | rwx.bits() << 4 | (used as u64) << 7 | index << 8 | addr << 12
            }
            Cap::Monitor { begin, free, end } => {
                TAG_MONITOR | begin << 16 | free << 32 | end << 48
            }
            Cap::Channel { begin, free, end } => {
                TAG_CHANNEL | begin << 16 | free << 32 | end << 48
            }
            Cap::Socket { channel, tag } => TAG_SOCKET | channel << 32 | tag << 48,
        }
    }

    /// Unpacks a wire word. Unknown tags decode to `None`, so a forged
    /// word can never derive or invoke anything.
    pub fn from_raw(raw: u64) -> Self {
        let field16 = |shift: u32| raw >> shift & 0xffff;
        match raw & 0xf {
            TAG_TIME => Cap::Time {
                hart: raw >> 8 & 0xff,
                begin: field16(16),
                free: field16(32),
                end: field16(48),
            },
            TAG_MEMORY => Cap::Memory {
                rwx: Rwx::from_bits_truncate(raw >> 4 & 0x7),
                lock: raw & 1 << 7 != 0,
                offset: raw >> 8 & 0xff,
                begin: field16(16),
                free: field16(32),
                end: field16(48),
            },
            TAG_PMP => Cap::Pmp {
                rwx: Rwx::from_bits_truncate(raw >> 4 & 0x7),
                used: raw & 1 << 7 != 0,
                index: raw >> 8 & 0xf,
                addr: raw >> 12 & 0xffff_ffff_ffff,
            },
            TAG_MONITOR => Cap::Monitor {
                begin: field16(16),
                free: field16(32),
                end: field16(48),
            },
            TAG_CHANNEL => Cap::Channel {
                begin: field16(16),
                free: field16(32),
                end: field16(48),
            },
            TAG_SOCKET => Cap::Socket {
                channel: field16(32),
                tag: field16(48),
            },
            _ => Cap::None,
        }
    }
}

/// Encodes a naturally aligned power-of-two region as a `pmpaddr` value.
/// `base` must be aligned to `size` and `size` must be a power of two,
/// at least 8 bytes.
pub const fn napot_encode(base: u64, size: u64) -> u64 {
    (base >> 2) | ((size >> 3) - 1)
}

/// First byte of the NAPOT region.
pub const fn napot_begin(addr: u64) -> u64 {
    ((addr + 1) & addr) << 2
}

/// One past the last byte of the NAPOT region.
pub const fn napot_end(addr: u64) -> u64 {
    napot_begin(addr) + napot_size(addr)
}

/// Size of the NAPOT region in bytes.
pub const fn napot_size(addr: u64) -> u64 {
    (((addr + 1) ^ addr) + 1) << 2
}

/// Byte range `[begin, end)` covered by a memory slice capability.
/// `begin`/`end` of the capability are 4 KiB frames relative to the
/// 128 MiB block `offset`.
fn memory_bytes(offset: u64, begin: u64, end: u64) -> (u64, u64) {
    ((offset << 27) + (begin << 12), (offset << 27) + (end << 12))
}

fn time_is_child(parent: &Cap, child: &Cap) -> bool {
    if let (
        Cap::Time { hart, begin, end, .. },
        Cap::Time { hart: chart, begin: cbegin, end: cend, .. },
    ) = (parent, child)
    {
        return hart == chart && begin <= cbegin && cend <= end;
    }
    false
}

fn memory_is_child(parent: &Cap, child: &Cap) -> bool {
    if let Cap::Memory { offset, begin, end, .. } = *parent {
        match *child {
            Cap::Memory { offset: coffset, begin: cbegin, end: cend, .. } => {
                return offset == coffset && begin <= cbegin && cend <= end;
            }
            Cap::Pmp { addr, .. } => {
                let (pbegin, pend) = memory_bytes(offset, begin, end);
                return pbegin <= napot_begin(addr) && napot_end(addr) <= pend;
            }
            _ => {}
        }
    }
    false
}

fn monitor_is_child(parent: &Cap, child: &Cap) -> bool {
    if let (
        Cap::Monitor { begin, end, .. },
        Cap::Monitor { begin: cbegin, end: cend, .. },
    ) = (parent, child)
    {
        return begin <= cbegin && cend <= end;
    }
    false
}

fn channel_is_child(parent: &Cap, child: &Cap) -> bool {
    if let Cap::Channel { begin, end, .. } = *parent {
        match *child {
            Cap::Channel { begin: cbegin, end: cend, .. } => {
                return begin <= cbegin && cend <= end;
            }
            Cap::Socket { channel, .. } => return begin <= channel && channel < end,
            _ => {}
        }
    }
    false
}

fn socket_is_child(parent: &Cap, child: &Cap) -> bool {
    if let (
        Cap::Socket { channel, tag },
        Cap::Socket { channel: cchannel, .. },
    ) = (parent, child)
    {
        return *tag == 0 && channel == cchannel;
    }
    false
}

/// Is `child` a structural descendant of `parent`?
///
/// This is the relation the revocation loop uses to decide whether the
/// next list entry still belongs to the subtree being torn down.
pub fn is_child(parent: &Cap, child: &Cap) -> bool {
    match parent {
        Cap::Time { .. } => time_is_child(parent, child),
        Cap::Memory { .. } => memory_is_child(parent, child),
        Cap::Monitor { .. } => monitor_is_child(parent, child),
        Cap::Channel { .. } => channel_is_child(parent, child),
        Cap::Socket { .. } => socket_is_child(parent, child),
        _ => false,
    }
}

fn time_can_derive(parent: &Cap, new: &Cap) -> bool {
    if let (
        Cap::Time { hart, free, end, .. },
        Cap::Time { hart: nhart, begin: nbegin, free: nfree, end: nend },
    ) = (parent, new)
    {
        return hart == nhart
            && free == nbegin
            && nend <= end
            && nbegin == nfree
            && nbegin < nend;
    }
    false
}

fn memory_can_derive(parent: &Cap, new: &Cap) -> bool {
    if let Cap::Memory { rwx, lock, offset, free, end, .. } = *parent {
        match *new {
            Cap::Memory {
                rwx: nrwx,
                lock: nlock,
                offset: noffset,
                begin: nbegin,
                free: nfree,
                end: nend,
            } => {
                return offset == noffset
                    && free == nbegin
                    && nend <= end
                    && nbegin == nfree
                    && nbegin < nend
                    && rwx.contains(nrwx)
                    && !nlock
                    && !lock;
            }
            Cap::Pmp { rwx: nrwx, used, index, addr } => {
                // A PMP child does not advance the watermark; it may
                // carve anywhere in the still-owned suffix, even of a
                // locked parent.
                let (pfree, pend) = memory_bytes(offset, free, end);
                return pfree <= napot_begin(addr)
                    && napot_end(addr) <= pend
                    && rwx.contains(nrwx)
                    && !used
                    && index == 0;
            }
            _ => {}
        }
    }
    false
}

fn monitor_can_derive(parent: &Cap, new: &Cap) -> bool {
    if let (
        Cap::Monitor { free, end, .. },
        Cap::Monitor { begin: nbegin, free: nfree, end: nend },
    ) = (parent, new)
    {
        return free == nbegin && nend <= end && nbegin == nfree && nbegin < nend;
    }
    false
}

fn channel_can_derive(parent: &Cap, new: &Cap) -> bool {
    if let Cap::Channel { free, end, .. } = *parent {
        match *new {
            Cap::Channel { begin: nbegin, free: nfree, end: nend } => {
                return free == nbegin && nend <= end && nbegin == nfree && nbegin < nend;
            }
            // A server socket consumes the next unallocated channel.
            Cap::Socket { channel, tag } => return free == channel && channel < end && tag == 0,
            _ => {}
        }
    }
    false
}

fn socket_can_derive(parent: &Cap, new: &Cap) -> bool {
    if let (
        Cap::Socket { channel, tag },
        Cap::Socket { channel: nchannel, tag: ntag },
    ) = (parent, new)
    {
        return channel == nchannel && *tag == 0 && *ntag > 0;
    }
    false
}

/// Can `new` be carved out of `parent` right now?
///
/// Strictly stronger than [`is_child`]: the parent's watermark must be
/// exactly `new`'s begin and `new` must be freshly allocated
/// (`free == begin`, no lock, no bound PMP slot).
pub fn is_derivable_from(parent: &Cap, new: &Cap) -> bool {
    match parent {
        Cap::Time { .. } => time_can_derive(parent, new),
        Cap::Memory { .. } => memory_can_derive(parent, new),
        Cap::Monitor { .. } => monitor_can_derive(parent, new),
        Cap::Channel { .. } => channel_can_derive(parent, new),
        Cap::Socket { .. } => socket_can_derive(parent, new),
        _ => false,
    }
}
