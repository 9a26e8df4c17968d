//! Synchronous IPC over capability-named channels.
//!
//! Each channel has one rendezvous slot. `recv` publishes the caller in
//! the slot and parks it; `send` from the opposite side of the channel
//! wakes the waiter, copies four message words into its result
//! registers and optionally moves one capability into the slot the
//! waiter declared when it parked, handing the waiter the capability's
//! wire form in `a5`. Message and capability land under one CDT
//! critical section, so no third party can observe half of the pair.

use core::sync::atomic::{AtomicU64, Ordering};

use array_macro::array;
use itertools::izip;

use crate::cap::Cap;
use crate::ctable::CapPtr;
use crate::excpt::Excpt;
use crate::kernel::Kernel;
use crate::param::{N_CAP, N_CHANNEL};
use crate::proc::{Proc, Reg};
use crate::syscall::{Control, CAP_IDX_NONE};

/// One rendezvous slot per channel: `tag << 32 | pid + 1`, zero when
/// nobody waits.
pub(crate) struct Channels {
    waiters: [AtomicU64; N_CHANNEL],
}

impl Channels {
    pub(crate) fn new() -> Self {
        Self {
            waiters: array![_ => AtomicU64::new(0); N_CHANNEL],
        }
    }

    fn pack(pid: usize, tag: u64) -> u64 {
        tag << 32 | pid as u64 + 1
    }

    fn publish(&self, channel: u64, pid: usize, tag: u64) {
        self.waiters[channel as usize].store(Self::pack(pid, tag), Ordering::SeqCst);
    }

    fn waiter(&self, channel: u64) -> Option<(usize, u64)> {
        match self.waiters[channel as usize].load(Ordering::SeqCst) {
            0 => None,
            w => Some(((w as u32 as u64 - 1) as usize, w >> 32)),
        }
    }

    /// Clears the slot, but only if it still names `(pid, tag)`; a
    /// newer waiter must not be wiped by a stale observer.
    fn retire(&self, channel: u64, pid: usize, tag: u64) {
        let _ = self.waiters[channel as usize].compare_exchange(
            Self::pack(pid, tag),
            0,
            Ordering::SeqCst,
            Ordering::Relaxed,
        );
    }
}

impl Kernel {
    /// The socket capability at `cidx`, if it is one.
    fn socket_at(&self, pid: usize, cidx: u64) -> Result<(CapPtr, u64, u64), Excpt> {
        let p = CapPtr::new(pid, cidx).ok_or(Excpt::Index)?;
        match self.ctable.cap(p) {
            Cap::None => Err(Excpt::Empty),
            Cap::Socket { channel, tag } => Ok((p, channel, tag)),
            _ => Err(Excpt::InvalidCap),
        }
    }

    pub(crate) fn sys_sock_recv(
        &self,
        proc: &Proc,
        sock_cidx: u64,
        cap_dst_cidx: u64,
    ) -> Result<Control, Excpt> {
        let (_, channel, tag) = self.socket_at(proc.pid(), sock_cidx)?;
        if tag != 0 {
            return Err(Excpt::InvalidCap);
        }
        self.park(proc, channel, tag, cap_dst_cidx)
    }

    /// Publishes the caller as `channel`'s waiter and parks it. Shared
    /// by `recv` and the receiving half of `sendrecv`.
    fn park(
        &self,
        proc: &Proc,
        channel: u64,
        tag: u64,
        cap_dst_cidx: u64,
    ) -> Result<Control, Excpt> {
        if cap_dst_cidx != CAP_IDX_NONE && cap_dst_cidx >= N_CAP as u64 {
            return Err(Excpt::Index);
        }
        // SAFETY: held by the calling hart.
        unsafe { proc.data() }.cap_dest = cap_dst_cidx;
        self.chans.publish(channel, proc.pid(), tag);
        if proc.ipc_wait(channel) {
            Ok(Control::Block)
        } else {
            // A suspend raced in; withdraw and go down without blocking.
            self.chans.retire(channel, proc.pid(), tag);
            // SAFETY: held by the calling hart.
            unsafe { proc.set_reg(Reg::A0, Excpt::Suspended.code()) };
            Ok(Control::Yield)
        }
    }

    pub(crate) fn sys_sock_send(
        &self,
        proc: &Proc,
        sock_cidx: u64,
        msgs: [u64; 4],
        cap_src_cidx: u64,
    ) -> Result<Control, Excpt> {
        let (sock, channel, tag) = self.socket_at(proc.pid(), sock_cidx)?;
        self.deliver(proc, sock, channel, tag, msgs, cap_src_cidx)?;
        Ok(Control::Resume)
    }

    /// Send followed by receive on the same socket. Clients use it for
    /// RPC; for a server socket the send half is a best-effort reply
    /// and the receive half happens regardless. The capability slot
    /// given in `cap_cidx` is offered on the way out and receives on
    /// the way back.
    pub(crate) fn sys_sock_sendrecv(
        &self,
        proc: &Proc,
        sock_cidx: u64,
        msgs: [u64; 4],
        cap_cidx: u64,
    ) -> Result<Control, Excpt> {
        let (sock, channel, tag) = self.socket_at(proc.pid(), sock_cidx)?;
        match self.deliver(proc, sock, channel, tag, msgs, cap_cidx) {
            Ok(()) => {}
            Err(Excpt::NoReceiver) if tag == 0 => {}
            Err(e) => return Err(e),
        }
        self.park(proc, channel, tag, cap_cidx)
    }

    /// The send half: wake the opposite waiter, transfer, deliver.
    fn deliver(
        &self,
        proc: &Proc,
        sock: CapPtr,
        channel: u64,
        tag: u64,
        msgs: [u64; 4],
        cap_src_cidx: u64,
    ) -> Result<(), Excpt> {
        let (wpid, wtag) = self.chans.waiter(channel).ok_or(Excpt::NoReceiver)?;
        // Servers wake clients, clients wake the server.
        if (tag == 0) == (wtag == 0) {
            return Err(Excpt::NoReceiver);
        }

        // Rendezvous and transfer commit together under the CDT lock.
        let mut guard = self.ctable.lock();
        if self.ctable.is_empty(sock) {
            return Err(Excpt::Empty);
        }
        let peer = self.proc(wpid);
        if !peer.ipc_acquire(channel) {
            // No waiter to wake. Retire the entry unless the peer is
            // still on its way into the park (published, not yet
            // blocked); in that case the next send will find it.
            if peer.state() & crate::proc::PsFlags::SUSPENDED.bits() != 0 {
                self.chans.retire(channel, wpid, wtag);
            }
            return Err(Excpt::NoReceiver);
        }

        let transferred = if cap_src_cidx == CAP_IDX_NONE {
            0
        } else {
            match self.transfer(&mut guard, proc.pid(), cap_src_cidx, peer) {
                Ok(raw) => raw,
                Err(e) => {
                    // The wake never happened as far as the peer can
                    // tell.
                    if !peer.ipc_requeue(channel) {
                        self.chans.retire(channel, wpid, wtag);
                    }
                    return Err(e);
                }
            }
        };

        self.chans.retire(channel, wpid, wtag);
        // SAFETY: the peer is held since `ipc_acquire`.
        unsafe {
            let regs = &mut peer.data().regs;
            regs[Reg::A0 as usize] = Excpt::None.code();
            for (reg, msg) in izip!(&mut regs[Reg::A1 as usize..=Reg::A4 as usize], &msgs) {
                *reg = *msg;
            }
            regs[Reg::A5 as usize] = transferred;
        }
        peer.release();
        Ok(())
    }

    /// Moves the capability at `(sender, cap_src_cidx)` into the slot
    /// the peer declared when it parked, and returns the wire form it
    /// lands as (the move may strip a PMP binding). Any structural
    /// failure leaves both tables and the peer untouched.
    fn transfer(
        &self,
        guard: &mut crate::ctable::CdtGuard<'_>,
        sender: usize,
        cap_src_cidx: u64,
        peer: &Proc,
    ) -> Result<u64, Excpt> {
        let src = CapPtr::new(sender, cap_src_cidx).ok_or(Excpt::SendCap)?;
        // SAFETY: the peer is held by the caller.
        let dst_cidx = unsafe { peer.data() }.cap_dest;
        let dst = CapPtr::new(peer.pid(), dst_cidx).ok_or(Excpt::SendCap)?;
        if self.ctable.is_empty(src) || !self.ctable.is_empty(dst) {
            return Err(Excpt::SendCap);
        }
        self.move_with_hook(guard, src, dst)
            .map_err(|_| Excpt::SendCap)?;
        Ok(self.ctable.cap(dst).raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiter_slot_round_trip() {
        let c = Channels::new();
        assert_eq!(c.waiter(3), None);
        c.publish(3, 5, 7);
        assert_eq!(c.waiter(3), Some((5, 7)));
        // A stale retire does not wipe a fresh waiter.
        c.retire(3, 5, 2);
        assert_eq!(c.waiter(3), Some((5, 7)));
        c.retire(3, 5, 7);
        assert_eq!(c.waiter(3), None);
        // pid 0 and tag 0 are representable.
        c.publish(0, 0, 0);
        assert_eq!(c.waiter(0), Some((0, 0)));
    }
}
