//! The closed set of exception codes returned by system calls.

/// First result of every system call, delivered in `a0`.
///
/// The set is closed: user-space shims match on the numeric value, so
/// the discriminants are part of the syscall ABI.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum Excpt {
    /// Success.
    None = 0,
    /// Capability, register, PMP or slot index out of range.
    Index = 1,
    /// An expected occupied slot is empty. Also returned when the
    /// capability under operation was revoked mid-flight.
    Empty = 2,
    /// An expected empty slot is occupied, or a PMP/schedule slot is
    /// already bound.
    Collision = 3,
    /// The proposed capability cannot be derived from its parent.
    Derivation = 4,
    /// The capability kind does not match the attempted invocation.
    InvalidCap = 5,
    /// The operation was aborted by a preemption check; re-issuing the
    /// call resumes it.
    Preempted = 6,
    /// The caller or its counterparty is suspended.
    Suspended = 7,
    /// The monitored process is held by another actor.
    MonitorBusy = 8,
    /// The target pid lies outside the monitor capability's range.
    MonitorPid = 9,
    /// An IPC send found no matching waiter.
    NoReceiver = 10,
    /// The capability-transfer leg of an IPC send would violate the
    /// table invariants; no message was delivered.
    SendCap = 11,
    /// The operation is valid in principle but not provided for this
    /// capability kind.
    Unimplemented = 12,
}

impl Excpt {
    /// The wire representation written to `a0`.
    pub const fn code(self) -> u64 {
        self as u64
    }
}
