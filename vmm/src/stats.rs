//! Observability counters of a machine.
use core::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Event counters of a machine.
        ///
        /// Counters only grow. They are updated with relaxed atomics and can
        /// be read at any time through [`Stats::snapshot`].
        #[derive(Debug, Default)]
        pub struct Stats {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// A point-in-time copy of [`Stats`].
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct StatsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl Stats {
            /// Read every counter.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// VM exits, resolved or reported.
    exits,
    /// I/O instruction exits.
    io_exits,
    /// Accesses handed to the supervisor as MMIO.
    mmio_exits,
    /// External interrupt exits.
    irq_exits,
    /// HLT exits reported to the supervisor.
    halt_exits,
    /// Page faults fixed by the shadow MMU.
    pf_fixed,
    /// Page faults reflected into the guest.
    pf_guest,
    /// Guest TLB flushes.
    tlb_flush,
    /// INVLPG exits.
    invlpg,
    /// Memory reconfigurations restarted because of a concurrent change.
    memslot_retries,
}

/// Bump a counter.
#[inline]
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
