use portable_atomic::{AtomicBool, Ordering};

/// Single-slot mailbox between the DRDY interrupt and the driver.
///
/// The ISR must do nothing but call [`DrdySignal::signal`]; the driver drains the flag at the
/// start of [`poll`](crate::EsWifi::poll). Multiple edges between two polls collapse into one
/// service request, which is fine: the driver re-reads the DRDY line level anyway.
///
/// Intended to live in a `static`:
/// ```
/// use eswifi_hal::DrdySignal;
///
/// static DRDY: DrdySignal = DrdySignal::new();
/// ```
pub struct DrdySignal {
    pending: AtomicBool,
}

impl DrdySignal {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
        }
    }

    /// Request servicing. Safe to call from interrupt context.
    pub fn signal(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Consume a pending service request, if any.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::Acquire)
    }

    /// Drop any pending request without acting on it.
    pub fn reset(&self) {
        self.pending.store(false, Ordering::Relaxed);
    }
}

impl Default for DrdySignal {
    fn default() -> Self {
        Self::new()
    }
}
