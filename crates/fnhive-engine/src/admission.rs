//! Two-level admission control: machine ceiling and per-user quotas.
//!
//! [AdmissionController::acquire] reserves one machine slot and one user
//! concurrency slot together, before any sandbox is spawned, so a failed
//! check never leaves an orphan reservation. The returned [AdmissionTicket]
//! carries the one-shot release hook; dropping an unreleased ticket
//! releases it, so every exit path — success, error, timeout, panic —
//! restores both counters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use fnhive_store::QuotaStore;

use crate::error::EngineError;

/// The process-wide instance counter as a single owned resource. All
/// mutation goes through [MachineSlots::try_acquire] and
/// [MachineSlots::release]; [MachineSlots::current] is for observability
/// only, never for decisions.
pub struct MachineSlots {
    max: usize,
    in_flight: Mutex<usize>,
}

impl MachineSlots {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            in_flight: Mutex::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reserve one slot; `false` when the ceiling is reached.
    pub fn try_acquire(&self) -> bool {
        let mut in_flight = self.lock();
        if *in_flight >= self.max {
            return false;
        }
        *in_flight += 1;
        true
    }

    pub fn release(&self) {
        let mut in_flight = self.lock();
        *in_flight = in_flight.saturating_sub(1);
    }

    pub fn current(&self) -> usize {
        *self.lock()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// One reserved (machine slot, user concurrency slot) pair.
///
/// Exactly one release ever takes effect; a second call is a no-op. Store
/// failures during release are logged and swallowed — release cannot fail.
pub struct AdmissionTicket {
    owner_id: String,
    slots: Arc<MachineSlots>,
    quotas: Arc<dyn QuotaStore>,
    released: AtomicBool,
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("owner_id", &self.owner_id)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

impl AdmissionTicket {
    fn new(owner_id: String, slots: Arc<MachineSlots>, quotas: Arc<dyn QuotaStore>) -> Self {
        Self {
            owner_id,
            slots,
            quotas,
            released: AtomicBool::new(false),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Release both reservations. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.slots.release();
        if let Err(err) = self.quotas.dec_concurrent(&self.owner_id) {
            warn!(owner_id = %self.owner_id, error = %err, "failed to release user concurrency slot");
        }
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.release();
    }
}

/// Gatekeeper enforcing the machine and per-user ceilings before spawn.
///
/// Per-user atomicity lives in the quota store's conditional row update,
/// so admissions for unrelated owners never contend on anything here
/// beyond the machine counter itself.
pub struct AdmissionController {
    slots: Arc<MachineSlots>,
    quotas: Arc<dyn QuotaStore>,
    max_user_concurrent: i64,
    max_user_cpu_ms: i64,
}

impl AdmissionController {
    pub fn new(
        slots: Arc<MachineSlots>,
        quotas: Arc<dyn QuotaStore>,
        max_user_concurrent: i64,
        max_user_cpu_ms: i64,
    ) -> Self {
        Self {
            slots,
            quotas,
            max_user_concurrent,
            max_user_cpu_ms,
        }
    }

    /// Check both ceilings and reserve one slot pair. The machine slot is
    /// rolled back when any later check rejects.
    pub fn acquire(&self, owner_id: &str) -> Result<AdmissionTicket, EngineError> {
        if !self.slots.try_acquire() {
            return Err(EngineError::MachineAtCapacity(self.slots.max()));
        }
        match self.reserve_user_slot(owner_id) {
            Ok(()) => Ok(AdmissionTicket::new(
                owner_id.to_string(),
                self.slots.clone(),
                self.quotas.clone(),
            )),
            Err(err) => {
                self.slots.release();
                Err(err)
            }
        }
    }

    fn reserve_user_slot(&self, owner_id: &str) -> Result<(), EngineError> {
        let quota = self
            .quotas
            .get(owner_id)?
            .ok_or_else(|| EngineError::QuotaNotInitialized(owner_id.to_string()))?;
        if quota.concurrent_count >= self.max_user_concurrent {
            return Err(EngineError::UserConcurrencyExceeded(self.max_user_concurrent));
        }
        if quota.cpu_time_used_ms >= self.max_user_cpu_ms {
            return Err(EngineError::UserCpuExceeded {
                used: quota.cpu_time_used_ms,
                max: self.max_user_cpu_ms,
            });
        }
        // The conditional update is the authoritative reservation: a
        // concurrent admission for the same owner may take the last slot
        // between the read above and this write.
        if !self
            .quotas
            .try_inc_concurrent(owner_id, self.max_user_concurrent)?
        {
            return Err(EngineError::UserConcurrencyExceeded(self.max_user_concurrent));
        }
        Ok(())
    }
}
