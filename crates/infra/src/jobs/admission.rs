//! In-memory admission control.
//!
//! Concurrency is a property of the running process, so slots live only in memory and
//! start empty after a restart. Both limits are checked and the slot registered under
//! one lock, so concurrent workers can never overshoot either cap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use reportforge_core::{AdmissionRejection, OwnerId, SlotId};

use super::clock::{Clock, SystemClock};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub max_system: usize,
    pub max_per_owner: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_system: 10,
            max_per_owner: 3,
        }
    }
}

/// One unit of concurrency currently in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSlot {
    pub slot_id: SlotId,
    pub owner: OwnerId,
    pub started_at: DateTime<Utc>,
}

type SlotMap = HashMap<SlotId, RuntimeSlot>;

#[derive(Clone)]
pub struct AdmissionController {
    limits: AdmissionLimits,
    slots: Arc<Mutex<SlotMap>>,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self::with_clock(limits, Arc::new(SystemClock))
    }

    pub fn with_clock(limits: AdmissionLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits,
            slots: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    pub fn limits(&self) -> AdmissionLimits {
        self.limits
    }

    // The map holds plain values, so a panic elsewhere cannot leave it half-updated.
    fn lock(&self) -> MutexGuard<'_, SlotMap> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a slot for `owner`, or report which limit is saturated.
    ///
    /// The slot is released when the returned permit is dropped.
    pub fn try_admit(&self, owner: &OwnerId) -> Result<AdmissionPermit, AdmissionRejection> {
        let mut slots = self.lock();

        let running = slots.len();
        if running >= self.limits.max_system {
            return Err(AdmissionRejection::SystemSaturated {
                running,
                max: self.limits.max_system,
            });
        }

        let mine = slots.values().filter(|s| &s.owner == owner).count();
        if mine >= self.limits.max_per_owner {
            return Err(AdmissionRejection::OwnerSaturated {
                owner: owner.to_string(),
                running: mine,
                max: self.limits.max_per_owner,
            });
        }

        let slot = RuntimeSlot {
            slot_id: SlotId::new(),
            owner: owner.clone(),
            started_at: self.clock.now(),
        };
        slots.insert(slot.slot_id, slot.clone());

        tracing::debug!(
            owner = %owner,
            slot_id = %slot.slot_id,
            running = running + 1,
            owner_running = mine + 1,
            "admission slot acquired"
        );

        Ok(AdmissionPermit {
            slot,
            slots: self.slots.clone(),
        })
    }

    pub fn running_count(&self) -> usize {
        self.lock().len()
    }

    pub fn running_for(&self, owner: &OwnerId) -> usize {
        self.lock().values().filter(|s| &s.owner == owner).count()
    }

    pub fn snapshot(&self) -> Vec<RuntimeSlot> {
        let mut slots: Vec<_> = self.lock().values().cloned().collect();
        slots.sort_by_key(|s| s.started_at);
        slots
    }
}

impl core::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("limits", &self.limits)
            .field("running", &self.running_count())
            .finish()
    }
}

/// Proof of admission. Dropping it releases the slot, also during unwinding.
#[derive(Debug)]
pub struct AdmissionPermit {
    slot: RuntimeSlot,
    slots: Arc<Mutex<SlotMap>>,
}

impl AdmissionPermit {
    pub fn slot(&self) -> &RuntimeSlot {
        &self.slot
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(&self.slot.slot_id);
        tracing::debug!(
            owner = %self.slot.owner,
            slot_id = %self.slot.slot_id,
            running = slots.len(),
            "admission slot released"
        );
    }
}
