//! Watering schedule store.
//!
//! `syncSchedule` replaces the whole program atomically — the paired app is
//! the source of truth and always pushes the complete schedule. Entries are
//! validated against the solenoid bank before anything is stored.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::service::{CommandService, ServiceOutcome};
use crate::solenoid::SolenoidBank;
use crate::{STATUS_BAD_PAYLOAD, STATUS_INVALID_REQUEST};

/// Minutes in a day; `start_minute` must stay below this.
const MINUTES_PER_DAY: u16 = 1440;

/// One watering window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Valve channel to open.
    pub channel: u8,
    /// Minute of day the window starts, 0..1440.
    pub start_minute: u16,
    /// Window length in minutes, 1..=1440.
    pub duration_minutes: u16,
    /// Bit i set = active on weekday i, Monday = bit 0. Zero means never.
    pub weekdays: u8,
}

/// In-memory schedule program, replaced wholesale by `syncSchedule`.
pub struct ScheduleStore {
    bank: Arc<SolenoidBank>,
    program: Mutex<Vec<ScheduleEntry>>,
}

impl ScheduleStore {
    pub fn new(bank: Arc<SolenoidBank>) -> Self {
        Self {
            bank,
            program: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the active program.
    pub fn program(&self) -> Vec<ScheduleEntry> {
        self.program
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn validate(&self, entries: &[ScheduleEntry]) -> bool {
        entries.iter().all(|e| {
            (e.channel as usize) < self.bank.channel_count()
                && e.start_minute < MINUTES_PER_DAY
                && e.duration_minutes >= 1
                && e.duration_minutes <= MINUTES_PER_DAY
                && e.weekdays & 0x80 == 0
        })
    }
}

impl CommandService for ScheduleStore {
    fn op(&self) -> &'static str {
        "syncSchedule"
    }

    fn handle(&self, payload: Option<&[u8]>) -> ServiceOutcome {
        let Some(payload) = payload else {
            return ServiceOutcome::error(STATUS_BAD_PAYLOAD);
        };
        let entries: Vec<ScheduleEntry> = match serde_json::from_slice(payload) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(error = %e, "schedule payload rejected");
                return ServiceOutcome::error(STATUS_BAD_PAYLOAD);
            }
        };

        if !self.validate(&entries) {
            return ServiceOutcome::error(STATUS_INVALID_REQUEST);
        }

        let count = entries.len();
        *self
            .program
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = entries;
        tracing::info!(entries = count, "schedule replaced");
        ServiceOutcome::ok()
    }
}
