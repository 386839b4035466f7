// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Vaccination records.
//!
//! The [`VaccinationRegistry`] stores administered doses and guards the
//! `(patient, vaccine, dose)` uniqueness rule. A recording first takes a
//! [`DoseReservation`] on its slot; only the holder of the reservation can
//! persist that dose, and dropping it without committing frees the slot.

use crate::base::{AppointmentId, BatchId, FacilityId, PatientId, UserId, VaccinationId, vaccine_key};
use crate::error::RecordingError;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// One administered dose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vaccination {
    pub id: VaccinationId,
    pub patient_id: PatientId,
    /// Batch the dose was actually drawn from.
    pub batch_id: BatchId,
    pub nurse_id: UserId,
    pub vaccine_name: String,
    pub dose_number: u32,
    pub date_administered: NaiveDate,
    pub facility_id: FacilityId,
    pub administration_site: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A vaccination with the details a caller usually wants alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaccinationView {
    #[serde(flatten)]
    pub vaccination: Vaccination,
    pub patient_name: Option<String>,
    pub batch_number: Option<String>,
    pub next_appointment_id: Option<AppointmentId>,
    pub next_appointment_date: Option<NaiveDate>,
}

/// Fields of a vaccination before it is stored.
#[derive(Debug, Clone)]
pub(crate) struct NewVaccination {
    pub batch_id: BatchId,
    pub nurse_id: UserId,
    pub vaccine_name: String,
    pub date_administered: NaiveDate,
    pub facility_id: FacilityId,
    pub administration_site: Option<String>,
    pub notes: Option<String>,
}

type DoseKey = (PatientId, String, u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// A recording for this dose is in progress.
    Reserved,
    Recorded(VaccinationId),
}

#[derive(Debug)]
pub struct VaccinationRegistry {
    slots: DashMap<DoseKey, Slot>,
    records: DashMap<VaccinationId, Vaccination>,
    next_id: AtomicU64,
}

impl VaccinationRegistry {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            records: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Claims the slot for a dose.
    ///
    /// Vaccine names compare case-insensitively.
    ///
    /// # Errors
    ///
    /// [`RecordingError::DuplicateDose`] if the dose is already recorded or
    /// another recording of it is in progress.
    pub fn reserve(
        &self,
        patient_id: PatientId,
        vaccine_name: &str,
        dose_number: u32,
    ) -> Result<DoseReservation<'_>, RecordingError> {
        let key = (patient_id, vaccine_key(vaccine_name), dose_number);
        match self.slots.entry(key.clone()) {
            Entry::Occupied(_) => Err(RecordingError::DuplicateDose),
            Entry::Vacant(entry) => {
                entry.insert(Slot::Reserved);
                Ok(DoseReservation {
                    registry: self,
                    key,
                    committed: false,
                })
            }
        }
    }

    /// True if the dose has been recorded.
    pub fn contains(&self, patient_id: PatientId, vaccine_name: &str, dose_number: u32) -> bool {
        let key = (patient_id, vaccine_key(vaccine_name), dose_number);
        matches!(self.slots.get(&key).map(|s| *s), Some(Slot::Recorded(_)))
    }

    pub fn get(&self, id: VaccinationId) -> Option<Vaccination> {
        self.records.get(&id).map(|v| v.clone())
    }

    /// A patient's vaccinations, most recently administered first.
    pub fn for_patient(&self, patient_id: PatientId) -> Vec<Vaccination> {
        let mut found = self.collect(|v| v.patient_id == patient_id);
        found.sort_by(|a, b| {
            b.date_administered
                .cmp(&a.date_administered)
                .then(b.id.cmp(&a.id))
        });
        found
    }

    /// Vaccinations given at a facility, in recording order.
    pub fn for_facility(&self, facility_id: &FacilityId) -> Vec<Vaccination> {
        self.collect(|v| v.facility_id == *facility_id)
    }

    /// Vaccinations given at a facility between two dates, inclusive.
    pub fn for_facility_between(
        &self,
        facility_id: &FacilityId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<Vaccination> {
        self.collect(|v| {
            v.facility_id == *facility_id && (start..=end).contains(&v.date_administered)
        })
    }

    pub fn for_batch(&self, batch_id: BatchId) -> Vec<Vaccination> {
        self.collect(|v| v.batch_id == batch_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn collect(&self, keep: impl Fn(&Vaccination) -> bool) -> Vec<Vaccination> {
        let mut found: Vec<Vaccination> = self
            .records
            .iter()
            .filter(|v| keep(v.value()))
            .map(|v| v.value().clone())
            .collect();
        found.sort_by_key(|v| v.id);
        found
    }
}

impl Default for VaccinationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive claim on one `(patient, vaccine, dose)` slot.
///
/// Dropping the reservation without calling [`commit`](Self::commit)
/// releases the slot so the dose can be recorded later.
#[derive(Debug)]
pub struct DoseReservation<'a> {
    registry: &'a VaccinationRegistry,
    key: DoseKey,
    committed: bool,
}

impl DoseReservation<'_> {
    pub fn patient_id(&self) -> PatientId {
        self.key.0
    }

    pub fn dose_number(&self) -> u32 {
        self.key.2
    }

    /// Stores the vaccination and marks the slot recorded.
    pub(crate) fn commit(mut self, new: NewVaccination) -> Vaccination {
        let id = VaccinationId(self.registry.next_id.fetch_add(1, Ordering::SeqCst));
        let vaccination = Vaccination {
            id,
            patient_id: self.patient_id(),
            batch_id: new.batch_id,
            nurse_id: new.nurse_id,
            vaccine_name: new.vaccine_name,
            dose_number: self.dose_number(),
            date_administered: new.date_administered,
            facility_id: new.facility_id,
            administration_site: new.administration_site,
            notes: new.notes,
            created_at: Utc::now(),
        };

        self.registry.records.insert(id, vaccination.clone());
        self.registry.slots.insert(self.key.clone(), Slot::Recorded(id));
        self.committed = true;
        vaccination
    }
}

impl Drop for DoseReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry
                .slots
                .remove_if(&self.key, |_, slot| *slot == Slot::Reserved);
        }
    }
}
