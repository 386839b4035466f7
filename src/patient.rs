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

//! Patient lookup.
//!
//! Patients are owned by the patient registry; the recorder only needs to
//! know whether an active (not soft-deleted) patient exists.

use crate::base::PatientId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub id: PatientId,
    pub full_name: String,
    pub deleted: bool,
}

pub trait PatientDirectory: Send + Sync {
    /// Returns the patient unless it is unknown or soft-deleted.
    fn find_active_patient(&self, patient_id: PatientId) -> Option<Patient>;
}

/// Patient directory backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryPatients {
    patients: DashMap<PatientId, Patient>,
}

impl InMemoryPatients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an active patient and returns its id.
    pub fn register(&self, full_name: impl Into<String>) -> PatientId {
        let id = PatientId::new();
        self.insert(Patient {
            id,
            full_name: full_name.into(),
            deleted: false,
        });
        id
    }

    pub fn insert(&self, patient: Patient) {
        self.patients.insert(patient.id, patient);
    }

    /// Marks a patient deleted. Returns false if the patient is unknown.
    pub fn soft_delete(&self, patient_id: PatientId) -> bool {
        match self.patients.get_mut(&patient_id) {
            Some(mut patient) => {
                patient.deleted = true;
                true
            }
            None => false,
        }
    }
}

impl PatientDirectory for InMemoryPatients {
    fn find_active_patient(&self, patient_id: PatientId) -> Option<Patient> {
        self.patients
            .get(&patient_id)
            .filter(|p| !p.deleted)
            .map(|p| p.clone())
    }
}
