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

//! Recording of administered doses.
//!
//! A recording validates the patient and dose, draws one dose from the stock
//! ledger, stores the vaccination and then asks for the next-dose
//! appointment. The first four steps succeed or fail together:
//!
//! | Step | Failure |
//! |------|---------|
//! | Patient lookup | `PatientNotFound` |
//! | Dose slot reservation | `DuplicateDose` |
//! | Dose number check | `InvalidDoseNumber` |
//! | Stock allocation | `Inventory(..)` |
//! | Store vaccination | cannot fail |
//! | Next-dose appointment | logged, never an error |
//!
//! # Thread Safety
//!
//! The dose slot stays reserved while stock is allocated and the record is
//! stored, so two concurrent recordings of the same dose never both take
//! stock. The appointment request is sent after the reservation and every
//! ledger lock have been released.

use crate::appointment::{AppointmentDispatch, AppointmentRequest, Dispatched};
use crate::base::{AppointmentId, BatchId, FacilityId, PatientId, UserId, same_vaccine};
use crate::error::{RecordingError, StockError};
use crate::ledger::StockLedger;
use crate::patient::PatientDirectory;
use crate::schedule::DosingSchedule;
use crate::vaccination::{NewVaccination, Vaccination, VaccinationRegistry, VaccinationView};
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A dose to record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordVaccination {
    pub patient_id: PatientId,
    pub vaccine_name: String,
    pub dose_number: u32,
    pub date_administered: NaiveDate,
    pub facility_id: FacilityId,
    /// Draw from this batch instead of the earliest-expiring one.
    pub batch_id: Option<BatchId>,
    pub administration_site: Option<String>,
    pub notes: Option<String>,
}

/// Follow-up appointment requested for the next dose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextAppointment {
    /// Known when the appointment was created before `record` returned.
    pub id: Option<AppointmentId>,
    pub date: NaiveDate,
    pub dose_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedVaccination {
    pub vaccination: Vaccination,
    pub next_appointment: Option<NextAppointment>,
}

pub struct VaccinationRecorder {
    ledger: Arc<StockLedger>,
    patients: Arc<dyn PatientDirectory>,
    appointments: Arc<dyn AppointmentDispatch>,
    schedule: DosingSchedule,
    registry: VaccinationRegistry,
}

impl VaccinationRecorder {
    /// Creates a recorder using the default dosing schedule.
    pub fn new(
        ledger: Arc<StockLedger>,
        patients: Arc<dyn PatientDirectory>,
        appointments: Arc<dyn AppointmentDispatch>,
    ) -> Self {
        Self {
            ledger,
            patients,
            appointments,
            schedule: DosingSchedule::default(),
            registry: VaccinationRegistry::new(),
        }
    }

    pub fn with_schedule(mut self, schedule: DosingSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn ledger(&self) -> &StockLedger {
        &self.ledger
    }

    pub fn schedule(&self) -> &DosingSchedule {
        &self.schedule
    }

    pub fn registry(&self) -> &VaccinationRegistry {
        &self.registry
    }

    /// Records one administered dose.
    ///
    /// # Errors
    ///
    /// - [`RecordingError::PatientNotFound`] - No active patient with that id.
    /// - [`RecordingError::DuplicateDose`] - The patient already has this dose.
    /// - [`RecordingError::InvalidDoseNumber`] - Dose is zero or past the vaccine's maximum.
    /// - [`RecordingError::Inventory`] - No dose could be taken from stock.
    ///   A pinned batch must belong to the request's facility and vaccine.
    ///
    /// On error nothing is stored and no stock is moved.
    pub fn record(
        &self,
        request: RecordVaccination,
        actor: UserId,
    ) -> Result<RecordedVaccination, RecordingError> {
        info!(
            patient_id = %request.patient_id,
            vaccine = %request.vaccine_name,
            dose = request.dose_number,
            "recording vaccination"
        );

        if self.patients.find_active_patient(request.patient_id).is_none() {
            return Err(RecordingError::PatientNotFound);
        }

        let reservation =
            self.registry
                .reserve(request.patient_id, &request.vaccine_name, request.dose_number)?;

        let max_doses = self.schedule.max_doses(&request.vaccine_name);
        if request.dose_number == 0 || request.dose_number > max_doses {
            return Err(RecordingError::InvalidDoseNumber {
                vaccine: request.vaccine_name,
                dose: request.dose_number,
                max_doses,
            });
        }

        let batch_id = match request.batch_id {
            Some(batch_id) => {
                let batch = self
                    .ledger
                    .batch(batch_id)
                    .filter(|b| b.facility_id == request.facility_id)
                    .ok_or(StockError::BatchNotFound)?;
                if !same_vaccine(&batch.vaccine_name, &request.vaccine_name) {
                    return Err(StockError::VaccineMismatch.into());
                }
                self.ledger.allocate_from_batch(batch_id, 1, actor)?;
                batch_id
            }
            None => {
                let allocation = self.ledger.allocate_by_vaccine(
                    &request.facility_id,
                    &request.vaccine_name,
                    1,
                    actor,
                )?;
                debug!(batch_id = %allocation.batch_id, "batch selected automatically");
                allocation.batch_id
            }
        };

        let vaccination = reservation.commit(NewVaccination {
            batch_id,
            nurse_id: actor,
            vaccine_name: request.vaccine_name,
            date_administered: request.date_administered,
            facility_id: request.facility_id,
            administration_site: request.administration_site,
            notes: request.notes,
        });
        info!(
            vaccination_id = %vaccination.id,
            batch_id = %batch_id,
            "vaccination recorded"
        );

        let next_appointment = self.schedule_next_dose(&vaccination);
        Ok(RecordedVaccination {
            vaccination,
            next_appointment,
        })
    }

    /// A patient's vaccinations, newest first.
    ///
    /// # Errors
    ///
    /// [`RecordingError::PatientNotFound`] unless the patient is active.
    pub fn history(&self, patient_id: PatientId) -> Result<Vec<VaccinationView>, RecordingError> {
        if self.patients.find_active_patient(patient_id).is_none() {
            return Err(RecordingError::PatientNotFound);
        }
        Ok(self.views(self.registry.for_patient(patient_id)))
    }

    pub fn by_facility(&self, facility_id: &FacilityId) -> Vec<VaccinationView> {
        let found = self.registry.for_facility(facility_id);
        debug!(facility = %facility_id, count = found.len(), "vaccinations for facility");
        self.views(found)
    }

    /// Vaccinations at a facility administered between `start` and `end`, inclusive.
    pub fn by_facility_between(
        &self,
        facility_id: &FacilityId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<VaccinationView> {
        self.views(self.registry.for_facility_between(facility_id, start, end))
    }

    pub fn by_batch(&self, batch_id: BatchId) -> Vec<VaccinationView> {
        self.views(self.registry.for_batch(batch_id))
    }

    /// Resolves the batch number and patient name for a vaccination.
    pub fn view(&self, vaccination: &Vaccination) -> VaccinationView {
        VaccinationView {
            vaccination: vaccination.clone(),
            patient_name: self
                .patients
                .find_active_patient(vaccination.patient_id)
                .map(|p| p.full_name),
            batch_number: self
                .ledger
                .batch(vaccination.batch_id)
                .map(|b| b.batch_number),
            next_appointment_id: None,
            next_appointment_date: None,
        }
    }

    /// Like [`view`](Self::view), carrying the next appointment as well.
    pub fn view_recorded(&self, recorded: &RecordedVaccination) -> VaccinationView {
        let mut view = self.view(&recorded.vaccination);
        if let Some(next) = recorded.next_appointment {
            view.next_appointment_id = next.id;
            view.next_appointment_date = Some(next.date);
        }
        view
    }

    fn views(&self, vaccinations: Vec<Vaccination>) -> Vec<VaccinationView> {
        vaccinations.iter().map(|v| self.view(v)).collect()
    }

    /// Best effort. Failures are logged and reported as no appointment.
    fn schedule_next_dose(&self, vaccination: &Vaccination) -> Option<NextAppointment> {
        let vaccine = &vaccination.vaccine_name;
        let Some(next_dose) = self.schedule.next_dose(vaccine, vaccination.dose_number) else {
            info!(
                vaccine = %vaccine,
                dose = vaccination.dose_number,
                max_doses = self.schedule.max_doses(vaccine),
                "no next dose"
            );
            return None;
        };

        let interval = self.schedule.interval_days(vaccine);
        if interval == 0 {
            info!(vaccine = %vaccine, "no dose interval configured, skipping appointment");
            return None;
        }
        let Some(date) = vaccination
            .date_administered
            .checked_add_days(Days::new(u64::from(interval)))
        else {
            warn!(vaccine = %vaccine, interval, "next dose date out of range");
            return None;
        };

        let request = AppointmentRequest {
            vaccination_id: vaccination.id,
            patient_id: vaccination.patient_id,
            facility_id: vaccination.facility_id.clone(),
            vaccine_name: vaccine.clone(),
            dose_number: next_dose,
            date,
            notes: format!("Auto-scheduled for {vaccine} dose {next_dose}"),
        };

        let id = match self.appointments.dispatch(request) {
            Dispatched::Created(id) => Some(id),
            Dispatched::Queued => None,
            Dispatched::Failed(_) => return None,
        };
        Some(NextAppointment {
            id,
            date,
            dose_number: next_dose,
        })
    }
}
