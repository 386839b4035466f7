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

//! Next-dose appointment requests.
//!
//! Appointments belong to an external service. Once a vaccination has been
//! committed the recorder hands an [`AppointmentRequest`] to an
//! [`AppointmentDispatch`], which either calls the service right away
//! ([`InlineDispatch`]) or queues the request for a background worker
//! ([`QueuedDispatch`]). Either way a failure is logged and dropped; it
//! never undoes the vaccination.

use crate::base::{AppointmentId, FacilityId, PatientId, VaccinationId};
use crate::error::AppointmentError;
use chrono::NaiveDate;
use crossbeam::channel::{self, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentRequest {
    /// Vaccination that triggered the follow-up.
    pub vaccination_id: VaccinationId,
    pub patient_id: PatientId,
    pub facility_id: FacilityId,
    pub vaccine_name: String,
    pub dose_number: u32,
    pub date: NaiveDate,
    pub notes: String,
}

/// The external appointment service.
pub trait AppointmentService: Send + Sync {
    fn create_appointment(&self, request: &AppointmentRequest) -> Result<AppointmentId, AppointmentError>;
}

/// Result of handing a request to a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// The service created the appointment.
    Created(AppointmentId),
    /// The request is waiting for the background worker.
    Queued,
    /// The request could not be delivered.
    Failed(AppointmentError),
}

pub trait AppointmentDispatch: Send + Sync {
    fn dispatch(&self, request: AppointmentRequest) -> Dispatched;
}

/// Calls the service on the caller's thread.
pub struct InlineDispatch<S> {
    service: S,
}

impl<S: AppointmentService> InlineDispatch<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

impl<S: AppointmentService> AppointmentDispatch for InlineDispatch<S> {
    fn dispatch(&self, request: AppointmentRequest) -> Dispatched {
        match self.service.create_appointment(&request) {
            Ok(id) => {
                info!(
                    appointment_id = %id,
                    vaccine = %request.vaccine_name,
                    dose = request.dose_number,
                    date = %request.date,
                    "next dose appointment created"
                );
                Dispatched::Created(id)
            }
            Err(err) => {
                warn!(vaccination_id = %request.vaccination_id, error = %err, "failed to create next dose appointment");
                Dispatched::Failed(err)
            }
        }
    }
}

type Outcomes = DashMap<VaccinationId, Result<AppointmentId, AppointmentError>>;

/// Feeds requests through a channel to a worker thread.
///
/// The worker records each outcome by vaccination id so it can be looked up
/// once the service has answered.
pub struct QueuedDispatch {
    sender: Mutex<Option<Sender<AppointmentRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    outcomes: Arc<Outcomes>,
}

impl QueuedDispatch {
    /// Starts the worker thread.
    pub fn spawn<S>(service: S) -> Self
    where
        S: AppointmentService + 'static,
    {
        let (sender, receiver) = channel::unbounded::<AppointmentRequest>();
        let outcomes = Arc::new(Outcomes::new());
        let worker_outcomes = Arc::clone(&outcomes);

        let worker = thread::spawn(move || {
            // Runs until every sender is dropped.
            for request in receiver {
                let outcome = service.create_appointment(&request);
                match &outcome {
                    Ok(id) => info!(
                        appointment_id = %id,
                        vaccine = %request.vaccine_name,
                        dose = request.dose_number,
                        date = %request.date,
                        "next dose appointment created"
                    ),
                    Err(err) => warn!(
                        vaccination_id = %request.vaccination_id,
                        error = %err,
                        "failed to create next dose appointment"
                    ),
                }
                worker_outcomes.insert(request.vaccination_id, outcome);
            }
        });

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            outcomes,
        }
    }

    /// Outcome for a vaccination's follow-up, once the worker has handled it.
    ///
    /// Outcomes stay stored until taken with [`Self::take_outcome`].
    pub fn outcome(&self, vaccination_id: VaccinationId) -> Option<Result<AppointmentId, AppointmentError>> {
        self.outcomes.get(&vaccination_id).map(|o| o.clone())
    }

    /// Removes and returns the outcome for a vaccination's follow-up.
    pub fn take_outcome(
        &self,
        vaccination_id: VaccinationId,
    ) -> Option<Result<AppointmentId, AppointmentError>> {
        self.outcomes.remove(&vaccination_id).map(|(_, o)| o)
    }

    /// Number of outcomes not yet taken.
    pub fn pending_outcomes(&self) -> usize {
        self.outcomes.len()
    }

    /// Stops accepting requests and waits for the queue to drain.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take()
            && worker.join().is_err()
        {
            warn!("appointment worker panicked");
        }
    }
}

impl AppointmentDispatch for QueuedDispatch {
    fn dispatch(&self, request: AppointmentRequest) -> Dispatched {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            warn!(vaccination_id = %request.vaccination_id, "appointment queue is shut down");
            return Dispatched::Failed(AppointmentError::Unavailable);
        };
        match sender.send(request) {
            Ok(()) => Dispatched::Queued,
            Err(err) => {
                warn!(vaccination_id = %err.0.vaccination_id, "appointment worker is gone");
                Dispatched::Failed(AppointmentError::Unavailable)
            }
        }
    }
}

impl Drop for QueuedDispatch {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Appointment service that keeps requests in memory.
#[derive(Debug, Default)]
pub struct InMemoryAppointments {
    created: Mutex<Vec<(AppointmentId, AppointmentRequest)>>,
    failing: AtomicBool,
}

impl InMemoryAppointments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following call fail with [`AppointmentError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn created(&self) -> Vec<(AppointmentId, AppointmentRequest)> {
        self.created.lock().clone()
    }
}

impl AppointmentService for InMemoryAppointments {
    fn create_appointment(&self, request: &AppointmentRequest) -> Result<AppointmentId, AppointmentError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(AppointmentError::Unavailable);
        }
        let id = AppointmentId::new();
        self.created.lock().push((id, request.clone()));
        Ok(id)
    }
}

impl<S: AppointmentService + ?Sized> AppointmentService for Arc<S> {
    fn create_appointment(&self, request: &AppointmentRequest) -> Result<AppointmentId, AppointmentError> {
        (**self).create_appointment(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(vaccination: u64) -> AppointmentRequest {
        AppointmentRequest {
            vaccination_id: VaccinationId(vaccination),
            patient_id: PatientId::new(),
            facility_id: FacilityId::new("FAC-1"),
            vaccine_name: "OPV".to_string(),
            dose_number: 2,
            date: NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
            notes: "Auto-scheduled for OPV dose 2".to_string(),
        }
    }

    #[test]
    fn inline_dispatch_reports_created() {
        let service = Arc::new(InMemoryAppointments::new());
        let dispatch = InlineDispatch::new(Arc::clone(&service));
        let result = dispatch.dispatch(request(1));
        assert!(matches!(result, Dispatched::Created(_)));
        assert_eq!(service.created().len(), 1);
    }

    #[test]
    fn inline_dispatch_reports_failure() {
        let service = Arc::new(InMemoryAppointments::new());
        service.set_failing(true);
        let dispatch = InlineDispatch::new(Arc::clone(&service));
        assert_eq!(
            dispatch.dispatch(request(1)),
            Dispatched::Failed(AppointmentError::Unavailable)
        );
        assert!(service.created().is_empty());
    }

    #[test]
    fn queued_dispatch_drains_on_shutdown() {
        let service = Arc::new(InMemoryAppointments::new());
        let dispatch = QueuedDispatch::spawn(Arc::clone(&service));

        for i in 1..=5 {
            assert_eq!(dispatch.dispatch(request(i)), Dispatched::Queued);
        }
        dispatch.shutdown();

        assert_eq!(service.created().len(), 5);
        for i in 1..=5 {
            assert!(matches!(dispatch.outcome(VaccinationId(i)), Some(Ok(_))));
        }
    }

    #[test]
    fn queued_dispatch_records_failures() {
        let service = Arc::new(InMemoryAppointments::new());
        service.set_failing(true);
        let dispatch = QueuedDispatch::spawn(Arc::clone(&service));
        dispatch.dispatch(request(9));
        dispatch.shutdown();
        assert_eq!(
            dispatch.outcome(VaccinationId(9)),
            Some(Err(AppointmentError::Unavailable))
        );
    }

    #[test]
    fn taking_an_outcome_removes_it() {
        let dispatch = QueuedDispatch::spawn(InMemoryAppointments::new());
        dispatch.dispatch(request(1));
        dispatch.dispatch(request(2));
        dispatch.shutdown();
        assert_eq!(dispatch.pending_outcomes(), 2);

        assert!(matches!(dispatch.take_outcome(VaccinationId(1)), Some(Ok(_))));
        assert_eq!(dispatch.take_outcome(VaccinationId(1)), None);
        assert_eq!(dispatch.outcome(VaccinationId(1)), None);
        assert_eq!(dispatch.pending_outcomes(), 1);
    }

    #[test]
    fn dispatch_after_shutdown_fails() {
        let dispatch = QueuedDispatch::spawn(InMemoryAppointments::new());
        dispatch.shutdown();
        assert_eq!(
            dispatch.dispatch(request(1)),
            Dispatched::Failed(AppointmentError::Unavailable)
        );
    }
}
