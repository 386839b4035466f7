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

//! # Vaccine Ledger
//!
//! This library tracks vaccine stock at health facilities and records the
//! doses given from it. Stock arrives in batches with an expiry date; doses
//! are drawn first-expiry-first-out, and every change to a batch is written
//! to an append-only movement log.
//!
//! ## Core Components
//!
//! - [`StockLedger`]: Receives, allocates, adjusts and writes off batch stock
//! - [`VaccinationRecorder`]: Records a dose, draws it from stock and asks for the next appointment
//! - [`DosingSchedule`]: Maximum doses and dose intervals per vaccine
//! - [`StockError`] and [`RecordingError`]: Why an operation was refused
//!
//! ## Example
//!
//! ```
//! use chrono::{Days, Utc};
//! use vaccine_ledger::{FacilityId, NewBatch, StockLedger, UserId};
//!
//! let ledger = StockLedger::new();
//! let today = Utc::now().date_naive();
//! let facility = FacilityId::new("FAC-1");
//!
//! ledger
//!     .receive(
//!         NewBatch {
//!             facility_id: facility.clone(),
//!             batch_number: "B-001".to_string(),
//!             vaccine_name: "BCG".to_string(),
//!             manufacturer: "Serum Institute".to_string(),
//!             quantity: 10,
//!             expiry_date: today + Days::new(180),
//!             receipt_date: today,
//!         },
//!         UserId(1),
//!     )
//!     .unwrap();
//!
//! let allocation = ledger.allocate_by_vaccine(&facility, "bcg", 1, UserId(2)).unwrap();
//! assert_eq!(allocation.remaining, 9);
//! ```
//!
//! ## Thread Safety
//!
//! Every batch carries its own lock, so allocations against the same batch
//! serialize while different batches and facilities proceed in parallel.

pub mod allocator;
pub mod appointment;
mod base;
pub mod batch;
pub mod clock;
pub mod error;
mod ledger;
pub mod movement;
pub mod patient;
mod recorder;
mod report;
pub mod schedule;
pub mod vaccination;

pub use appointment::{
    AppointmentDispatch, AppointmentRequest, AppointmentService, Dispatched, InMemoryAppointments,
    InlineDispatch, QueuedDispatch,
};
pub use base::{AppointmentId, BatchId, FacilityId, MovementId, PatientId, UserId, VaccinationId};
pub use batch::{Batch, BatchSnapshot, BatchView, NewBatch};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{AppointmentError, ErrorKind, RecordingError, StockError};
pub use ledger::{AdjustStock, AdjustmentReason, Allocation, StockLedger};
pub use movement::{Direction, Movement, MovementFilter, MovementType};
pub use patient::{InMemoryPatients, Patient, PatientDirectory};
pub use recorder::{NextAppointment, RecordVaccination, RecordedVaccination, VaccinationRecorder};
pub use report::{StockLevel, StockStatus};
pub use schedule::{DoseRule, DosingSchedule};
pub use vaccination::{Vaccination, VaccinationRegistry, VaccinationView};
