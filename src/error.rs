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

//! Error types for stock ledger operations and vaccination recording.

use crate::base::BatchId;
use thiserror::Error;

/// Coarse classification callers use to map failures onto responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Patient or batch does not exist.
    NotFound,
    /// Duplicate batch or duplicate dose.
    Conflict,
    /// Request is malformed for the current reference data.
    InvalidInput,
    /// Out of stock or quantity exceeds what remains.
    InsufficientStock,
    /// An external collaborator failed.
    DownstreamFailure,
    /// The ledger detected an inconsistency in its own records.
    Internal,
}

/// Stock ledger errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StockError {
    /// No batch with the given id, or no batch with the given number in the facility
    #[error("batch not found")]
    BatchNotFound,

    /// The (batch number, facility) pair is already registered
    #[error("batch number already exists in this facility")]
    DuplicateBatch,

    /// No available batch for the facility and vaccine
    #[error("no available stock for vaccine")]
    OutOfStock,

    /// The batch does not hold enough doses for the request
    #[error("insufficient stock (available: {available}, requested: {requested})")]
    InsufficientQuantity { available: u32, requested: u32 },

    /// The batch holds a different vaccine than the caller expected
    #[error("vaccine mismatch for batch")]
    VaccineMismatch,

    /// The batch is past its expiry date
    #[error("batch {0} has expired")]
    BatchExpired(BatchId),

    /// Quantity is zero
    #[error("invalid quantity (must be non-zero)")]
    InvalidQuantity,

    /// The adjustment reason can only remove stock
    #[error("adjustment reason only allows removing stock")]
    InvalidAdjustment,

    /// Replaying the movement log does not reproduce the batch quantity
    #[error("ledger mismatch for batch {batch}: recorded {recorded}, replayed {replayed}")]
    LedgerMismatch {
        batch: BatchId,
        recorded: u32,
        replayed: i64,
    },
}

impl StockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BatchNotFound => ErrorKind::NotFound,
            Self::DuplicateBatch => ErrorKind::Conflict,
            Self::OutOfStock | Self::InsufficientQuantity { .. } => ErrorKind::InsufficientStock,
            Self::VaccineMismatch
            | Self::BatchExpired(_)
            | Self::InvalidQuantity
            | Self::InvalidAdjustment => ErrorKind::InvalidInput,
            Self::LedgerMismatch { .. } => ErrorKind::Internal,
        }
    }
}

/// Vaccination recording errors.
///
/// Every variant aborts the recording with no vaccination persisted and no
/// stock movement applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordingError {
    /// Patient does not exist or was soft-deleted
    #[error("patient not found")]
    PatientNotFound,

    /// The dose was already administered to the patient
    #[error("this dose has already been administered to the patient")]
    DuplicateDose,

    /// Dose number is zero or beyond the vaccine's schedule
    #[error("invalid dose number {dose} ({vaccine} has a maximum of {max_doses} doses)")]
    InvalidDoseNumber {
        vaccine: String,
        dose: u32,
        max_doses: u32,
    },

    /// Stock allocation failed
    #[error("failed to update inventory: {0}")]
    Inventory(#[from] StockError),
}

impl RecordingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PatientNotFound => ErrorKind::NotFound,
            Self::DuplicateDose => ErrorKind::Conflict,
            Self::InvalidDoseNumber { .. } => ErrorKind::InvalidInput,
            Self::Inventory(err) => err.kind(),
        }
    }
}

/// Errors reported by the external appointment service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppointmentError {
    /// The service refused the request
    #[error("appointment rejected: {0}")]
    Rejected(String),

    /// The service could not be reached
    #[error("appointment service unavailable")]
    Unavailable,
}

impl AppointmentError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::DownstreamFailure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        assert_eq!(StockError::BatchNotFound.to_string(), "batch not found");
        assert_eq!(
            StockError::DuplicateBatch.to_string(),
            "batch number already exists in this facility"
        );
        assert_eq!(StockError::OutOfStock.to_string(), "no available stock for vaccine");
        assert_eq!(
            StockError::InsufficientQuantity {
                available: 6,
                requested: 10
            }
            .to_string(),
            "insufficient stock (available: 6, requested: 10)"
        );
        assert_eq!(StockError::BatchExpired(BatchId(3)).to_string(), "batch 3 has expired");
        assert_eq!(
            RecordingError::DuplicateDose.to_string(),
            "this dose has already been administered to the patient"
        );
        assert_eq!(
            RecordingError::InvalidDoseNumber {
                vaccine: "BCG".to_string(),
                dose: 2,
                max_doses: 1
            }
            .to_string(),
            "invalid dose number 2 (BCG has a maximum of 1 doses)"
        );
        assert_eq!(
            RecordingError::from(StockError::OutOfStock).to_string(),
            "failed to update inventory: no available stock for vaccine"
        );
    }

    #[test]
    fn errors_map_to_kinds() {
        assert_eq!(StockError::BatchNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(StockError::DuplicateBatch.kind(), ErrorKind::Conflict);
        assert_eq!(StockError::OutOfStock.kind(), ErrorKind::InsufficientStock);
        assert_eq!(
            StockError::InsufficientQuantity {
                available: 0,
                requested: 1
            }
            .kind(),
            ErrorKind::InsufficientStock
        );
        assert_eq!(StockError::VaccineMismatch.kind(), ErrorKind::InvalidInput);
        assert_eq!(RecordingError::PatientNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(RecordingError::DuplicateDose.kind(), ErrorKind::Conflict);
        assert_eq!(
            RecordingError::Inventory(StockError::OutOfStock).kind(),
            ErrorKind::InsufficientStock
        );
        assert_eq!(AppointmentError::Unavailable.kind(), ErrorKind::DownstreamFailure);
    }

    #[test]
    fn errors_are_cloneable() {
        let error = RecordingError::Inventory(StockError::VaccineMismatch);
        let cloned = error.clone();
        assert_eq!(error, cloned);
    }
}
