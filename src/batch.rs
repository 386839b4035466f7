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

//! Vaccine batches.
//!
//! A [`Batch`] splits into immutable receipt facts (number, vaccine, expiry,
//! quantity received) and the one mutable field, the remaining quantity,
//! which lives behind the batch's own mutex. Only the stock ledger takes that
//! lock for writing, and it appends the matching movement before releasing
//! it.
//!
//! # Example
//!
//! ```
//! use chrono::NaiveDate;
//! use vaccine_ledger::{Batch, BatchId, FacilityId, NewBatch, UserId};
//!
//! let batch = Batch::new(
//!     BatchId(1),
//!     NewBatch {
//!         facility_id: FacilityId::new("FAC-001"),
//!         batch_number: "B-001".to_string(),
//!         vaccine_name: "BCG".to_string(),
//!         manufacturer: "Serum Institute".to_string(),
//!         quantity: 10,
//!         expiry_date: NaiveDate::from_ymd_opt(2026, 6, 30).unwrap(),
//!         receipt_date: NaiveDate::from_ymd_opt(2025, 12, 1).unwrap(),
//!     },
//!     UserId(7),
//! );
//! assert_eq!(batch.remaining(), 10);
//! ```

use crate::base::{BatchId, FacilityId, UserId};
use crate::error::StockError;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

/// Days before expiry at which a batch is flagged as expiring soon.
pub const EXPIRY_WARNING_DAYS: i64 = 30;

/// Receipt facts for a batch about to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBatch {
    pub facility_id: FacilityId,
    pub batch_number: String,
    pub vaccine_name: String,
    pub manufacturer: String,
    pub quantity: u32,
    pub expiry_date: NaiveDate,
    pub receipt_date: NaiveDate,
}

/// Mutable part of a batch.
///
/// `remaining` is unsigned, so a deduction that would go below zero has to
/// fail before it is applied.
#[derive(Debug)]
pub(crate) struct StockState {
    pub remaining: u32,
}

impl StockState {
    /// Removes doses from the batch.
    pub fn withdraw(&mut self, quantity: u32) -> Result<u32, StockError> {
        if quantity == 0 {
            return Err(StockError::InvalidQuantity);
        }
        if self.remaining < quantity {
            return Err(StockError::InsufficientQuantity {
                available: self.remaining,
                requested: quantity,
            });
        }
        self.remaining -= quantity;
        Ok(self.remaining)
    }

    /// Adds doses back to the batch (positive corrections).
    pub fn restock(&mut self, quantity: u32) -> Result<u32, StockError> {
        if quantity == 0 {
            return Err(StockError::InvalidQuantity);
        }
        self.remaining = self
            .remaining
            .checked_add(quantity)
            .ok_or(StockError::InvalidQuantity)?;
        Ok(self.remaining)
    }
}

/// A received lot of one vaccine at one facility.
#[derive(Debug)]
pub struct Batch {
    id: BatchId,
    facility_id: FacilityId,
    batch_number: String,
    vaccine_name: String,
    manufacturer: String,
    quantity_received: u32,
    expiry_date: NaiveDate,
    receipt_date: NaiveDate,
    created_by: UserId,
    created_at: DateTime<Utc>,
    stock: Mutex<StockState>,
}

impl Batch {
    pub fn new(id: BatchId, new: NewBatch, created_by: UserId) -> Self {
        Self {
            id,
            facility_id: new.facility_id,
            batch_number: new.batch_number,
            vaccine_name: new.vaccine_name,
            manufacturer: new.manufacturer,
            quantity_received: new.quantity,
            expiry_date: new.expiry_date,
            receipt_date: new.receipt_date,
            created_by,
            created_at: Utc::now(),
            stock: Mutex::new(StockState {
                remaining: new.quantity,
            }),
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn facility_id(&self) -> &FacilityId {
        &self.facility_id
    }

    pub fn batch_number(&self) -> &str {
        &self.batch_number
    }

    pub fn vaccine_name(&self) -> &str {
        &self.vaccine_name
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn quantity_received(&self) -> u32 {
        self.quantity_received
    }

    pub fn expiry_date(&self) -> NaiveDate {
        self.expiry_date
    }

    pub fn remaining(&self) -> u32 {
        self.stock.lock().remaining
    }

    /// True once the expiry date is today or in the past.
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiry_date <= today
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StockState> {
        self.stock.lock()
    }

    /// Point-in-time copy of the batch.
    pub fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            id: self.id,
            facility_id: self.facility_id.clone(),
            batch_number: self.batch_number.clone(),
            vaccine_name: self.vaccine_name.clone(),
            manufacturer: self.manufacturer.clone(),
            quantity_received: self.quantity_received,
            quantity_remaining: self.remaining(),
            expiry_date: self.expiry_date,
            receipt_date: self.receipt_date,
            created_by: self.created_by,
            created_at: self.created_at,
        }
    }
}

/// Plain-data copy of a batch, safe to sort and ship across threads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub id: BatchId,
    pub facility_id: FacilityId,
    pub batch_number: String,
    pub vaccine_name: String,
    pub manufacturer: String,
    pub quantity_received: u32,
    pub quantity_remaining: u32,
    pub expiry_date: NaiveDate,
    pub receipt_date: NaiveDate,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl BatchSnapshot {
    /// A batch can be drawn from iff it holds stock and has not expired.
    pub fn is_available(&self, today: NaiveDate) -> bool {
        self.quantity_remaining > 0 && self.expiry_date > today
    }

    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiry_date <= today
    }

    pub fn days_until_expiry(&self, today: NaiveDate) -> i64 {
        (self.expiry_date - today).num_days()
    }

    pub fn view(self, today: NaiveDate) -> BatchView {
        let days_until_expiry = self.days_until_expiry(today);
        let is_expired = self.is_expired(today);
        BatchView {
            is_expired,
            is_expiring_soon: !is_expired && days_until_expiry < EXPIRY_WARNING_DAYS,
            days_until_expiry,
            batch: self,
        }
    }
}

/// Batch as presented to callers, with expiry flags computed for a date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchView {
    #[serde(flatten)]
    pub batch: BatchSnapshot,
    pub is_expired: bool,
    pub is_expiring_soon: bool,
    pub days_until_expiry: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn make_batch(quantity: u32, expiry: NaiveDate) -> Batch {
        Batch::new(
            BatchId(1),
            NewBatch {
                facility_id: FacilityId::new("FAC-1"),
                batch_number: "B-001".to_string(),
                vaccine_name: "BCG".to_string(),
                manufacturer: "Acme".to_string(),
                quantity,
                expiry_date: expiry,
                receipt_date: date(2025, 1, 1),
            },
            UserId(1),
        )
    }

    #[test]
    fn withdraw_reduces_remaining() {
        let batch = make_batch(10, date(2025, 12, 31));
        let remaining = batch.lock().withdraw(3).unwrap();
        assert_eq!(remaining, 7);
        assert_eq!(batch.remaining(), 7);
        assert_eq!(batch.quantity_received(), 10);
    }

    #[test]
    fn withdraw_more_than_remaining_fails() {
        let batch = make_batch(2, date(2025, 12, 31));
        let result = batch.lock().withdraw(3);
        assert_eq!(
            result,
            Err(StockError::InsufficientQuantity {
                available: 2,
                requested: 3
            })
        );
        assert_eq!(batch.remaining(), 2);
    }

    #[test]
    fn zero_quantities_are_rejected() {
        let batch = make_batch(2, date(2025, 12, 31));
        assert_eq!(batch.lock().withdraw(0), Err(StockError::InvalidQuantity));
        assert_eq!(batch.lock().restock(0), Err(StockError::InvalidQuantity));
    }

    #[test]
    fn restock_increases_remaining() {
        let batch = make_batch(5, date(2025, 12, 31));
        batch.lock().withdraw(5).unwrap();
        assert_eq!(batch.lock().restock(2).unwrap(), 2);
    }

    #[test]
    fn availability_requires_stock_and_future_expiry() {
        let today = date(2025, 6, 1);
        let mut snapshot = make_batch(1, date(2025, 6, 2)).snapshot();
        assert!(snapshot.is_available(today));

        snapshot.expiry_date = today;
        assert!(!snapshot.is_available(today));
        assert!(snapshot.is_expired(today));

        snapshot.expiry_date = date(2025, 7, 1);
        snapshot.quantity_remaining = 0;
        assert!(!snapshot.is_available(today));
    }

    #[test]
    fn view_flags_expiring_soon() {
        let today = date(2025, 6, 1);
        let view = make_batch(5, date(2025, 6, 20)).snapshot().view(today);
        assert!(!view.is_expired);
        assert!(view.is_expiring_soon);
        assert_eq!(view.days_until_expiry, 19);

        let view = make_batch(5, date(2025, 12, 1)).snapshot().view(today);
        assert!(!view.is_expiring_soon);

        let view = make_batch(5, date(2025, 5, 1)).snapshot().view(today);
        assert!(view.is_expired);
        assert!(!view.is_expiring_soon);
        assert_eq!(view.days_until_expiry, -31);
    }

    #[test]
    fn view_serializes_flat() {
        let view = make_batch(5, date(2025, 12, 1))
            .snapshot()
            .view(date(2025, 6, 1));
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["batch_number"], "B-001");
        assert_eq!(json["quantity_remaining"], 5);
        assert_eq!(json["expiry_date"], "2025-12-01");
        assert_eq!(json["is_expired"], false);
    }
}
