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

//! Vaccine stock ledger.
//!
//! The [`StockLedger`] is the only component that changes a batch's remaining
//! quantity or writes to the movement log. It handles stock receipt,
//! allocation (first-expiry-first-out or from a pinned batch), administrative
//! adjustments and the write-off of expired stock.
//!
//! # Operations
//!
//! - **Receive**: Registers a new batch and logs a `RECEIVED` movement.
//! - **Allocate**: Deducts doses for use and logs a `USED` movement.
//! - **Adjust**: Applies a signed correction and logs a movement typed by the reason.
//! - **Write off**: Drains expired batches and logs `EXPIRED` movements.
//!
//! # Thread Safety
//!
//! Batches live in a [`DashMap`], each with its own mutex around the remaining
//! quantity. A deduction reads, checks and writes the quantity and appends
//! its movement while holding that mutex, so concurrent allocations against
//! the same batch serialize and can never both spend the last dose.
//! Allocations against different batches run in parallel.
//!
//! Lock order is batch number index, then batch mutex, then movement log.

use crate::allocator;
use crate::base::{BatchId, FacilityId, UserId, same_vaccine};
use crate::batch::{Batch, BatchSnapshot, BatchView, NewBatch};
use crate::clock::{Clock, SystemClock};
use crate::error::StockError;
use crate::movement::{Direction, Movement, MovementFilter, MovementLog, MovementType, NewMovement};
use chrono::NaiveDate;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

const USED_FOR_VACCINATION: &str = "Stock used for vaccination";
const EXPIRED_WRITE_OFF: &str = "Expired stock written off";

/// Why stock is being adjusted outside of normal use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustmentReason {
    Damaged,
    Expired,
    Lost,
    Correction,
}

impl AdjustmentReason {
    /// Movement type logged for this reason.
    pub fn movement_type(self) -> MovementType {
        match self {
            Self::Damaged => MovementType::Damaged,
            Self::Expired => MovementType::Expired,
            Self::Lost => MovementType::Used,
            Self::Correction => MovementType::Adjusted,
        }
    }

    /// Only corrections may add stock.
    fn allows_increase(self) -> bool {
        matches!(self, Self::Correction)
    }
}

impl fmt::Display for AdjustmentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Damaged => "DAMAGED",
            Self::Expired => "EXPIRED",
            Self::Lost => "LOST",
            Self::Correction => "CORRECTION",
        };
        f.write_str(name)
    }
}

impl FromStr for AdjustmentReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DAMAGED" => Ok(Self::Damaged),
            "EXPIRED" => Ok(Self::Expired),
            "LOST" => Ok(Self::Lost),
            "CORRECTION" => Ok(Self::Correction),
            other => Err(format!("unknown adjustment reason: {other}")),
        }
    }
}

/// An administrative change to one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustStock {
    pub facility_id: FacilityId,
    pub batch_number: String,
    /// Vaccine the caller expects the batch to hold.
    pub vaccine_name: String,
    /// Signed change to the remaining quantity.
    pub delta: i32,
    pub reason: AdjustmentReason,
    pub notes: Option<String>,
}

/// Outcome of a first-expiry-first-out allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub batch_id: BatchId,
    pub remaining: u32,
}

/// Stock ledger for any number of independent facilities.
///
/// # Invariants
///
/// - A batch's remaining quantity equals the signed sum of its movements.
/// - Remaining quantity never goes below zero.
/// - Only batches with stock and an expiry date after today are allocated.
/// - `(batch number, facility)` identifies at most one batch.
/// - Every successful mutation appends exactly one movement.
pub struct StockLedger {
    /// Batches indexed by surrogate id.
    batches: DashMap<BatchId, Arc<Batch>>,
    /// Business key index, also the uniqueness guard for receipts.
    batch_numbers: DashMap<(FacilityId, String), BatchId>,
    movements: MovementLog,
    next_batch_id: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl StockLedger {
    /// Creates an empty ledger using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty ledger reading "today" from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            batches: DashMap::new(),
            batch_numbers: DashMap::new(),
            movements: MovementLog::new(),
            next_batch_id: AtomicU64::new(1),
            clock,
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Registers a newly received batch.
    ///
    /// The batch starts with its full quantity remaining and a `RECEIVED`
    /// movement of the same quantity.
    ///
    /// # Errors
    ///
    /// - [`StockError::InvalidQuantity`] - Quantity is zero.
    /// - [`StockError::DuplicateBatch`] - The batch number is already registered at the facility.
    pub fn receive(&self, mut new: NewBatch, actor: UserId) -> Result<BatchId, StockError> {
        if new.quantity == 0 {
            return Err(StockError::InvalidQuantity);
        }
        if new.manufacturer.trim().is_empty() {
            new.manufacturer = "Unknown".to_string();
        }

        // Entry API gives an atomic check-and-insert on the business key.
        let key = (new.facility_id.clone(), new.batch_number.clone());
        match self.batch_numbers.entry(key) {
            Entry::Occupied(_) => Err(StockError::DuplicateBatch),
            Entry::Vacant(entry) => {
                let id = BatchId(self.next_batch_id.fetch_add(1, Ordering::SeqCst));
                let batch = Arc::new(Batch::new(id, new, actor));

                self.movements.append(NewMovement {
                    facility_id: batch.facility_id().clone(),
                    vaccine_name: batch.vaccine_name().to_string(),
                    batch_number: batch.batch_number().to_string(),
                    movement_type: MovementType::Received,
                    direction: Direction::Inbound,
                    quantity: batch.quantity_received(),
                    reason: format!("Stock received from: {}", batch.manufacturer()),
                    created_by: actor,
                });
                self.batches.insert(id, Arc::clone(&batch));
                entry.insert(id);

                info!(
                    batch_id = %id,
                    facility = %batch.facility_id(),
                    batch_number = batch.batch_number(),
                    vaccine = batch.vaccine_name(),
                    quantity = batch.quantity_received(),
                    "stock received"
                );
                Ok(id)
            }
        }
    }

    /// Like [`receive`](Self::receive), returning the new batch's view.
    pub fn receive_stock(&self, new: NewBatch, actor: UserId) -> Result<BatchView, StockError> {
        let id = self.receive(new, actor)?;
        self.batch_view(id)
    }

    /// Deducts doses from the earliest-expiring available batch.
    ///
    /// The candidate is chosen from a snapshot and checked again under the
    /// batch lock. If it ran dry or expired in between, selection starts
    /// over with a fresh snapshot.
    ///
    /// # Errors
    ///
    /// - [`StockError::InvalidQuantity`] - Quantity is zero.
    /// - [`StockError::OutOfStock`] - No available batch for the facility and vaccine.
    /// - [`StockError::InsufficientQuantity`] - The selected batch holds too few doses.
    pub fn allocate_by_vaccine(
        &self,
        facility_id: &FacilityId,
        vaccine_name: &str,
        quantity: u32,
        actor: UserId,
    ) -> Result<Allocation, StockError> {
        loop {
            let candidates = self.facility_snapshots(facility_id);
            let selected =
                allocator::select(&candidates, facility_id, vaccine_name, quantity, self.today())?;
            debug!(
                batch_id = %selected.id,
                expiry = %selected.expiry_date,
                "selected batch for allocation"
            );

            let batch = self.get(selected.id)?;
            let mut stock = batch.lock();
            if stock.remaining == 0 || batch.is_expired(self.today()) {
                debug!(batch_id = %selected.id, "selected batch no longer available, retrying");
                continue;
            }

            let remaining = stock.withdraw(quantity)?;
            self.append(&batch, MovementType::Used, Direction::Outbound, quantity, USED_FOR_VACCINATION, actor);
            drop(stock);

            self.log_deduction(&batch, quantity, remaining);
            return Ok(Allocation {
                batch_id: batch.id(),
                remaining,
            });
        }
    }

    /// Deducts doses from a caller-chosen batch, bypassing FIFO selection.
    ///
    /// # Errors
    ///
    /// - [`StockError::InvalidQuantity`] - Quantity is zero.
    /// - [`StockError::BatchNotFound`] - Unknown batch id.
    /// - [`StockError::BatchExpired`] - The batch is past its expiry date.
    /// - [`StockError::InsufficientQuantity`] - The batch holds too few doses.
    pub fn allocate_from_batch(
        &self,
        batch_id: BatchId,
        quantity: u32,
        actor: UserId,
    ) -> Result<u32, StockError> {
        let batch = self.get(batch_id)?;
        let mut stock = batch.lock();
        if batch.is_expired(self.today()) {
            return Err(StockError::BatchExpired(batch_id));
        }

        let remaining = stock.withdraw(quantity)?;
        self.append(&batch, MovementType::Used, Direction::Outbound, quantity, USED_FOR_VACCINATION, actor);
        drop(stock);

        self.log_deduction(&batch, quantity, remaining);
        Ok(remaining)
    }

    /// Applies an administrative correction to a batch.
    ///
    /// | Reason | Movement type | Delta |
    /// |--------|---------------|-------|
    /// | `DAMAGED` | `DAMAGED` | negative only |
    /// | `EXPIRED` | `EXPIRED` | negative only |
    /// | `LOST` | `USED` | negative only |
    /// | `CORRECTION` | `ADJUSTED` | either sign |
    ///
    /// # Errors
    ///
    /// - [`StockError::InvalidQuantity`] - Delta is zero.
    /// - [`StockError::InvalidAdjustment`] - Positive delta for a reason that only removes stock.
    /// - [`StockError::BatchNotFound`] - No such batch number at the facility.
    /// - [`StockError::VaccineMismatch`] - The batch holds a different vaccine.
    /// - [`StockError::InsufficientQuantity`] - The delta would drive the batch negative.
    pub fn adjust(&self, adjustment: AdjustStock, actor: UserId) -> Result<u32, StockError> {
        if adjustment.delta == 0 {
            return Err(StockError::InvalidQuantity);
        }
        if adjustment.delta > 0 && !adjustment.reason.allows_increase() {
            return Err(StockError::InvalidAdjustment);
        }

        let batch = self.find_by_number(&adjustment.facility_id, &adjustment.batch_number)?;
        if !same_vaccine(batch.vaccine_name(), &adjustment.vaccine_name) {
            return Err(StockError::VaccineMismatch);
        }

        let magnitude = adjustment.delta.unsigned_abs();
        let (direction, remaining) = {
            let mut stock = batch.lock();
            let (direction, remaining) = if adjustment.delta < 0 {
                (Direction::Outbound, stock.withdraw(magnitude)?)
            } else {
                (Direction::Inbound, stock.restock(magnitude)?)
            };

            let reason = match adjustment.notes.as_deref().map(str::trim) {
                Some(notes) if !notes.is_empty() => format!("{}: {}", adjustment.reason, notes),
                _ => adjustment.reason.to_string(),
            };
            self.append(&batch, adjustment.reason.movement_type(), direction, magnitude, &reason, actor);
            (direction, remaining)
        };

        info!(
            batch_id = %batch.id(),
            batch_number = batch.batch_number(),
            reason = %adjustment.reason,
            ?direction,
            quantity = magnitude,
            remaining,
            "stock adjusted"
        );
        if remaining == 0 {
            info!(batch_number = batch.batch_number(), "batch is now depleted");
        }
        Ok(remaining)
    }

    /// Like [`adjust`](Self::adjust), returning the batch's view.
    pub fn adjust_stock(&self, adjustment: AdjustStock, actor: UserId) -> Result<BatchView, StockError> {
        let facility_id = adjustment.facility_id.clone();
        let batch_number = adjustment.batch_number.clone();
        self.adjust(adjustment, actor)?;
        let batch = self.find_by_number(&facility_id, &batch_number)?;
        Ok(batch.snapshot().view(self.today()))
    }

    /// Drains every expired batch of the facility that still holds stock.
    ///
    /// Returns the batches written off with the quantity removed from each.
    pub fn write_off_expired(&self, facility_id: &FacilityId, actor: UserId) -> Vec<(BatchId, u32)> {
        let today = self.today();
        let mut written_off = Vec::new();

        for batch in self.facility_batches(facility_id) {
            let mut stock = batch.lock();
            if !batch.is_expired(today) || stock.remaining == 0 {
                continue;
            }
            let quantity = stock.remaining;
            if stock.withdraw(quantity).is_err() {
                continue;
            }
            self.append(&batch, MovementType::Expired, Direction::Outbound, quantity, EXPIRED_WRITE_OFF, actor);
            drop(stock);

            warn!(
                batch_id = %batch.id(),
                batch_number = batch.batch_number(),
                quantity,
                "expired stock written off"
            );
            written_off.push((batch.id(), quantity));
        }

        written_off.sort_by_key(|(id, _)| *id);
        written_off
    }

    /// Replays the movement log for a batch and compares it with the batch.
    ///
    /// # Errors
    ///
    /// - [`StockError::BatchNotFound`] - Unknown batch id.
    /// - [`StockError::LedgerMismatch`] - The replayed quantity differs from the recorded one.
    pub fn verify_batch(&self, batch_id: BatchId) -> Result<(), StockError> {
        let batch = self.get(batch_id)?;
        let stock = batch.lock();
        let replayed = self
            .movements
            .net_quantity(batch.facility_id(), batch.batch_number());

        if replayed != i64::from(stock.remaining) {
            error!(
                batch_id = %batch_id,
                recorded = stock.remaining,
                replayed,
                "movement log does not match batch quantity"
            );
            return Err(StockError::LedgerMismatch {
                batch: batch_id,
                recorded: stock.remaining,
                replayed,
            });
        }
        Ok(())
    }

    /// Returns a snapshot of one batch.
    pub fn batch(&self, batch_id: BatchId) -> Option<BatchSnapshot> {
        self.batches.get(&batch_id).map(|b| b.snapshot())
    }

    pub fn batch_view(&self, batch_id: BatchId) -> Result<BatchView, StockError> {
        self.batch(batch_id)
            .map(|b| b.view(self.today()))
            .ok_or(StockError::BatchNotFound)
    }

    /// Looks up a batch by its business key.
    pub fn batch_by_number(&self, facility_id: &FacilityId, batch_number: &str) -> Option<BatchSnapshot> {
        self.find_by_number(facility_id, batch_number)
            .ok()
            .map(|b| b.snapshot())
    }

    /// All batches of a facility, in receipt order.
    pub fn batches(&self, facility_id: &FacilityId) -> Vec<BatchView> {
        let today = self.today();
        self.facility_snapshots(facility_id)
            .into_iter()
            .map(|b| b.view(today))
            .collect()
    }

    /// Batches that can be allocated, in the order allocation would use them.
    pub fn available_batches(&self, facility_id: &FacilityId, vaccine_name: &str) -> Vec<BatchView> {
        let today = self.today();
        let snapshots = self.facility_snapshots(facility_id);
        allocator::available_in_order(&snapshots, facility_id, vaccine_name, today)
            .into_iter()
            .map(|b| b.view(today))
            .collect()
    }

    pub fn movements(&self, filter: &MovementFilter) -> Vec<Movement> {
        self.movements.query(filter)
    }

    pub fn movement_count(&self) -> usize {
        self.movements.len()
    }

    /// Snapshots of every batch at a facility, ordered by id.
    pub fn facility_snapshots(&self, facility_id: &FacilityId) -> Vec<BatchSnapshot> {
        self.facility_batches(facility_id)
            .iter()
            .map(|b| b.snapshot())
            .collect()
    }

    /// Batch ids across all facilities, ordered.
    pub fn batch_ids(&self) -> Vec<BatchId> {
        let mut ids: Vec<BatchId> = self.batches.iter().map(|b| *b.key()).collect();
        ids.sort();
        ids
    }

    fn facility_batches(&self, facility_id: &FacilityId) -> Vec<Arc<Batch>> {
        let mut batches: Vec<Arc<Batch>> = self
            .batches
            .iter()
            .filter(|b| b.facility_id() == facility_id)
            .map(|b| Arc::clone(b.value()))
            .collect();
        batches.sort_by_key(|b| b.id());
        batches
    }

    fn get(&self, batch_id: BatchId) -> Result<Arc<Batch>, StockError> {
        // Clone the Arc so the map guard is released before the batch lock is taken.
        self.batches
            .get(&batch_id)
            .map(|b| Arc::clone(b.value()))
            .ok_or(StockError::BatchNotFound)
    }

    fn find_by_number(&self, facility_id: &FacilityId, batch_number: &str) -> Result<Arc<Batch>, StockError> {
        let id = self
            .batch_numbers
            .get(&(facility_id.clone(), batch_number.to_string()))
            .map(|id| *id)
            .ok_or(StockError::BatchNotFound)?;
        self.get(id)
    }

    /// Appends a movement for `batch`. Callers hold the batch lock.
    fn append(
        &self,
        batch: &Batch,
        movement_type: MovementType,
        direction: Direction,
        quantity: u32,
        reason: &str,
        actor: UserId,
    ) {
        self.movements.append(NewMovement {
            facility_id: batch.facility_id().clone(),
            vaccine_name: batch.vaccine_name().to_string(),
            batch_number: batch.batch_number().to_string(),
            movement_type,
            direction,
            quantity,
            reason: reason.to_string(),
            created_by: actor,
        });
    }

    fn log_deduction(&self, batch: &Batch, quantity: u32, remaining: u32) {
        info!(
            batch_id = %batch.id(),
            batch_number = batch.batch_number(),
            quantity,
            remaining,
            "stock deducted"
        );
        if remaining == 0 {
            info!(batch_number = batch.batch_number(), "batch is now depleted");
        }
    }
}

impl Default for StockLedger {
    fn default() -> Self {
        Self::new()
    }
}
