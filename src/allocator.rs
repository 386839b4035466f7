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

//! First-expiry-first-out batch selection.
//!
//! Selection is a pure function over batch snapshots. The ledger calls it
//! without holding any batch lock and re-checks the chosen batch under its
//! lock before deducting, since the snapshot may be stale by then.

use crate::base::{FacilityId, same_vaccine};
use crate::batch::BatchSnapshot;
use crate::error::StockError;
use chrono::NaiveDate;

/// Available batches of one vaccine at one facility, earliest expiry first.
///
/// Batches sharing an expiry date are ordered by id, so the result is
/// deterministic for a given snapshot.
pub fn available_in_order<'a, I>(
    batches: I,
    facility_id: &FacilityId,
    vaccine_name: &str,
    today: NaiveDate,
) -> Vec<BatchSnapshot>
where
    I: IntoIterator<Item = &'a BatchSnapshot>,
{
    let mut available: Vec<BatchSnapshot> = batches
        .into_iter()
        .filter(|b| {
            b.facility_id == *facility_id
                && same_vaccine(&b.vaccine_name, vaccine_name)
                && b.is_available(today)
        })
        .cloned()
        .collect();
    available.sort_by_key(|b| (b.expiry_date, b.id));
    available
}

/// Picks the batch to draw `quantity` doses from.
///
/// # Errors
///
/// - [`StockError::InvalidQuantity`] - `quantity` is zero.
/// - [`StockError::OutOfStock`] - no batch is available for the facility and vaccine.
/// - [`StockError::InsufficientQuantity`] - the earliest-expiring batch holds fewer
///   than `quantity` doses. Requests are never split across batches.
pub fn select<'a, I>(
    batches: I,
    facility_id: &FacilityId,
    vaccine_name: &str,
    quantity: u32,
    today: NaiveDate,
) -> Result<BatchSnapshot, StockError>
where
    I: IntoIterator<Item = &'a BatchSnapshot>,
{
    if quantity == 0 {
        return Err(StockError::InvalidQuantity);
    }

    let selected = available_in_order(batches, facility_id, vaccine_name, today)
        .into_iter()
        .next()
        .ok_or(StockError::OutOfStock)?;

    if selected.quantity_remaining < quantity {
        return Err(StockError::InsufficientQuantity {
            available: selected.quantity_remaining,
            requested: quantity,
        });
    }

    Ok(selected)
}
