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

//! Read-only stock summaries for a facility.

use crate::base::{FacilityId, same_vaccine, vaccine_key};
use crate::batch::BatchView;
use crate::ledger::StockLedger;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Above this many doses a vaccine is well stocked.
const GOOD_ABOVE: u64 = 50;
/// Below this many doses a vaccine is critically low.
const CRITICAL_BELOW: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockStatus {
    Good,
    Low,
    Critical,
}

impl StockStatus {
    pub fn classify(quantity: u64) -> Self {
        if quantity > GOOD_ABOVE {
            Self::Good
        } else if quantity >= CRITICAL_BELOW {
            Self::Low
        } else {
            Self::Critical
        }
    }
}

impl fmt::Display for StockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Good => "GOOD",
            Self::Low => "LOW",
            Self::Critical => "CRITICAL",
        })
    }
}

/// Usable stock of one vaccine at a facility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    /// Lowercase vaccine name with spaces replaced by dashes.
    pub vaccine_id: String,
    pub vaccine_name: String,
    pub current_quantity: u64,
    pub oldest_expiry: NaiveDate,
    pub status: StockStatus,
}

impl StockLedger {
    /// Stock per vaccine over available batches, sorted by vaccine name.
    ///
    /// Vaccine names are grouped case-insensitively; the level carries the
    /// spelling of the first batch received.
    pub fn stock_levels(&self, facility_id: &FacilityId) -> Vec<StockLevel> {
        let today = self.today();
        let mut groups: BTreeMap<String, StockLevel> = BTreeMap::new();

        for batch in self.facility_snapshots(facility_id) {
            if !batch.is_available(today) {
                continue;
            }
            let level = groups
                .entry(vaccine_key(&batch.vaccine_name))
                .or_insert_with(|| StockLevel {
                    vaccine_id: batch.vaccine_name.to_lowercase().replace(' ', "-"),
                    vaccine_name: batch.vaccine_name.clone(),
                    current_quantity: 0,
                    oldest_expiry: batch.expiry_date,
                    status: StockStatus::Critical,
                });
            level.current_quantity += u64::from(batch.quantity_remaining);
            level.oldest_expiry = level.oldest_expiry.min(batch.expiry_date);
        }

        groups
            .into_values()
            .map(|mut level| {
                level.status = StockStatus::classify(level.current_quantity);
                level
            })
            .collect()
    }

    /// Batches with stock that expire within the warning window, soonest first.
    pub fn expiring_soon(&self, facility_id: &FacilityId) -> Vec<BatchView> {
        let mut found = self.views_where(facility_id, |view| {
            view.batch.quantity_remaining > 0 && view.is_expiring_soon
        });
        found.sort_by_key(|v| (v.batch.expiry_date, v.batch.id));
        found
    }

    /// Expired batches that still hold stock.
    pub fn expired_with_stock(&self, facility_id: &FacilityId) -> Vec<BatchView> {
        self.views_where(facility_id, |view| {
            view.is_expired && view.batch.quantity_remaining > 0
        })
    }

    /// Doses of a vaccine that could be allocated today.
    pub fn total_available(&self, facility_id: &FacilityId, vaccine_name: &str) -> u64 {
        let today = self.today();
        self.facility_snapshots(facility_id)
            .iter()
            .filter(|b| same_vaccine(&b.vaccine_name, vaccine_name) && b.is_available(today))
            .map(|b| u64::from(b.quantity_remaining))
            .sum()
    }

    fn views_where(&self, facility_id: &FacilityId, keep: impl Fn(&BatchView) -> bool) -> Vec<BatchView> {
        self.batches(facility_id).into_iter().filter(|v| keep(v)).collect()
    }
}
