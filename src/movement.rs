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

//! Append-only stock movement log.
//!
//! Every change to a batch's remaining quantity leaves exactly one
//! [`Movement`] behind. Movements reference their batch by
//! `(facility, batch number)` rather than by surrogate id, so the audit
//! trail stays readable even if batch records are purged administratively.

use crate::base::{FacilityId, MovementId, UserId, same_vaccine};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    Received,
    Used,
    Adjusted,
    Damaged,
    Expired,
}

impl fmt::Display for MovementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "RECEIVED",
            Self::Used => "USED",
            Self::Adjusted => "ADJUSTED",
            Self::Damaged => "DAMAGED",
            Self::Expired => "EXPIRED",
        };
        f.write_str(name)
    }
}

/// Whether a movement added stock to the batch or removed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// An immutable audit entry.
///
/// `quantity` is always a positive magnitude; `direction` carries the sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    pub id: MovementId,
    pub facility_id: FacilityId,
    pub vaccine_name: String,
    pub batch_number: String,
    pub movement_type: MovementType,
    pub direction: Direction,
    pub quantity: u32,
    pub reason: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl Movement {
    /// Quantity with its sign applied.
    pub fn signed_quantity(&self) -> i64 {
        match self.direction {
            Direction::Inbound => i64::from(self.quantity),
            Direction::Outbound => -i64::from(self.quantity),
        }
    }
}

/// A movement that has not been assigned an id yet.
#[derive(Debug, Clone)]
pub(crate) struct NewMovement {
    pub facility_id: FacilityId,
    pub vaccine_name: String,
    pub batch_number: String,
    pub movement_type: MovementType,
    pub direction: Direction,
    pub quantity: u32,
    pub reason: String,
    pub created_by: UserId,
}

/// Selects movements by facility, vaccine and batch number.
///
/// Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct MovementFilter {
    pub facility_id: Option<FacilityId>,
    pub vaccine_name: Option<String>,
    pub batch_number: Option<String>,
}

impl MovementFilter {
    pub fn facility(facility_id: FacilityId) -> Self {
        Self {
            facility_id: Some(facility_id),
            ..Self::default()
        }
    }

    pub fn batch(facility_id: FacilityId, batch_number: impl Into<String>) -> Self {
        Self {
            facility_id: Some(facility_id),
            batch_number: Some(batch_number.into()),
            ..Self::default()
        }
    }

    pub fn with_vaccine(mut self, vaccine_name: impl Into<String>) -> Self {
        self.vaccine_name = Some(vaccine_name.into());
        self
    }

    fn matches(&self, movement: &Movement) -> bool {
        self.facility_id
            .as_ref()
            .is_none_or(|f| *f == movement.facility_id)
            && self
                .vaccine_name
                .as_deref()
                .is_none_or(|v| same_vaccine(v, &movement.vaccine_name))
            && self
                .batch_number
                .as_deref()
                .is_none_or(|b| b == movement.batch_number)
    }
}

/// Thread-safe append-only log preserving insertion order.
///
/// Ids are assigned under the write lock, so they are dense and increase in
/// the same order as the entries.
#[derive(Debug, Default)]
pub struct MovementLog {
    entries: RwLock<Vec<Movement>>,
}

impl MovementLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, movement: NewMovement) -> MovementId {
        let mut entries = self.entries.write();
        let id = MovementId(entries.len() as u64 + 1);
        entries.push(Movement {
            id,
            facility_id: movement.facility_id,
            vaccine_name: movement.vaccine_name,
            batch_number: movement.batch_number,
            movement_type: movement.movement_type,
            direction: movement.direction,
            quantity: movement.quantity,
            reason: movement.reason,
            created_by: movement.created_by,
            created_at: Utc::now(),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns matching movements in insertion order.
    pub fn query(&self, filter: &MovementFilter) -> Vec<Movement> {
        self.entries
            .read()
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect()
    }

    /// Sum of signed quantities for one batch.
    pub fn net_quantity(&self, facility_id: &FacilityId, batch_number: &str) -> i64 {
        self.entries
            .read()
            .iter()
            .filter(|m| m.facility_id == *facility_id && m.batch_number == batch_number)
            .map(Movement::signed_quantity)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_movement(batch: &str, movement_type: MovementType, direction: Direction, quantity: u32) -> NewMovement {
        NewMovement {
            facility_id: FacilityId::new("FAC-1"),
            vaccine_name: "BCG".to_string(),
            batch_number: batch.to_string(),
            movement_type,
            direction,
            quantity,
            reason: "test".to_string(),
            created_by: UserId(1),
        }
    }

    #[test]
    fn append_assigns_sequential_ids() {
        let log = MovementLog::new();
        let first = log.append(new_movement("B-1", MovementType::Received, Direction::Inbound, 10));
        let second = log.append(new_movement("B-1", MovementType::Used, Direction::Outbound, 1));
        assert_eq!(first, MovementId(1));
        assert_eq!(second, MovementId(2));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn net_quantity_applies_direction() {
        let log = MovementLog::new();
        log.append(new_movement("B-1", MovementType::Received, Direction::Inbound, 10));
        log.append(new_movement("B-1", MovementType::Damaged, Direction::Outbound, 3));
        log.append(new_movement("B-1", MovementType::Adjusted, Direction::Inbound, 2));
        log.append(new_movement("B-2", MovementType::Received, Direction::Inbound, 50));

        assert_eq!(log.net_quantity(&FacilityId::new("FAC-1"), "B-1"), 9);
        assert_eq!(log.net_quantity(&FacilityId::new("FAC-1"), "B-2"), 50);
        assert_eq!(log.net_quantity(&FacilityId::new("FAC-2"), "B-1"), 0);
    }

    #[test]
    fn query_filters_by_batch_and_vaccine() {
        let log = MovementLog::new();
        log.append(new_movement("B-1", MovementType::Received, Direction::Inbound, 10));
        log.append(new_movement("B-2", MovementType::Received, Direction::Inbound, 10));

        let filter = MovementFilter::batch(FacilityId::new("FAC-1"), "B-2");
        let found = log.query(&filter);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].batch_number, "B-2");

        let filter = MovementFilter::facility(FacilityId::new("FAC-1")).with_vaccine("bcg");
        assert_eq!(log.query(&filter).len(), 2);

        let filter = MovementFilter::facility(FacilityId::new("FAC-1")).with_vaccine("OPV");
        assert!(log.query(&filter).is_empty());
    }

    #[test]
    fn movement_type_serializes_screaming_case() {
        let json = serde_json::to_string(&MovementType::Received).unwrap();
        assert_eq!(json, "\"RECEIVED\"");
        assert_eq!(MovementType::Damaged.to_string(), "DAMAGED");
    }
}
