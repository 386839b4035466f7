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

//! Dosing schedule reference data.
//!
//! Maps a vaccine to how many doses it takes and how many days apart they
//! are given. Vaccines missing from the table fall back to a single dose
//! with a four week interval.

use crate::base::vaccine_key;
use csv::{ReaderBuilder, Trim};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoseRule {
    pub max_doses: u32,
    /// Days between consecutive doses. Zero means no follow-up is scheduled.
    pub interval_days: u32,
}

impl DoseRule {
    pub const fn new(max_doses: u32, interval_days: u32) -> Self {
        Self {
            max_doses,
            interval_days,
        }
    }
}

const FALLBACK: DoseRule = DoseRule::new(1, 28);

const DEFAULT_RULES: &[(&str, DoseRule)] = &[
    ("BCG", DoseRule::new(1, 0)),
    ("OPV", DoseRule::new(4, 28)),
    ("DTP", DoseRule::new(3, 28)),
    ("PENTA", DoseRule::new(3, 28)),
    ("MEASLES", DoseRule::new(2, 180)),
    ("HEPATITIS B", DoseRule::new(3, 28)),
    ("ROTAVIRUS", DoseRule::new(2, 28)),
    ("PNEUMOCOCCAL", DoseRule::new(3, 28)),
    ("COVID-19", DoseRule::new(3, 28)),
    ("TETANUS", DoseRule::new(5, 28)),
    ("YELLOW FEVER", DoseRule::new(1, 0)),
    ("MENINGITIS", DoseRule::new(1, 28)),
];

#[derive(Debug, Clone)]
pub struct DosingSchedule {
    rules: HashMap<String, DoseRule>,
}

/// Row of a schedule override file: `vaccine,max_doses,interval_days`.
#[derive(Debug, Deserialize)]
struct ScheduleRecord {
    vaccine: String,
    max_doses: u32,
    interval_days: u32,
}

impl DosingSchedule {
    /// An empty schedule; every vaccine gets the fallback rule.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Adds or replaces the rule for a vaccine.
    pub fn with_rule(mut self, vaccine_name: &str, rule: DoseRule) -> Self {
        self.set_rule(vaccine_name, rule);
        self
    }

    pub fn set_rule(&mut self, vaccine_name: &str, rule: DoseRule) {
        self.rules.insert(vaccine_key(vaccine_name), rule);
    }

    pub fn rule(&self, vaccine_name: &str) -> DoseRule {
        self.rules
            .get(&vaccine_key(vaccine_name))
            .copied()
            .unwrap_or(FALLBACK)
    }

    pub fn max_doses(&self, vaccine_name: &str) -> u32 {
        self.rule(vaccine_name).max_doses
    }

    pub fn interval_days(&self, vaccine_name: &str) -> u32 {
        self.rule(vaccine_name).interval_days
    }

    /// Dose number that follows `dose_number`, if the schedule has one.
    pub fn next_dose(&self, vaccine_name: &str, dose_number: u32) -> Option<u32> {
        let next = dose_number.checked_add(1)?;
        (next <= self.max_doses(vaccine_name)).then_some(next)
    }

    /// Applies overrides from CSV with columns `vaccine,max_doses,interval_days`.
    ///
    /// # Errors
    ///
    /// Returns a CSV error if a row cannot be read or parsed.
    pub fn load_overrides<R: Read>(&mut self, reader: R) -> Result<usize, csv::Error> {
        let mut rdr = ReaderBuilder::new()
            .trim(Trim::All)
            .has_headers(true)
            .from_reader(reader);

        let mut applied = 0;
        for record in rdr.deserialize::<ScheduleRecord>() {
            let record = record?;
            self.set_rule(
                &record.vaccine,
                DoseRule::new(record.max_doses, record.interval_days),
            );
            applied += 1;
        }
        Ok(applied)
    }
}

impl Default for DosingSchedule {
    fn default() -> Self {
        let mut schedule = Self::empty();
        for (name, rule) in DEFAULT_RULES {
            schedule.set_rule(name, *rule);
        }
        schedule
    }
}
