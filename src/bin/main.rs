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

use chrono::NaiveDate;
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vaccine_ledger::{
    AdjustStock, AdjustmentReason, BatchId, Clock, DosingSchedule, FacilityId, FixedClock,
    InMemoryAppointments, InMemoryPatients, InlineDispatch, NewBatch, PatientId,
    RecordVaccination, StockLedger, SystemClock, UserId, VaccinationRecorder,
};

/// Vaccine Ledger - Process stock and vaccination CSV files
///
/// Reads commands from a CSV file and writes every batch's final state to
/// stdout. Logs go to stderr; set `RUST_LOG` to change the level.
#[derive(Parser, Debug)]
#[command(name = "vaccine-ledger")]
#[command(about = "Tracks vaccine batches and the doses drawn from them", long_about = None)]
struct Args {
    /// Path to CSV file with commands
    ///
    /// Expected format: type,facility,batch,vaccine,manufacturer,quantity,expiry,reason,notes,patient,dose
    /// Example: cargo run -- commands.csv > batches.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Facility used when a row leaves the facility column empty
    #[arg(long, env = "VAX_FACILITY", default_value = "FAC-1")]
    facility: String,

    /// Acting user id stamped on every movement and vaccination
    #[arg(long, env = "VAX_ACTOR", default_value_t = 1)]
    actor: u64,

    /// Treat this date (YYYY-MM-DD) as today instead of the system date
    #[arg(long)]
    today: Option<NaiveDate>,

    /// CSV with dosing schedule overrides: vaccine,max_doses,interval_days
    #[arg(long, value_name = "FILE")]
    schedule: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut schedule = DosingSchedule::default();
    if let Some(path) = &args.schedule {
        let loaded = File::open(path)
            .map_err(csv::Error::from)
            .and_then(|f| schedule.load_overrides(BufReader::new(f)));
        match loaded {
            Ok(count) => info!(count, path = %path.display(), "dosing schedule overrides loaded"),
            Err(e) => {
                error!("Error loading schedule '{}': {}", path.display(), e);
                process::exit(1);
            }
        }
    }

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            error!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let clock: Arc<dyn Clock> = match args.today {
        Some(today) => Arc::new(FixedClock::new(today)),
        None => Arc::new(SystemClock),
    };
    let config = Config {
        facility: FacilityId::new(args.facility),
        actor: UserId(args.actor),
        clock,
        schedule,
    };

    let session = match process_commands(BufReader::new(file), config) {
        Ok(session) => session,
        Err(e) => {
            error!("Error processing commands: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = write_batches(&session.ledger, std::io::stdout()) {
        error!("Error writing output: {}", e);
        process::exit(1);
    }
}

/// Settings shared by every row of a run.
struct Config {
    facility: FacilityId,
    actor: UserId,
    clock: Arc<dyn Clock>,
    schedule: DosingSchedule,
}

/// State built up while processing a command file.
struct Session {
    ledger: Arc<StockLedger>,
    recorder: VaccinationRecorder,
    patients: Arc<InMemoryPatients>,
    /// Patient labels from the file mapped to registered patients.
    patient_ids: HashMap<String, PatientId>,
    default_facility: FacilityId,
    actor: UserId,
}

impl Session {
    fn new(config: Config) -> Self {
        let ledger = Arc::new(StockLedger::with_clock(config.clock));
        let patients = Arc::new(InMemoryPatients::new());
        let appointments = Arc::new(InlineDispatch::new(InMemoryAppointments::new()));
        let recorder = VaccinationRecorder::new(Arc::clone(&ledger), patients.clone(), appointments)
            .with_schedule(config.schedule);
        Self {
            ledger,
            recorder,
            patients,
            patient_ids: HashMap::new(),
            default_facility: config.facility,
            actor: config.actor,
        }
    }

    fn patient(&mut self, label: &str) -> PatientId {
        let patients = &self.patients;
        *self
            .patient_ids
            .entry(label.to_string())
            .or_insert_with(|| patients.register(label))
    }

    fn apply(&mut self, record: CsvRecord) -> Result<(), String> {
        let facility = record
            .facility
            .clone()
            .map(FacilityId::new)
            .unwrap_or_else(|| self.default_facility.clone());

        match record.command.to_lowercase().as_str() {
            "receive" => {
                let batch = NewBatch {
                    facility_id: facility,
                    batch_number: record.batch.ok_or("missing batch")?,
                    vaccine_name: record.vaccine.ok_or("missing vaccine")?,
                    manufacturer: record.manufacturer.unwrap_or_default(),
                    quantity: record
                        .quantity
                        .and_then(|q| u32::try_from(q).ok())
                        .ok_or("missing or negative quantity")?,
                    expiry_date: record.expiry.ok_or("missing expiry")?,
                    receipt_date: self.ledger.today(),
                };
                self.ledger
                    .receive(batch, self.actor)
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            "adjust" => {
                let reason: AdjustmentReason = record.reason.ok_or("missing reason")?.parse()?;
                let delta = record
                    .quantity
                    .and_then(|q| i32::try_from(q).ok())
                    .ok_or("missing quantity")?;
                let adjustment = AdjustStock {
                    facility_id: facility,
                    batch_number: record.batch.ok_or("missing batch")?,
                    vaccine_name: record.vaccine.ok_or("missing vaccine")?,
                    delta,
                    reason,
                    notes: record.notes,
                };
                self.ledger
                    .adjust(adjustment, self.actor)
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            "vaccinate" => {
                let patient_id = self.patient(&record.patient.ok_or("missing patient")?);
                let batch_id = match &record.batch {
                    Some(number) => Some(self.batch_id(&facility, number)?),
                    None => None,
                };
                let request = RecordVaccination {
                    patient_id,
                    vaccine_name: record.vaccine.ok_or("missing vaccine")?,
                    dose_number: record.dose.ok_or("missing dose")?,
                    date_administered: self.ledger.today(),
                    facility_id: facility,
                    batch_id,
                    administration_site: None,
                    notes: record.notes,
                };
                let recorded = self
                    .recorder
                    .record(request, self.actor)
                    .map_err(|e| e.to_string())?;
                if let Some(next) = recorded.next_appointment {
                    debug!(dose = next.dose_number, date = %next.date, "next dose scheduled");
                }
                Ok(())
            }
            "writeoff" => {
                let written_off = self.ledger.write_off_expired(&facility, self.actor);
                debug!(batches = written_off.len(), "expired batches written off");
                Ok(())
            }
            other => Err(format!("unknown command: {other}")),
        }
    }

    fn batch_id(&self, facility: &FacilityId, batch_number: &str) -> Result<BatchId, String> {
        self.ledger
            .batch_by_number(facility, batch_number)
            .map(|b| b.id)
            .ok_or_else(|| format!("unknown batch: {batch_number}"))
    }
}

/// Raw CSV record matching the input format.
///
/// Only `type` is required; which other columns matter depends on the command.
#[derive(Debug, Deserialize)]
struct CsvRecord {
    #[serde(rename = "type")]
    command: String,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    facility: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    batch: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    vaccine: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    manufacturer: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    quantity: Option<i64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    expiry: Option<NaiveDate>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    reason: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    notes: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    patient: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    dose: Option<u32>,
}

/// Process commands from a CSV reader.
///
/// Rows are applied in file order. Malformed rows and rejected commands are
/// logged and skipped.
///
/// # CSV Format
///
/// Columns: `type, facility, batch, vaccine, manufacturer, quantity, expiry, reason, notes, patient, dose`
/// - `receive`: `batch`, `vaccine`, `quantity` and `expiry` are required
/// - `adjust`: `batch`, `vaccine`, signed `quantity` and `reason` are required
/// - `vaccinate`: `patient`, `vaccine` and `dose` are required; `batch` pins the batch
/// - `writeoff`: drains expired batches of the facility
///
/// An empty `facility` falls back to the configured default.
///
/// # Example
///
/// ```csv
/// type,facility,batch,vaccine,manufacturer,quantity,expiry,reason,notes,patient,dose
/// receive,FAC-1,B-001,BCG,Serum Institute,10,2026-01-31,,,,
/// vaccinate,FAC-1,,BCG,,,,,,ama,1
/// adjust,FAC-1,B-001,BCG,,-3,,DAMAGED,cold chain break,,
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the header cannot be read.
fn process_commands<R: Read>(reader: R, config: Config) -> Result<Session, csv::Error> {
    let mut session = Session::new(config);

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);
    rdr.headers()?;

    for (line, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let row = line + 2;
        match result {
            Ok(record) => {
                if let Err(e) = session.apply(record) {
                    warn!(row, "skipping command: {e}");
                }
            }
            Err(e) => {
                warn!(row, "skipping malformed row: {e}");
            }
        }
    }

    info!(
        batches = session.ledger.batch_ids().len(),
        movements = session.ledger.movement_count(),
        vaccinations = session.recorder.registry().len(),
        "commands processed"
    );
    Ok(session)
}

/// Output row for one batch.
#[derive(Debug, Serialize)]
struct BatchRow {
    facility: String,
    batch: String,
    vaccine: String,
    received: u32,
    remaining: u32,
    expiry: NaiveDate,
    expired: bool,
    expiring_soon: bool,
}

/// Write every batch's state to a CSV writer, ordered by batch id.
///
/// # CSV Format
///
/// Columns: `facility, batch, vaccine, received, remaining, expiry, expired, expiring_soon`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
fn write_batches<W: Write>(ledger: &StockLedger, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    for id in ledger.batch_ids() {
        let Ok(view) = ledger.batch_view(id) else {
            continue;
        };
        wtr.serialize(BatchRow {
            facility: view.batch.facility_id.to_string(),
            batch: view.batch.batch_number,
            vaccine: view.batch.vaccine_name,
            received: view.batch.quantity_received,
            remaining: view.batch.quantity_remaining,
            expiry: view.batch.expiry_date,
            expired: view.is_expired,
            expiring_soon: view.is_expiring_soon,
        })?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use vaccine_ledger::MovementFilter;

    const HEADER: &str = "type,facility,batch,vaccine,manufacturer,quantity,expiry,reason,notes,patient,dose\n";

    fn config() -> Config {
        Config {
            facility: FacilityId::new("FAC-1"),
            actor: UserId(9),
            clock: Arc::new(FixedClock::new(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap())),
            schedule: DosingSchedule::default(),
        }
    }

    fn run(rows: &str) -> Session {
        process_commands(Cursor::new(format!("{HEADER}{rows}")), config()).unwrap()
    }

    fn record(row: &str) -> CsvRecord {
        ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(Cursor::new(format!("{HEADER}{row}\n")))
            .deserialize::<CsvRecord>()
            .next()
            .unwrap()
            .unwrap()
    }

    fn remaining(session: &Session, batch: &str) -> u32 {
        session
            .ledger
            .batch_by_number(&FacilityId::new("FAC-1"), batch)
            .unwrap()
            .quantity_remaining
    }

    #[test]
    fn receive_and_vaccinate() {
        let session = run("receive,FAC-1,B-001,BCG,Acme,10,2025-08-28,,,,\n\
                           vaccinate,FAC-1,,bcg,,,,,,ama,1\n");
        assert_eq!(remaining(&session, "B-001"), 9);
        assert_eq!(session.recorder.registry().len(), 1);
    }

    #[test]
    fn empty_facility_uses_default() {
        let session = run("receive,,B-001,OPV,,5,2025-08-28,,,,\n");
        assert_eq!(remaining(&session, "B-001"), 5);
    }

    #[test]
    fn adjust_with_reason_and_notes() {
        let session = run("receive,FAC-1,B-001,BCG,,10,2025-08-28,,,,\n\
                           adjust,FAC-1,B-001,BCG,,-3,,damaged,cold chain break,,\n");
        assert_eq!(remaining(&session, "B-001"), 7);

        let movements = session
            .ledger
            .movements(&MovementFilter::batch(FacilityId::new("FAC-1"), "B-001"));
        assert_eq!(movements.last().unwrap().reason, "DAMAGED: cold chain break");
    }

    #[test]
    fn rejected_commands_are_skipped() {
        let session = run("receive,FAC-1,B-001,BCG,,10,2025-08-28,,,,\n\
                           adjust,FAC-1,B-001,BCG,,-1,,STOLEN,,,\n\
                           explode,FAC-1,,,,,,,,,\n\
                           receive,FAC-1,B-001,BCG,,10,2025-08-28,,,,\n");
        assert_eq!(remaining(&session, "B-001"), 10);
        assert_eq!(session.ledger.movement_count(), 1);
    }

    #[test]
    fn adjustment_cannot_overdraw_batch() {
        let mut session = run("receive,FAC-1,B-001,BCG,,10,2025-08-28,,,,\n");

        let err = session
            .apply(record("adjust,FAC-1,B-001,BCG,,-30,,DAMAGED,,,"))
            .unwrap_err();
        assert!(err.contains("insufficient stock"), "{err}");
        assert_eq!(remaining(&session, "B-001"), 10);
        assert_eq!(session.ledger.movement_count(), 1);

        let err = session
            .apply(record("adjust,FAC-1,B-001,BCG,,-1,,STOLEN,,,"))
            .unwrap_err();
        assert!(err.contains("unknown adjustment reason"), "{err}");
        assert_eq!(remaining(&session, "B-001"), 10);
    }

    #[test]
    fn adjust_row_parses_reason_and_notes() {
        let parsed = record("adjust,FAC-1,B-001,BCG,,-3,,damaged,cold chain break,,");
        assert_eq!(parsed.quantity, Some(-3));
        assert_eq!(parsed.expiry, None);
        assert_eq!(parsed.reason.as_deref(), Some("damaged"));
        assert_eq!(parsed.notes.as_deref(), Some("cold chain break"));
    }

    #[test]
    fn duplicate_dose_for_same_patient_label() {
        let session = run("receive,FAC-1,B-001,OPV,,10,2025-08-28,,,,\n\
                           vaccinate,FAC-1,,OPV,,,,,,kofi,1\n\
                           vaccinate,FAC-1,,OPV,,,,,,kofi,1\n\
                           vaccinate,FAC-1,,OPV,,,,,,kofi,2\n");
        assert_eq!(remaining(&session, "B-001"), 8);
        assert_eq!(session.recorder.registry().len(), 2);
    }

    #[test]
    fn pinned_batch_by_number() {
        let session = run("receive,FAC-1,B-001,OPV,,10,2025-05-01,,,,\n\
                           receive,FAC-1,B-002,OPV,,10,2025-09-01,,,,\n\
                           vaccinate,FAC-1,B-002,OPV,,,,,,kofi,1\n");
        assert_eq!(remaining(&session, "B-001"), 10);
        assert_eq!(remaining(&session, "B-002"), 9);
    }

    #[test]
    fn writeoff_drains_expired_batches() {
        let session = run("receive,FAC-1,B-001,OPV,,10,2025-02-01,,,,\n\
                           writeoff,FAC-1,,,,,,,,,\n");
        assert_eq!(remaining(&session, "B-001"), 0);
    }

    #[test]
    fn skip_malformed_rows() {
        let session = run("receive,FAC-1,B-001,BCG,,ten,2025-08-28,,,,\n\
                           receive,FAC-1,B-002,BCG,,10,not-a-date,,,,\n\
                           receive,FAC-1,B-003,BCG,,10,2025-08-28,,,,\n");
        assert_eq!(session.ledger.batch_ids().len(), 1);
    }

    #[test]
    fn write_batches_to_csv() {
        let session = run("receive,FAC-1,B-001,BCG,,10,2025-03-20,,,,\n");

        let mut output = Vec::new();
        write_batches(&session.ledger, &mut output).unwrap();

        let output = String::from_utf8(output).unwrap();
        assert!(output.starts_with(
            "facility,batch,vaccine,received,remaining,expiry,expired,expiring_soon\n"
        ));
        assert!(output.contains("FAC-1,B-001,BCG,10,10,2025-03-20,false,true"));
    }
}
