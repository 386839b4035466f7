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

//! Concurrency tests using parking_lot's built-in deadlock detector.
//!
//! These tests drive the ledger and recorder from many threads at once and
//! check that stock is never oversold, duplicate doses are never recorded
//! twice, and the lock graph has no cycles.
//!
//! parking_lot is built with the `deadlock_detection` feature in dev.

use chrono::{Days, NaiveDate};
use parking_lot::deadlock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use vaccine_ledger::{
    AdjustStock, AdjustmentReason, ErrorKind, FacilityId, FixedClock, InMemoryAppointments,
    InMemoryPatients, MovementFilter, NewBatch, PatientId, QueuedDispatch, RecordVaccination,
    RecordingError, StockLedger, UserId, VaccinationRecorder,
};

const ACTOR: UserId = UserId(1);

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
}

fn facility(n: usize) -> FacilityId {
    FacilityId::new(format!("FAC-{n}"))
}

fn ledger() -> Arc<StockLedger> {
    Arc::new(StockLedger::with_clock(Arc::new(FixedClock::new(today()))))
}

fn receive(ledger: &StockLedger, facility_id: FacilityId, number: &str, quantity: u32, expires_in: u64) {
    ledger
        .receive(
            NewBatch {
                facility_id,
                batch_number: number.to_string(),
                vaccine_name: "OPV".to_string(),
                manufacturer: "Acme".to_string(),
                quantity,
                expiry_date: today() + Days::new(expires_in),
                receipt_date: today(),
            },
            ACTOR,
        )
        .unwrap();
}

// === Deadlock Detector ===

/// Starts a background thread that checks for deadlocks periodically.
fn start_deadlock_detector() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();

    thread::spawn(move || {
        while running_clone.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
            let deadlocks = deadlock::check_deadlock();
            if !deadlocks.is_empty() {
                eprintln!("\n=== DEADLOCK DETECTED ===");
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("\nDeadlock #{}", i + 1);
                    for t in threads {
                        eprintln!("Thread ID: {:?}", t.thread_id());
                        eprintln!("Backtrace:\n{:#?}", t.backtrace());
                    }
                }
                panic!("Deadlock detected! See output above for details.");
            }
        }
    });

    running
}

/// Stops the deadlock detector.
fn stop_deadlock_detector(running: Arc<AtomicBool>) {
    running.store(false, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(150));
}

// === Tests ===

/// Two allocations race for the last dose; exactly one wins.
#[test]
fn last_dose_goes_to_exactly_one_caller() {
    for _ in 0..50 {
        let ledger = ledger();
        receive(&ledger, facility(1), "B-001", 1, 90);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let ledger = ledger.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    ledger.allocate_by_vaccine(&facility(1), "OPV", 1, ACTOR)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert_eq!(err.kind(), ErrorKind::InsufficientStock);
        }

        let batch = ledger.batch_by_number(&facility(1), "B-001").unwrap();
        assert_eq!(batch.quantity_remaining, 0);
        assert_eq!(ledger.verify_batch(batch.id), Ok(()));
    }
}

/// Many threads drain a batch; successes match the stock exactly.
#[test]
fn no_overselling_under_contention() {
    let detector = start_deadlock_detector();
    let ledger = ledger();
    receive(&ledger, facility(1), "B-001", 100, 30);
    receive(&ledger, facility(1), "B-002", 100, 60);

    const NUM_THREADS: usize = 16;
    const OPS_PER_THREAD: usize = 25;

    let successes = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let ledger = ledger.clone();
            let successes = successes.clone();
            thread::spawn(move || {
                for _ in 0..OPS_PER_THREAD {
                    if ledger.allocate_by_vaccine(&facility(1), "OPV", 1, ACTOR).is_ok() {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }
    stop_deadlock_detector(detector);

    // 400 attempts against 200 doses.
    assert_eq!(successes.load(Ordering::SeqCst), 200);
    assert_eq!(ledger.total_available(&facility(1), "OPV"), 0);
    for id in ledger.batch_ids() {
        assert_eq!(ledger.verify_batch(id), Ok(()));
    }
}

/// Allocations, adjustments, write-offs and reads mixed across facilities.
#[test]
fn no_deadlock_mixed_operations() {
    let detector = start_deadlock_detector();
    let ledger = ledger();

    const NUM_FACILITIES: usize = 4;
    const NUM_THREADS: usize = 24;
    const OPS_PER_THREAD: usize = 100;

    for f in 0..NUM_FACILITIES {
        receive(&ledger, facility(f), "B-001", 500, 30);
        receive(&ledger, facility(f), "B-002", 500, 90);
    }

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let ledger = ledger.clone();
            thread::spawn(move || {
                for i in 0..OPS_PER_THREAD {
                    let fac = facility((t + i) % NUM_FACILITIES);
                    match (t + i) % 5 {
                        0 | 1 => {
                            let _ = ledger.allocate_by_vaccine(&fac, "OPV", 1, ACTOR);
                        }
                        2 => {
                            let _ = ledger.adjust(
                                AdjustStock {
                                    facility_id: fac,
                                    batch_number: "B-002".to_string(),
                                    vaccine_name: "OPV".to_string(),
                                    delta: if i % 2 == 0 { -1 } else { 1 },
                                    reason: AdjustmentReason::Correction,
                                    notes: None,
                                },
                                ACTOR,
                            );
                        }
                        3 => {
                            let _ = ledger.write_off_expired(&fac, ACTOR);
                            let _ = ledger.stock_levels(&fac);
                        }
                        _ => {
                            let _ = ledger.movements(&MovementFilter::facility(fac.clone()));
                            let _ = ledger.available_batches(&fac, "OPV");
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }
    stop_deadlock_detector(detector);

    for id in ledger.batch_ids() {
        assert_eq!(ledger.verify_batch(id), Ok(()));
    }
}

/// Concurrent recordings of the same dose take stock once.
#[test]
fn concurrent_duplicate_recordings_deduct_once() {
    let detector = start_deadlock_detector();
    let ledger = ledger();
    receive(&ledger, facility(1), "B-001", 100, 90);

    let patients = Arc::new(InMemoryPatients::new());
    let queue = Arc::new(QueuedDispatch::spawn(InMemoryAppointments::new()));
    let recorder = Arc::new(VaccinationRecorder::new(ledger.clone(), patients.clone(), queue.clone()));

    const NUM_PATIENTS: usize = 10;
    const ATTEMPTS_PER_PATIENT: usize = 8;

    let patient_ids: Vec<PatientId> = (0..NUM_PATIENTS)
        .map(|i| patients.register(format!("Patient {i}")))
        .collect();
    let barrier = Arc::new(Barrier::new(NUM_PATIENTS * ATTEMPTS_PER_PATIENT));

    let handles: Vec<_> = patient_ids
        .iter()
        .flat_map(|&patient_id| std::iter::repeat_n(patient_id, ATTEMPTS_PER_PATIENT))
        .map(|patient_id| {
            let recorder = recorder.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                recorder.record(
                    RecordVaccination {
                        patient_id,
                        vaccine_name: "OPV".to_string(),
                        dose_number: 1,
                        date_administered: today(),
                        facility_id: facility(1),
                        batch_id: None,
                        administration_site: None,
                        notes: None,
                    },
                    UserId(2),
                )
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    stop_deadlock_detector(detector);
    queue.shutdown();

    let recorded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(recorded, NUM_PATIENTS);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| *e == RecordingError::DuplicateDose));

    let batch = ledger.batch_by_number(&facility(1), "B-001").unwrap();
    assert_eq!(batch.quantity_remaining, 100 - NUM_PATIENTS as u32);
    assert_eq!(recorder.registry().len(), NUM_PATIENTS);
    assert_eq!(ledger.verify_batch(batch.id), Ok(()));
}
