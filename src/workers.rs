//! Background worker lanes
//!
//! Three independent lanes so slow I/O in one never blocks the others:
//! lesson lifecycle jobs, the periodic reconciliation sweep, and recording
//! ingestion. Lifecycle and ingestion are bounded-channel thread pools;
//! the sweep is a single timer thread.

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::ingest::IngestPipeline;
use crate::lifecycle::{Coordinator, StartError};
use crate::provider::MeetingInfo;
use crate::sweeper::Sweeper;

/// How often the ingestion pump polls for due recordings. Also bounds how
/// quickly unfinished work is picked back up after a restart.
const INGEST_POLL_SECS: u64 = 5;

/// Due recordings fetched per pump pass
const INGEST_BATCH: u64 = 32;

const LIFECYCLE_QUEUE_DEPTH: usize = 64;
const INGEST_QUEUE_DEPTH: usize = 256;

/// One lifecycle request with its reply channel
pub enum LifecycleJob {
    Start {
        lesson_id: String,
        reply: Sender<Result<MeetingInfo, StartError>>,
    },
    End {
        lesson_id: String,
        reply: Sender<Result<(), String>>,
    },
}

/// Handles to the running lanes. Dropping the senders and firing the stop
/// channel shuts everything down; `shutdown` does both and joins.
pub struct WorkerHandles {
    lifecycle_tx: Sender<LifecycleJob>,
    ingest_tx: Sender<String>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    sweep_stop_tx: mpsc::Sender<()>,
    pump_stop_tx: mpsc::Sender<()>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerHandles {
    pub fn lifecycle_sender(&self) -> Sender<LifecycleJob> {
        self.lifecycle_tx.clone()
    }

    /// Queue a recording for ingestion work, deduplicating against work
    /// already in flight. Used by the webhook path for a fast first step;
    /// the pump would pick the recording up on its own within one poll.
    pub fn enqueue_recording(&self, recording_id: &str) {
        enqueue_dedup(&self.ingest_tx, &self.in_flight, recording_id);
    }

    pub fn shutdown(self) {
        let _ = self.sweep_stop_tx.send(());
        let _ = self.pump_stop_tx.send(());
        drop(self.lifecycle_tx);
        drop(self.ingest_tx);
        for handle in self.threads {
            if let Err(e) = handle.join() {
                error!("[workers] Worker thread panicked: {:?}", e);
            }
        }
        info!("[workers] All worker lanes stopped");
    }
}

fn enqueue_dedup(
    tx: &Sender<String>,
    in_flight: &Arc<Mutex<HashSet<String>>>,
    recording_id: &str,
) {
    {
        let mut guard = match in_flight.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if !guard.insert(recording_id.to_string()) {
            return;
        }
    }
    if tx.send(recording_id.to_string()).is_err() {
        if let Ok(mut guard) = in_flight.lock() {
            guard.remove(recording_id);
        }
    }
}

/// Spawn all three lanes
pub fn spawn_workers(
    coordinator: Arc<Coordinator>,
    sweeper: Sweeper,
    pipeline: Arc<IngestPipeline>,
    lifecycle_workers: usize,
    ingest_workers: usize,
    sweep_interval: Duration,
) -> WorkerHandles {
    let mut threads = Vec::new();

    // Lane 1: lesson lifecycle
    let (lifecycle_tx, lifecycle_rx) = bounded::<LifecycleJob>(LIFECYCLE_QUEUE_DEPTH);
    for n in 0..lifecycle_workers.max(1) {
        let rx = lifecycle_rx.clone();
        let coordinator = coordinator.clone();
        let handle = thread::Builder::new()
            .name(format!("lifecycle-{}", n))
            .spawn(move || lifecycle_worker(rx, coordinator))
            .expect("Failed to spawn lifecycle worker");
        threads.push(handle);
    }

    // Lane 2: reconciliation sweep
    let (sweep_stop_tx, sweep_stop_rx) = mpsc::channel::<()>();
    let handle = thread::Builder::new()
        .name("sweeper".to_string())
        .spawn(move || sweeper.run(sweep_interval, sweep_stop_rx))
        .expect("Failed to spawn sweeper");
    threads.push(handle);

    // Lane 3: recording ingestion plus its pump
    let (ingest_tx, ingest_rx) = bounded::<String>(INGEST_QUEUE_DEPTH);
    let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    for n in 0..ingest_workers.max(1) {
        let rx = ingest_rx.clone();
        let pipeline = pipeline.clone();
        let in_flight = in_flight.clone();
        let handle = thread::Builder::new()
            .name(format!("ingest-{}", n))
            .spawn(move || ingest_worker(rx, pipeline, in_flight))
            .expect("Failed to spawn ingest worker");
        threads.push(handle);
    }

    let (pump_stop_tx, pump_stop_rx) = mpsc::channel::<()>();
    let pump_tx = ingest_tx.clone();
    let pump_pipeline = pipeline.clone();
    let pump_in_flight = in_flight.clone();
    let handle = thread::Builder::new()
        .name("ingest-pump".to_string())
        .spawn(move || ingest_pump(pump_tx, pump_pipeline, pump_in_flight, pump_stop_rx))
        .expect("Failed to spawn ingest pump");
    threads.push(handle);

    info!(
        "[workers] Lanes up: {} lifecycle, {} ingest, sweep every {}s",
        lifecycle_workers.max(1),
        ingest_workers.max(1),
        sweep_interval.as_secs()
    );

    WorkerHandles {
        lifecycle_tx,
        ingest_tx,
        in_flight,
        sweep_stop_tx,
        pump_stop_tx,
        threads,
    }
}

fn lifecycle_worker(rx: Receiver<LifecycleJob>, coordinator: Arc<Coordinator>) {
    for job in rx.iter() {
        match job {
            LifecycleJob::Start { lesson_id, reply } => {
                let result = coordinator.start_lesson(&lesson_id);
                if reply.send(result).is_err() {
                    warn!(
                        "[workers] Start reply for lesson {} dropped by caller",
                        lesson_id
                    );
                }
            }
            LifecycleJob::End { lesson_id, reply } => {
                let result = coordinator
                    .end_lesson(&lesson_id)
                    .map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
        }
    }
}

/// Step one recording until it parks (terminal state or retry backoff).
/// Steps within one recording stay strictly sequential; the in-flight set
/// keeps two workers off the same recording.
fn ingest_worker(
    rx: Receiver<String>,
    pipeline: Arc<IngestPipeline>,
    in_flight: Arc<Mutex<HashSet<String>>>,
) {
    for recording_id in rx.iter() {
        let mut previous = None;
        loop {
            match pipeline.step(&recording_id) {
                Ok(status) => {
                    if status.is_terminal() || previous == Some(status) {
                        // Done, or parked for a backoff retry
                        break;
                    }
                    previous = Some(status);
                }
                Err(e) => {
                    error!(
                        "[workers] Ingest step failed for recording {}: {}",
                        recording_id, e
                    );
                    break;
                }
            }
        }
        if let Ok(mut guard) = in_flight.lock() {
            guard.remove(&recording_id);
        }
    }
}

/// Poll for due recordings and feed the ingest lane. Doubles as restart
/// recovery: anything mid-pipeline in the database gets picked up here.
fn ingest_pump(
    tx: Sender<String>,
    pipeline: Arc<IngestPipeline>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    stop_rx: mpsc::Receiver<()>,
) {
    let interval = Duration::from_secs(INGEST_POLL_SECS);
    loop {
        match stop_rx.recv_timeout(interval) {
            Ok(_) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                match pipeline.due_recordings(INGEST_BATCH) {
                    Ok(due) => {
                        for recording_id in due {
                            enqueue_dedup(&tx, &in_flight, &recording_id);
                        }
                    }
                    Err(e) => error!("[workers] Failed to query due recordings: {}", e),
                }
            }
        }
    }
}
