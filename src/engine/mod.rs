//! The engine: owns the flow tables, the PCAP handle, and the worker
//! thread. Grounded on the reference crate's `App`
//! (`app/mod.rs`) for the shape of a start/stop-able core object, and on
//! the original's single pselect-driven worker for the loop itself
//! (`engine::event_loop`).

mod fdset;
mod event_loop;
mod socket;
pub mod signal;

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::info;

use crate::callbacks::HostCallbacks;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::flow::FlowTables;
use crate::hosts;
use crate::owner::{OwnerTable, ProcOwnerTable};
use crate::pcap::PcapWriter;

/// The mutable state guarded by the engine's single global mutex
/// the session tables and the PCAP file handle.
pub struct EngineState {
    pub tables: FlowTables,
    pub pcap: Option<PcapWriter>,
}

struct WorkerHandle {
    thread: thread::JoinHandle<()>,
    native_thread: libc::pthread_t,
}

/// The engine. Constructed once per TUN session; `start`/`stop` may be
/// called from a different thread than the one that created it (the
/// main process thread may concurrently invoke start/stop).
pub struct Engine {
    config: EngineConfig,
    callbacks: Arc<dyn HostCallbacks>,
    owner_table: Arc<dyn OwnerTable>,
    clock: Arc<dyn Clock>,
    blocklist: std::collections::HashSet<String>,
    allowed: Arc<Mutex<HashSet<i32>>>,
    state: Arc<Mutex<EngineState>>,
    stopping: Arc<AtomicBool>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl Engine {
    /// Builds an engine with the production owner table and system
    /// clock. Loads the hosts blocklist eagerly if a path is configured.
    pub fn new(config: EngineConfig, callbacks: Arc<dyn HostCallbacks>) -> Result<Self> {
        Self::with_dependencies(config, callbacks, Arc::new(ProcOwnerTable), Arc::new(SystemClock))
    }

    /// Builds an engine with injected `OwnerTable`/`Clock` implementations,
    /// for tests that need to avoid touching real `/proc` state or real
    /// wall-clock time.
    pub fn with_dependencies(
        config: EngineConfig,
        callbacks: Arc<dyn HostCallbacks>,
        owner_table: Arc<dyn OwnerTable>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let blocklist = match &config.hosts_path {
            Some(path) => hosts::read_hosts(path)?,
            None => Default::default(),
        };
        let allowed = config.allowed_owners.iter().copied().collect();
        Ok(Engine {
            config,
            callbacks,
            owner_table,
            clock,
            blocklist,
            allowed: Arc::new(Mutex::new(allowed)),
            state: Arc::new(Mutex::new(EngineState { tables: FlowTables::new(), pcap: None })),
            stopping: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        })
    }

    /// Starts the worker thread. Returns an error if already running.
    pub fn start(&self) -> Result<()> {
        let mut worker_slot = self.worker.lock().unwrap();
        if worker_slot.is_some() {
            return Err(crate::error::Error::Protocol("engine already running".into()));
        }

        self.stopping.store(false, Ordering::SeqCst);
        let worker = event_loop::Worker {
            config: self.config.clone(),
            callbacks: self.callbacks.clone(),
            owner_table: self.owner_table.clone(),
            clock: self.clock.clone(),
            blocklist: self.blocklist.clone(),
            allowed: self.allowed.clone(),
        };
        let state = self.state.clone();
        let stopping = self.stopping.clone();

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread = thread::Builder::new()
            .name("sinkhole-worker".into())
            .spawn(move || {
                let _ = ready_tx.send(unsafe { libc::pthread_self() });
                event_loop::run(worker, state, stopping);
            })
            .map_err(crate::error::Error::Io)?;
        let native_thread = ready_rx.recv().map_err(|_| {
            crate::error::Error::Protocol("worker thread exited before reporting readiness".into())
        })?;

        *worker_slot = Some(WorkerHandle { thread, native_thread });
        info!("sinkhole engine started");
        Ok(())
    }

    /// Stops the worker and joins it. No-op if not running.
    pub fn stop(&self) {
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            self.stopping.store(true, Ordering::SeqCst);
            signal::wake(handle.native_thread);
            let _ = handle.thread.join();
            info!("sinkhole engine stopped");
        }
    }

    /// Enables or disables PCAP capture, contending on the global mutex
    /// with the worker.
    pub fn set_pcap(&self, path: Option<&Path>) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        guard.pcap = match path {
            Some(p) => Some(PcapWriter::open(p, true).map_err(|e| crate::error::Error::Pcap(e.to_string()))?),
            None => None,
        };
        Ok(())
    }

    /// Replaces the allow-list while the engine is running. Every
    /// non-terminal TCP flow belonging to a
    /// now-excluded owner is reset to `TIME_WAIT`; every UDP flow of
    /// such an owner is marked `stop`. Safe to call from any thread: the
    /// mutation happens under `state`'s lock, same as the worker's own
    /// (all other mutations occur while holding the global mutex).
    pub fn check_allowed(&self, allowed_owners: &[i32]) {
        let allowed: HashSet<i32> = allowed_owners.iter().copied().collect();
        *self.allowed.lock().unwrap() = allowed.clone();
        let mut guard = self.state.lock().unwrap();
        event_loop::apply_allowlist(self.config.tun_fd, &mut guard, &allowed);
    }
}
