//! Start/stop lifecycle of the background recognition thread.
//!
//! At most one loop runs at a time. Each start bumps a generation counter;
//! a loop only keeps going while the controller is running *and* still on
//! its generation, so a loop left over from an earlier run can never keep
//! a later run's state alive or mark it stopped.

use crate::backend::Backend;
use crate::gallery::Gallery;
use crate::recognition::{LoopSettings, RecognitionLoop};
use crate::results::ResultChannel;
use crate::Error;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

#[derive(Default)]
struct RunState {
    running: bool,
    generation: u64,
}

struct Shared {
    state: Mutex<RunState>,
    results: Arc<ResultChannel>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.state();
        state.running && state.generation == generation
    }
}

/// Marks the controller idle when a loop ends without being asked to,
/// including by panic
struct ExitGuard<'a> {
    shared: &'a Shared,
    generation: u64,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state();
        if state.running && state.generation == self.generation {
            log::warn!("Recognition loop exited on its own");
            state.running = false;
        }
    }
}

pub struct RecognitionController {
    shared: Arc<Shared>,
    backend: Arc<dyn Backend>,
    settings: LoopSettings,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RecognitionController {
    pub fn new(backend: Arc<dyn Backend>, settings: LoopSettings, capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RunState::default()),
                results: Arc::new(ResultChannel::new(capacity)),
            }),
            backend,
            settings,
            worker: Mutex::new(None),
        }
    }

    pub fn results(&self) -> &Arc<ResultChannel> {
        &self.shared.results
    }

    pub fn is_running(&self) -> bool {
        self.shared.state().running
    }

    fn worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear pending results and launch the loop on a new thread. The
    /// capture source and models are opened on that thread; if opening
    /// fails the controller drops back to idle.
    ///
    /// A loop that was stopped but has not exited yet is joined first, so
    /// its source is released before the new loop opens one.
    pub fn start(&self) -> Result<(), Error> {
        let mut worker = self.worker();
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        if let Some(previous) = worker.take() {
            join_worker(previous);
        }

        // Only `start` sets `running`, and it holds `worker` while doing so
        let mut state = self.shared.state();
        self.shared.results.clear();
        state.generation += 1;
        state.running = true;
        let generation = state.generation;

        let shared = Arc::clone(&self.shared);
        let backend = Arc::clone(&self.backend);
        let settings = self.settings.clone();
        let spawned = thread::Builder::new()
            .name("recognition".to_string())
            .spawn(move || run_worker(&shared, generation, backend.as_ref(), settings));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                state.running = false;
                return Err(Error::Other(format!("Failed to spawn recognition thread: {}", e)));
            }
        };
        drop(state);
        *worker = Some(handle);

        log::info!("Recognition started (run {})", generation);
        Ok(())
    }

    /// Run `f` while no loop runs and none can start: `start` blocks until
    /// `f` returns. Fails with `RecognitionActive` if a loop is running.
    pub fn while_idle<T>(&self, f: impl FnOnce() -> Result<T, Error>) -> Result<T, Error> {
        let mut worker = self.worker();
        if self.is_running() {
            return Err(Error::RecognitionActive);
        }
        if let Some(previous) = worker.take() {
            join_worker(previous);
        }
        f()
    }

    /// Ask the loop to stop and clear pending results. Returns immediately;
    /// the loop finishes its current iteration and releases the source.
    pub fn stop(&self) -> Result<(), Error> {
        let mut state = self.shared.state();
        if !state.running {
            return Err(Error::NotRunning);
        }
        state.running = false;
        self.shared.results.clear();

        log::info!("Recognition stop requested (run {})", state.generation);
        Ok(())
    }

    /// Wait for the most recently started loop thread to finish
    pub fn join(&self) {
        let handle = self.worker().take();
        if let Some(handle) = handle {
            join_worker(handle);
        }
    }
}

impl Drop for RecognitionController {
    fn drop(&mut self) {
        self.shared.state().running = false;
    }
}

fn join_worker(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        log::error!("Recognition thread panicked");
    }
}

fn run_worker(shared: &Shared, generation: u64, backend: &dyn Backend, settings: LoopSettings) {
    let _exit = ExitGuard { shared, generation };

    let source = match backend.open_source() {
        Ok(source) => source,
        Err(e) => {
            log::error!("Failed to open capture source: {}", e);
            return;
        }
    };
    let extractor = match backend.load_extractor() {
        Ok(extractor) => extractor,
        Err(e) => {
            log::error!("Failed to load face models: {}", e);
            return;
        }
    };
    let gallery = Gallery::load_or_empty(&settings.gallery_path);

    RecognitionLoop::new(source, extractor, gallery, settings)
        .run(&shared.results, || shared.is_current(generation));
}
