//! Single-writer transaction worker.
//!
//! Every read-consistent and mutating operation of the store runs as a unit
//! of work on one dedicated writer thread. The engine itself tolerates
//! concurrent transactions, but the accounting couples every mutation to
//! the shared global quota row; funnelling units through a single thread
//! linearizes them and rules out lost updates without per-row locking.
//!
//! Units are submitted over an unbounded channel and answer on a oneshot;
//! the returned [`UnitHandle`] supports both a blocking wait and an async
//! join. Submitters on one thread observe their units executing in
//! submission order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::calculator::TilePageCalculator;
use crate::error::StoreError;

/// Shared state units of work execute against.
pub(crate) struct StoreResources {
    pub(crate) db: Arc<redb::Database>,
    pub(crate) calculator: Arc<dyn TilePageCalculator>,
}

type Unit = Box<dyn FnOnce(&StoreResources) + Send + 'static>;

enum WorkerMessage {
    Run(Unit),
    Shutdown(std_mpsc::Sender<()>),
}

/// Handle to a submitted unit of work.
///
/// The unit keeps running even if the handle is dropped; abandoning the
/// handle only discards the result, it never tears a transaction mid-flight.
pub struct UnitHandle<T> {
    rx: oneshot::Receiver<Result<T, StoreError>>,
}

impl<T> UnitHandle<T> {
    fn new(rx: oneshot::Receiver<Result<T, StoreError>>) -> Self {
        Self { rx }
    }

    /// Block the calling thread until the unit commits or aborts.
    ///
    /// Must not be called from an async context; use [`UnitHandle::join`]
    /// there instead.
    pub fn wait(self) -> Result<T, StoreError> {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(StoreError::Interrupted))
    }

    /// Await the unit's completion.
    pub async fn join(self) -> Result<T, StoreError> {
        self.rx.await.unwrap_or_else(|_| Err(StoreError::Interrupted))
    }
}

/// The dedicated writer thread and its submission queue.
pub(crate) struct TransactionWorker {
    sender: mpsc::UnboundedSender<WorkerMessage>,
    open: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    drain_deadline: Duration,
}

impl TransactionWorker {
    /// Spawn the writer thread.
    pub(crate) fn spawn(
        resources: StoreResources,
        drain_deadline: Duration,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new()
            .name("quota-store-writer".to_string())
            .spawn(move || run_loop(receiver, resources))?;

        Ok(Self {
            sender,
            open: AtomicBool::new(true),
            thread: Mutex::new(Some(thread)),
            drain_deadline,
        })
    }

    /// Enqueue a unit of work.
    ///
    /// Units submitted after [`TransactionWorker::close`] resolve to
    /// [`StoreError::Closed`] without touching the queue.
    pub(crate) fn submit<T, F>(&self, unit: F) -> UnitHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&StoreResources) -> Result<T, StoreError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        if !self.open.load(Ordering::SeqCst) {
            let _ = tx.send(Err(StoreError::Closed));
            return UnitHandle::new(rx);
        }

        let run: Unit = Box::new(move |resources| {
            let _ = tx.send(unit(resources));
        });
        if self.sender.send(WorkerMessage::Run(run)).is_err() {
            // Writer already terminated; the receiver observes a severed
            // channel and the waiter gets Interrupted.
            debug!("Unit submitted while the quota store writer was terminating");
        }

        UnitHandle::new(rx)
    }

    /// Enqueue a unit of work and block until it completes.
    pub(crate) fn submit_and_wait<T, F>(&self, unit: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&StoreResources) -> Result<T, StoreError> + Send + 'static,
    {
        self.submit(unit).wait()
    }

    /// Stop accepting units and drain the queue.
    ///
    /// Queued units run to completion before the writer exits. If the drain
    /// exceeds the deadline the store is closed as is; the writer keeps
    /// draining detached and releases the engine when it finishes.
    pub(crate) fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        let (ack, drained) = std_mpsc::channel();
        if self.sender.send(WorkerMessage::Shutdown(ack)).is_err() {
            return;
        }

        match drained.recv_timeout(self.drain_deadline) {
            Ok(()) => {
                if let Ok(mut slot) = self.thread.lock() {
                    if let Some(handle) = slot.take() {
                        let _ = handle.join();
                    }
                }
                debug!("Quota store writer drained");
            }
            Err(_) => {
                error!(
                    deadline_secs = self.drain_deadline.as_secs(),
                    "Timed out draining the quota store writer, closing the store as is"
                );
            }
        }
    }
}

fn run_loop(mut receiver: mpsc::UnboundedReceiver<WorkerMessage>, resources: StoreResources) {
    while let Some(message) = receiver.blocking_recv() {
        match message {
            WorkerMessage::Run(unit) => unit(&resources),
            WorkerMessage::Shutdown(ack) => {
                let _ = ack.send(());
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::GridRect;
    use crate::page::TilePage;
    use crate::tileset::TileSet;
    use num_bigint::BigUint;
    use std::collections::HashSet;
    use tempfile::TempDir;

    struct NullCalculator;

    impl TilePageCalculator for NullCalculator {
        fn layer_names(&self) -> HashSet<String> {
            HashSet::new()
        }

        fn tile_sets_for(&self, _layer_name: &str) -> HashSet<TileSet> {
            HashSet::new()
        }

        fn tiles_per_page(&self, _tile_set: &TileSet, _zoom_level: u8) -> BigUint {
            BigUint::from(1u32)
        }

        fn to_grid_coverage(&self, _tile_set: &TileSet, _page: &TilePage) -> Vec<GridRect> {
            Vec::new()
        }
    }

    fn test_worker(dir: &TempDir) -> TransactionWorker {
        let db = Arc::new(redb::Database::create(dir.path().join("worker.redb")).unwrap());
        let resources = StoreResources {
            db,
            calculator: Arc::new(NullCalculator),
        };
        TransactionWorker::spawn(resources, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn units_execute_in_submission_order() {
        let dir = TempDir::new().unwrap();
        let worker = test_worker(&dir);

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..10u32 {
            let log = Arc::clone(&log);
            handles.push(worker.submit(move |_| {
                log.lock().unwrap().push(i);
                Ok(i)
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait().unwrap(), i as u32);
        }
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<u32>>());

        worker.close();
    }

    #[test]
    fn close_rejects_new_units() {
        let dir = TempDir::new().unwrap();
        let worker = test_worker(&dir);
        worker.close();

        let result = worker.submit(|_| Ok(())).wait();
        assert!(matches!(result, Err(StoreError::Closed)));
    }

    #[test]
    fn close_drains_queued_units() {
        let dir = TempDir::new().unwrap();
        let worker = test_worker(&dir);

        let handle = worker.submit(|_| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(7u32)
        });
        worker.close();

        assert_eq!(handle.wait().unwrap(), 7);
    }

    #[test]
    fn close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let worker = test_worker(&dir);
        worker.close();
        worker.close();
    }

    #[tokio::test]
    async fn join_resolves_asynchronously() {
        let dir = TempDir::new().unwrap();
        let worker = test_worker(&dir);

        let handle = worker.submit(|_| Ok("done".to_string()));
        assert_eq!(handle.join().await.unwrap(), "done");

        worker.close();
    }

    #[test]
    fn errors_propagate_to_the_waiter() {
        let dir = TempDir::new().unwrap();
        let worker = test_worker(&dir);

        let result: Result<(), StoreError> = worker
            .submit(|_| Err(StoreError::NoSuchLayer("roads".to_string())))
            .wait();
        assert!(matches!(result, Err(StoreError::NoSuchLayer(_))));

        worker.close();
    }
}
