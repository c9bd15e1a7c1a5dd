//! Result Table - shared, write-once experiment result store
//!
//! Every mutating operation is one short critical section:
//! acquire the sentinel lock, load the latest document, merge, write it
//! back atomically, release. Nothing is decided against a cached copy.

use super::document::{PendingAction, PendingModification, TableDocument, DEFAULT_CATEGORY};
use super::{Hyperparameters, Record, RecordSocket, RecordStatus};
use crate::lock::{FileLock, LockPolicy};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Panic hook signature accepted and returned by [`ResultTable::crash_handler`].
pub type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

/// How long a panic path waits for the reservation map before giving up.
const CONTEXT_WAIT: Duration = Duration::from_secs(1);

/// Active reservations made through one [`ResultTable`] value (and its
/// clones), keyed by socket slot.
///
/// This is the state the crash sweep works from; two tables opened on the
/// same file behave like two independent processes. Slots leave the map as
/// soon as their socket is written, discarded or swept.
#[derive(Debug, Default)]
pub(crate) struct RunContext {
    next_slot: usize,
    pub(crate) active: BTreeMap<usize, PendingModification>,
    /// Set once a crash handler exists; sockets dropped by a panic then
    /// discard their own reservation.
    pub(crate) discard_on_unwind: bool,
}

impl RunContext {
    fn reserve(&mut self, modification: PendingModification) -> usize {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.active.insert(slot, modification);
        slot
    }
}

#[derive(Debug)]
pub(crate) struct TableShared {
    pub(crate) path: PathBuf,
    pub(crate) lock: FileLock,
    snapshot: Mutex<TableDocument>,
    pub(crate) context: Mutex<RunContext>,
}

impl TableShared {
    /// Run `mutate` against a freshly loaded document under the lock.
    ///
    /// `mutate` returns its output and whether the document changed; an
    /// unchanged document is not rewritten. The lock guard is dropped on
    /// every error path, so failures never orphan the sentinel.
    pub(crate) fn critical<T>(
        &self,
        mutate: impl FnOnce(&mut TableDocument) -> Result<(T, bool)>,
    ) -> Result<T> {
        let guard = self.lock.acquire()?;
        let mut doc = TableDocument::read(&self.path)?;
        let (out, dirty) = mutate(&mut doc)?;
        if dirty {
            doc.write_atomic(&self.path)?;
        }
        guard.release();
        *lock_ignoring_poison(&self.snapshot) = doc;
        Ok(out)
    }

    /// Non-locking load: waits for the sentinel to disappear, then reads.
    pub(crate) fn load_unlocked(&self) -> Result<TableDocument> {
        self.lock.peek()?;
        let doc = TableDocument::read(&self.path)?;
        *lock_ignoring_poison(&self.snapshot) = doc.clone();
        Ok(doc)
    }

    pub(crate) fn snapshot(&self) -> MutexGuard<'_, TableDocument> {
        lock_ignoring_poison(&self.snapshot)
    }

    /// Discard the given reservations whose rows are not filled on disk and
    /// drop them from `ctx`. Reservations on filled rows stay active.
    pub(crate) fn sweep_slots(&self, ctx: &mut RunContext, slots: &[usize]) -> Result<usize> {
        if !slots.iter().any(|slot| ctx.active.contains_key(slot)) {
            return Ok(0);
        }

        let swept = self.critical(|doc| {
            let mut swept = Vec::new();
            for slot in slots {
                let Some(m) = ctx.active.get(slot) else {
                    continue;
                };
                match doc.find(&m.category, m.run_id()) {
                    Some(row) if row.is_filled() => {}
                    Some(_) => {
                        let mut discard = m.clone();
                        discard.action = PendingAction::Discard;
                        doc.apply(&discard);
                        swept.push((*slot, true));
                    }
                    None => swept.push((*slot, false)),
                }
            }
            let dirty = swept.iter().any(|(_, removed)| *removed);
            Ok((swept, dirty))
        })?;

        let mut discarded = 0;
        for (slot, removed) in swept {
            ctx.active.remove(&slot);
            if removed {
                discarded += 1;
            }
        }
        if discarded > 0 {
            warn!(discarded, path = %self.path.display(), "Swept unfilled reservations");
        }
        Ok(discarded)
    }

    /// Lock the reservation map from a panic path.
    ///
    /// The panicking thread may itself hold the map, so this gives up after
    /// [`CONTEXT_WAIT`] instead of blocking forever.
    pub(crate) fn context_for_panic(&self) -> Option<MutexGuard<'_, RunContext>> {
        let deadline = Instant::now() + CONTEXT_WAIT;
        loop {
            match self.context.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(TryLockError::WouldBlock) => return None,
            }
        }
    }
}

/// Whether the current panic ends the process: always when panics abort,
/// otherwise when it happens on the main thread.
fn panic_is_fatal() -> bool {
    cfg!(panic = "abort") || std::thread::current().name() == Some("main")
}

/// Recover poisoned guards; the crash sweep runs inside a panic hook.
pub(crate) fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a result table file.
///
/// Results are stored once and never silently overwritten. Experiments are
/// identified by `(name, config, hyperparameter fingerprint)`; registering
/// an already filled experiment fails unless the table allows updates.
///
/// Cloning is cheap and shares the reservations of this handle, which is
/// how the crash handler knows which rows it is responsible for.
///
/// ## Example
///
/// ```rust,no_run
/// use result_table::{Hyperparameters, ResultTable};
///
/// let table = ResultTable::open("results/resultTable.json")?;
/// table.install_crash_handler();
///
/// let hyper = Hyperparameters::new().with("lr", 0.01);
/// let socket = table.register("experiment1", "config.yaml", Some("CNN"), &hyper)?;
///
/// // ... train ...
///
/// socket.write([("crossEntropy", 0.42), ("accuracy", 0.91)])?;
/// table.to_text("results/CompiledResults.txt")?;
/// # Ok::<(), result_table::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct ResultTable {
    shared: Arc<TableShared>,
}

impl ResultTable {
    /// Open an existing table with the default lock policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, malformed, or stays locked.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, LockPolicy::default())
    }

    /// Open an existing table with a custom lock policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, malformed, or stays locked.
    pub fn open_with(path: impl AsRef<Path>, policy: LockPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock = FileLock::new(&path, policy);
        lock.peek()?;
        let doc = TableDocument::read(&path)?;
        Ok(Self {
            shared: Arc::new(TableShared {
                path,
                lock,
                snapshot: Mutex::new(doc),
                context: Mutex::new(RunContext::default()),
            }),
        })
    }

    /// Location of the table file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Table name (file name at build time).
    #[must_use]
    pub fn name(&self) -> String {
        self.shared.snapshot().metadata.name.clone()
    }

    /// Metric names every write must provide, in declaration order.
    #[must_use]
    pub fn metrics(&self) -> Vec<String> {
        self.shared.snapshot().metrics.clone()
    }

    /// Categories as of the last load.
    #[must_use]
    pub fn categories(&self) -> Vec<String> {
        self.shared.snapshot().records.keys().cloned().collect()
    }

    /// Whether filled records may be re-registered for an update.
    #[must_use]
    pub fn allow_update(&self) -> bool {
        self.shared.snapshot().metadata.allow_update
    }

    /// Decimals kept by the text report.
    #[must_use]
    pub fn round_decimal(&self) -> usize {
        self.shared.snapshot().preferences.round_decimal
    }

    /// Reload the in-memory snapshot without taking the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or stays locked.
    pub fn refresh(&self) -> Result<()> {
        self.shared.load_unlocked().map(|_| ())
    }

    /// Look up a record by run id in a fresh, non-locking load.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or stays locked.
    pub fn record(&self, run_id: u64) -> Result<Option<(String, Record)>> {
        let doc = self.shared.load_unlocked()?;
        Ok(doc.records.iter().find_map(|(category, rows)| {
            rows.iter()
                .find(|r| r.run_id() == run_id)
                .map(|r| (category.clone(), r.clone()))
        }))
    }

    /// Add a category.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CategoryExists`] if the name is taken, or a lock/IO
    /// error.
    pub fn add_category(&self, name: &str) -> Result<()> {
        self.shared.critical(|doc| {
            if doc.records.contains_key(name) {
                return Err(Error::CategoryExists(name.to_string()));
            }
            doc.records.insert(name.to_string(), Vec::new());
            Ok(((), true))
        })?;
        info!(category = name, "Category added");
        Ok(())
    }

    /// Reserve a row for an experiment and return the socket to fill it.
    ///
    /// The reservation is persisted before returning so other processes see
    /// it immediately.
    ///
    /// * An unseen `(name, config, hyperparameters)` triple gets a new run id.
    /// * An unfilled matching row (abandoned earlier) is reused.
    /// * A filled matching row fails with [`Error::DuplicateExperiment`],
    ///   or is reused for an update when the table allows it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCategory`], [`Error::DuplicateExperiment`],
    /// or a lock/IO error.
    pub fn register(
        &self,
        name: &str,
        config: &str,
        category: Option<&str>,
        hyperparameters: &Hyperparameters,
    ) -> Result<RecordSocket> {
        let fingerprint = hyperparameters.fingerprint();
        let modification = self.shared.critical(|doc| {
            let category = match category {
                Some(c) if !doc.records.contains_key(c) => {
                    return Err(Error::InvalidCategory(c.to_string()));
                }
                Some(c) => c.to_string(),
                None => DEFAULT_CATEGORY.to_string(),
            };
            let existing = doc.records.get(&category).and_then(|rows| {
                rows.iter()
                    .find(|r| r.matches(name, config, &fingerprint))
                    .cloned()
            });

            let (record, prior) = match existing {
                Some(found) if found.is_filled() => {
                    if !doc.metadata.allow_update {
                        return Err(Error::DuplicateExperiment {
                            run_id: found.run_id(),
                            name: name.to_string(),
                        });
                    }
                    let mut record = found.clone();
                    record.set_status(RecordStatus::Updating);
                    (record, Some(found))
                }
                Some(found) => {
                    let mut record = found.clone();
                    record.set_status(RecordStatus::Filling);
                    (record, Some(found))
                }
                None => {
                    let run_id = doc.allocate_run_id();
                    let record =
                        Record::new(run_id, name, config, fingerprint.clone(), &doc.metrics);
                    (record, None)
                }
            };

            let modification = PendingModification {
                category,
                action: PendingAction::Commit,
                record,
                prior,
            };
            doc.apply(&modification);
            Ok((modification, true))
        })?;

        info!(
            run_id = modification.run_id(),
            category = %modification.category,
            status = %modification.record.status(),
            experiment = name,
            "Record registered"
        );

        let metrics = self.metrics();
        let run_id = modification.run_id();
        let category = modification.category.clone();
        let slot = lock_ignoring_poison(&self.shared.context).reserve(modification);
        Ok(RecordSocket::new(
            Arc::clone(&self.shared),
            slot,
            run_id,
            name.to_string(),
            category,
            metrics,
        ))
    }

    /// Number of sockets from this handle that are still active.
    #[must_use]
    pub fn active_sockets(&self) -> usize {
        lock_ignoring_poison(&self.shared.context).active.len()
    }

    /// Discard every still-active reservation of this handle whose row is
    /// not filled on disk. Filled rows are never touched.
    ///
    /// Returns the number of reservations discarded; calling it again is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns a lock/IO error; in that case no socket is deactivated.
    pub fn sweep(&self) -> Result<usize> {
        let mut ctx = lock_ignoring_poison(&self.shared.context);
        let slots: Vec<usize> = ctx.active.keys().copied().collect();
        self.shared.sweep_slots(&mut ctx, &slots)
    }

    /// Wrap `previous` so that a panic that ends the process first sweeps
    /// this handle's unfilled reservations and then runs `previous`.
    ///
    /// A panic hook runs before anyone knows whether the panic will be
    /// caught. The sweep therefore only fires when panics abort or when the
    /// panic is on the main thread; a worker thread that panics (and may be
    /// joined and recovered from) leaves other reservations alone. Instead,
    /// once a handler exists, each socket dropped while its thread unwinds
    /// discards its own reservation. A panic caught with `catch_unwind` on
    /// the main thread still sweeps.
    #[must_use]
    pub fn crash_handler(&self, previous: PanicHook) -> PanicHook {
        lock_ignoring_poison(&self.shared.context).discard_on_unwind = true;
        let table = self.clone();
        Box::new(move |info: &PanicHookInfo<'_>| {
            if panic_is_fatal() {
                table.sweep_on_panic();
            }
            previous(info);
        })
    }

    /// Install [`ResultTable::crash_handler`] around the current panic hook.
    pub fn install_crash_handler(&self) {
        let previous = std::panic::take_hook();
        std::panic::set_hook(self.crash_handler(previous));
    }

    fn sweep_on_panic(&self) {
        let Some(mut ctx) = self.shared.context_for_panic() else {
            error!(path = %self.path().display(), "Crash sweep skipped: reservations busy");
            return;
        };
        let slots: Vec<usize> = ctx.active.keys().copied().collect();
        if let Err(e) = self.shared.sweep_slots(&mut ctx, &slots) {
            error!(error = %e, path = %self.path().display(), "Crash sweep failed");
        }
    }

    pub(crate) fn shared(&self) -> &TableShared {
        &self.shared
    }
}
