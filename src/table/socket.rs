//! Record Socket - one-shot write capability bound to a single record

use super::document::PendingAction;
use super::store::{lock_ignoring_poison, TableShared};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{error, info};

/// Write-once handle to the row reserved by [`ResultTable::register`].
///
/// Exactly one [`write`](Self::write) or [`discard`](Self::discard) may
/// succeed; every later call fails with [`Error::DoubleWrite`]. Both persist
/// synchronously under the table lock.
///
/// Once the table has a crash handler, a socket dropped while its thread
/// unwinds from a panic discards its reservation (filled rows excepted).
///
/// [`ResultTable::register`]: super::ResultTable::register
pub struct RecordSocket {
    shared: Arc<TableShared>,
    slot: usize,
    run_id: u64,
    name: String,
    category: String,
    metrics: Vec<String>,
    written: OnceLock<BTreeMap<String, f64>>,
}

impl RecordSocket {
    pub(crate) fn new(
        shared: Arc<TableShared>,
        slot: usize,
        run_id: u64,
        name: String,
        category: String,
        metrics: Vec<String>,
    ) -> Self {
        Self {
            shared,
            slot,
            run_id,
            name,
            category,
            metrics,
            written: OnceLock::new(),
        }
    }

    /// Run id of the bound record.
    #[must_use]
    pub const fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Category of the bound record.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Metric names a write must provide.
    #[must_use]
    pub fn metrics(&self) -> &[String] {
        &self.metrics
    }

    /// Whether the socket still accepts its terminal action.
    #[must_use]
    pub fn is_active(&self) -> bool {
        lock_ignoring_poison(&self.shared.context)
            .active
            .contains_key(&self.slot)
    }

    /// Commit the final metrics of the run.
    ///
    /// The key set must equal the table's metric names exactly. On success
    /// the record is filled and the socket is dead.
    ///
    /// # Errors
    ///
    /// * [`Error::DoubleWrite`] if the socket was already used or swept
    /// * [`Error::MetricMismatch`] if the key set differs from the schema
    /// * [`Error::Serialization`] for non-finite values
    /// * a lock/IO error; the socket stays active and may be retried
    pub fn write<I, K>(&self, metrics: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let values: BTreeMap<String, f64> =
            metrics.into_iter().map(|(k, v)| (k.into(), v)).collect();

        let mut ctx = lock_ignoring_poison(&self.shared.context);
        let Some(reserved) = ctx.active.get(&self.slot) else {
            return Err(Error::DoubleWrite {
                run_id: self.run_id,
            });
        };

        if values.len() != self.metrics.len()
            || !self.metrics.iter().all(|m| values.contains_key(m))
        {
            return Err(Error::MetricMismatch {
                expected: self.metrics.clone(),
                actual: values.keys().cloned().collect(),
            });
        }
        if let Some((name, value)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(Error::Serialization(format!(
                "metric {name} = {value} cannot be stored"
            )));
        }

        let mut modification = reserved.clone();
        modification.action = PendingAction::Commit;
        modification.record.fill(&values);
        self.shared.critical(|doc| {
            doc.apply(&modification);
            Ok(((), true))
        })?;

        ctx.active.remove(&self.slot);
        let _ = self.written.set(values);
        info!(run_id = self.run_id, category = %self.category, "Record written");
        Ok(())
    }

    /// Give up the reservation.
    ///
    /// A freshly created or abandoned (unfilled) row is removed; a filled row
    /// reserved for an update is restored to its committed state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DoubleWrite`] if the socket was already used, or a
    /// lock/IO error.
    pub fn discard(&self) -> Result<()> {
        let mut ctx = lock_ignoring_poison(&self.shared.context);
        let Some(reserved) = ctx.active.get(&self.slot) else {
            return Err(Error::DoubleWrite {
                run_id: self.run_id,
            });
        };

        let mut modification = reserved.clone();
        modification.action = PendingAction::Discard;
        self.shared.critical(|doc| {
            doc.apply(&modification);
            Ok(((), true))
        })?;

        ctx.active.remove(&self.slot);
        info!(run_id = self.run_id, category = %self.category, "Record discarded");
        Ok(())
    }
}

impl Drop for RecordSocket {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        let Some(mut ctx) = self.shared.context_for_panic() else {
            return;
        };
        if !ctx.discard_on_unwind || !ctx.active.contains_key(&self.slot) {
            return;
        }
        match self.shared.sweep_slots(&mut ctx, &[self.slot]) {
            Ok(_) => info!(run_id = self.run_id, "Reservation discarded during unwind"),
            Err(e) => error!(run_id = self.run_id, error = %e, "Failed to discard reservation"),
        }
    }
}

impl fmt::Debug for RecordSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSocket")
            .field("run_id", &self.run_id)
            .field("category", &self.category)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for RecordSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ctx = lock_ignoring_poison(&self.shared.context);
        let reserved = ctx.active.get(&self.slot).map(|m| &m.record);
        let header = format!("{}<RecordSocket>", self.name);
        writeln!(f, "{header}")?;
        let mut width = header.len();
        for metric in &self.metrics {
            let value = match reserved {
                Some(record) => record.metric(metric),
                None => self.written.get().and_then(|w| w.get(metric).copied()),
            };
            let line = match value {
                Some(value) => format!("\t{metric}: {value}"),
                None => format!("\t{metric}: None"),
            };
            width = width.max(line.len());
            writeln!(f, "{line}")?;
        }
        write!(f, "{}", "-".repeat(width))
    }
}

#[cfg(test)]
mod tests {
    use super::lock_ignoring_poison;
    use crate::lock::LockPolicy;
    use crate::table::{Hyperparameters, RecordStatus, ResultTable, TableBuilder};
    use crate::Error;
    use std::path::Path;
    use std::time::Duration;

    fn table(dir: &Path) -> ResultTable {
        TableBuilder::new(["loss", "accuracy"], dir.join("rtable.json"))
            .lock_policy(
                LockPolicy::new()
                    .max_attempts(50)
                    .base_delay(Duration::from_millis(1))
                    .jitter(Duration::from_millis(3)),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_write_fills_record() {
        let dir = tempfile::tempdir().unwrap();
        let t = table(dir.path());
        let socket = t
            .register("exp1", "cfg.yaml", None, &Hyperparameters::new())
            .unwrap();

        socket.write([("loss", 0.5), ("accuracy", 0.9)]).unwrap();
        assert!(!socket.is_active());

        let (_, row) = t.record(socket.run_id()).unwrap().unwrap();
        assert!(row.is_filled());
        assert_eq!(row.status(), RecordStatus::Filled);
        assert_eq!(row.metric("loss"), Some(0.5));
    }

    #[test]
    fn test_second_write_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let t = table(dir.path());
        let socket = t
            .register("exp1", "cfg.yaml", None, &Hyperparameters::new())
            .unwrap();
        socket.write([("loss", 0.5), ("accuracy", 0.9)]).unwrap();

        let err = socket.write([("loss", 0.1), ("accuracy", 0.1)]).unwrap_err();
        assert!(matches!(err, Error::DoubleWrite { run_id: 1 }));
        assert!(matches!(socket.discard(), Err(Error::DoubleWrite { .. })));

        let (_, row) = t.record(1).unwrap().unwrap();
        assert_eq!(row.metric("loss"), Some(0.5));
    }

    #[test]
    fn test_partial_metrics_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let t = table(dir.path());
        let socket = t
            .register("exp1", "cfg.yaml", None, &Hyperparameters::new())
            .unwrap();

        match socket.write([("loss", 0.4)]) {
            Err(Error::MetricMismatch { expected, actual }) => {
                assert_eq!(expected, vec!["loss", "accuracy"]);
                assert_eq!(actual, vec!["loss"]);
            }
            other => panic!("expected MetricMismatch, got {other:?}"),
        }
        assert!(socket.is_active());
        let (_, row) = t.record(1).unwrap().unwrap();
        assert!(!row.is_filled());
    }

    #[test]
    fn test_extra_metric_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let t = table(dir.path());
        let socket = t
            .register("exp1", "cfg.yaml", None, &Hyperparameters::new())
            .unwrap();
        let err = socket
            .write([("loss", 0.4), ("accuracy", 0.8), ("f1", 0.7)])
            .unwrap_err();
        assert!(matches!(err, Error::MetricMismatch { .. }));
    }

    #[test]
    fn test_non_finite_metric_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let t = table(dir.path());
        let socket = t
            .register("exp1", "cfg.yaml", None, &Hyperparameters::new())
            .unwrap();
        let err = socket
            .write([("loss", f64::NAN), ("accuracy", 0.8)])
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(socket.is_active());
        assert!(!t.shared().lock.is_held());
    }

    #[test]
    fn test_discard_removes_created_row() {
        let dir = tempfile::tempdir().unwrap();
        let t = table(dir.path());
        let socket = t
            .register("exp1", "cfg.yaml", None, &Hyperparameters::new())
            .unwrap();
        socket.discard().unwrap();

        assert!(t.record(1).unwrap().is_none());
        assert!(matches!(socket.discard(), Err(Error::DoubleWrite { .. })));

        let next = t
            .register("exp2", "cfg.yaml", None, &Hyperparameters::new())
            .unwrap();
        assert_eq!(next.run_id(), 2);
    }

    #[test]
    fn test_display_lists_metric_slots() {
        let dir = tempfile::tempdir().unwrap();
        let t = table(dir.path());
        let socket = t
            .register("exp1", "cfg.yaml", None, &Hyperparameters::new())
            .unwrap();
        let text = socket.to_string();
        assert!(text.starts_with("exp1<RecordSocket>"));
        assert!(text.contains("\tloss: None"));
        assert!(text.contains("\taccuracy: None"));

        socket.write([("loss", 0.5), ("accuracy", 0.9)]).unwrap();
        assert!(socket.to_string().contains("\tloss: 0.5"));
    }

    #[test]
    fn test_terminal_sockets_leave_the_run_context() {
        let dir = tempfile::tempdir().unwrap();
        let t = table(dir.path());
        for i in 0..5 {
            let socket = t
                .register(&format!("exp{i}"), "cfg.yaml", None, &Hyperparameters::new())
                .unwrap();
            if i % 2 == 0 {
                socket.write([("loss", 0.5), ("accuracy", 0.9)]).unwrap();
            } else {
                socket.discard().unwrap();
            }
        }
        assert_eq!(t.active_sockets(), 0);
        assert!(lock_ignoring_poison(&t.shared().context).active.is_empty());
    }
}
