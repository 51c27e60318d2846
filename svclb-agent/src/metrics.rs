use std::sync::{LazyLock, RwLock};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::{Registry, Unit};

use crate::{Error, Result};

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("svclb")));

#[derive(Clone)]
pub struct SyncMetrics {
    pub runs: Counter,
    pub failures: Family<ErrorLabels, Counter>,
    pub writes: Family<WriteLabels, Counter>,
    pub frontends: Gauge,
    pub backends: Gauge,
    pub duration: Histogram,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub error: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WriteLabels {
    pub operation: String,
    pub status: String,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self {
            runs: Counter::default(),
            failures: Family::<ErrorLabels, Counter>::default(),
            writes: Family::<WriteLabels, Counter>::default(),
            frontends: Gauge::default(),
            backends: Gauge::default(),
            duration: Histogram::new([0.001, 0.01, 0.1, 0.25, 0.5, 1.0, 5.0].into_iter()),
        }
    }
}

impl SyncMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "sync_duration",
            "duration of one services file sync",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register("sync_runs", "Number of services file syncs", self.runs.clone());
        r.register(
            "sync_failures",
            "Number of services file syncs that failed",
            self.failures.clone(),
        );
        r.register(
            "service_writes",
            "Number of service updates and removals written to the bpf maps",
            self.writes.clone(),
        );
        r.register(
            "frontends",
            "Number of programmed service frontends",
            self.frontends.clone(),
        );
        r.register(
            "backends",
            "Number of programmed backend records",
            self.backends.clone(),
        );
        self
    }

    /// Registers with the process wide registry.
    pub fn register_global(self) -> Result<Self> {
        let mut registry = REGISTRY
            .write()
            .map_err(|_| Error::Other("metrics registry lock poisoned".into()))?;
        Ok(self.register(&mut registry))
    }

    pub fn write(&self, operation: &str, ok: bool) {
        self.writes
            .get_or_create(&WriteLabels {
                operation: operation.into(),
                status: if ok { "ok" } else { "error" }.into(),
            })
            .inc();
    }

    pub fn failure(&self, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                error: e.metric_label(),
            })
            .inc();
    }
}
