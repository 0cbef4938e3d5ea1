//! Prometheus gauges for data store memory and address space
//!
//! Each [`DataStoreMetrics`] owns its registry, so several stores can be
//! exported side by side under different prefixes.

use crate::datastore::{AddressSpace, DataStoreReader, MemoryStats};
use crate::error::{Error, Result};
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::debug;

pub struct DataStoreMetrics {
    registry: Registry,
    bytes: IntGaugeVec,
    elems: IntGaugeVec,
    buffers: IntGaugeVec,
    address_space: IntGaugeVec,
    compactions: IntGauge,
}

impl DataStoreMetrics {
    /// Create gauges named `<prefix>_datastore_*`
    pub fn new(prefix: &str) -> Result<Self> {
        let registry = Registry::new();
        let bytes = IntGaugeVec::new(
            Opts::new(format!("{}_datastore_bytes", prefix), "Data store memory in bytes"),
            &["kind"],
        )
        .map_err(metrics_error)?;
        let elems = IntGaugeVec::new(
            Opts::new(format!("{}_datastore_elements", prefix), "Data store element counts"),
            &["kind"],
        )
        .map_err(metrics_error)?;
        let buffers = IntGaugeVec::new(
            Opts::new(format!("{}_datastore_buffers", prefix), "Data store buffers by status"),
            &["status"],
        )
        .map_err(metrics_error)?;
        let address_space = IntGaugeVec::new(
            Opts::new(
                format!("{}_datastore_address_space_arrays", prefix),
                "Data store address space in arrays",
            ),
            &["kind"],
        )
        .map_err(metrics_error)?;
        let compactions = IntGauge::new(
            format!("{}_datastore_compactions", prefix),
            "Buffers marked for compaction so far",
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(bytes.clone())).map_err(metrics_error)?;
        registry.register(Box::new(elems.clone())).map_err(metrics_error)?;
        registry.register(Box::new(buffers.clone())).map_err(metrics_error)?;
        registry
            .register(Box::new(address_space.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(compactions.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            bytes,
            elems,
            buffers,
            address_space,
            compactions,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Sample a store through its reader
    pub fn observe_reader(&self, reader: &DataStoreReader) {
        self.observe(
            &reader.mem_stats(),
            &reader.address_space_usage(),
            reader.compaction_count(),
        );
    }

    pub fn observe(&self, stats: &MemoryStats, space: &AddressSpace, compaction_count: u64) {
        for (kind, value) in [
            ("allocated", stats.alloc_bytes),
            ("used", stats.used_bytes),
            ("dead", stats.dead_bytes),
            ("hold", stats.hold_bytes),
        ] {
            self.bytes.with_label_values(&[kind]).set(value as i64);
        }
        for (kind, value) in [
            ("allocated", stats.alloc_elems),
            ("used", stats.used_elems),
            ("dead", stats.dead_elems),
            ("hold", stats.hold_elems),
        ] {
            self.elems.with_label_values(&[kind]).set(value as i64);
        }
        for (status, value) in [
            ("free", stats.free_buffers),
            ("active", stats.active_buffers),
            ("hold", stats.hold_buffers),
        ] {
            self.buffers.with_label_values(&[status]).set(value as i64);
        }
        for (kind, value) in [
            ("used", space.used()),
            ("dead", space.dead()),
            ("limit", space.limit()),
        ] {
            self.address_space.with_label_values(&[kind]).set(value as i64);
        }
        self.compactions.set(compaction_count as i64);
        debug!(used_bytes = stats.used_bytes, dead_bytes = stats.dead_bytes, "observed data store");
    }

    /// Registry contents in the Prometheus text format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Metrics(e.to_string()))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Metrics(e.to_string())
}
