//! Feeding the aggregation table
//!
//! Two sources, one per probe mode:
//! - events mode: per-CPU perf buffer readers classify each completion here
//! - aggregate mode: the kernel already classified and summed; we poll its
//!   cumulative counters and forward the deltas

use crate::{
    table::AggregationTable,
    types::{TransferKey, UrbCompletion},
};
use anyhow::{Context, Result};
use aya::{
    maps::{perf::AsyncPerfEventArray, HashMap as AyaHashMap, MapData},
    util::online_cpus,
};
use bytes::BytesMut;
use log::{debug, info, warn};
use std::{collections::HashMap, mem, sync::Arc};
use usb_probe_common::classify;

/// Number of perf records fetched per read
const READ_BATCH: usize = 16;

/// Decode one perf record
pub fn decode_completion(buf: &[u8]) -> Option<UrbCompletion> {
    if buf.len() < mem::size_of::<UrbCompletion>() {
        return None;
    }
    let ptr = buf.as_ptr() as *const UrbCompletion;
    // SAFETY: length checked above; UrbCompletion is plain old data
    Some(unsafe { ptr.read_unaligned() })
}

/// Classify one completion and account it
///
/// Returns true when bytes were added to the table.
pub fn account_completion(table: &AggregationTable, completion: &UrbCompletion) -> bool {
    match classify(completion) {
        Some((key, bytes)) => table.increment(key, bytes),
        None => false,
    }
}

/// Event processor that reads completions from perf buffers
pub struct EventProcessor {
    table: Arc<AggregationTable>,
    verbose: bool,
}

impl EventProcessor {
    /// Create a new event processor
    ///
    /// # Arguments
    ///
    /// * `table` - Shared aggregation table
    /// * `verbose` - Log every completion at debug level
    pub fn new(table: Arc<AggregationTable>, verbose: bool) -> Self {
        Self { table, verbose }
    }

    /// Spawn per-CPU event readers
    ///
    /// Each CPU's buffer gets its own task; all of them increment the same
    /// table concurrently.
    pub async fn spawn_cpu_readers(&self, mut perf_array: AsyncPerfEventArray<MapData>) -> Result<()> {
        let cpus = online_cpus().context("Failed to list online CPUs")?;
        info!("Spawning event readers for {} CPUs", cpus.len());

        for cpu_id in cpus {
            let mut buf = perf_array
                .open(cpu_id, None)
                .with_context(|| format!("Failed to open perf buffer for CPU {}", cpu_id))?;
            let table = Arc::clone(&self.table);
            let verbose = self.verbose;

            tokio::spawn(async move {
                let mut buffers = (0..READ_BATCH)
                    .map(|_| BytesMut::with_capacity(mem::size_of::<UrbCompletion>()))
                    .collect::<Vec<_>>();

                loop {
                    let events = match buf.read_events(&mut buffers).await {
                        Ok(events) => events,
                        Err(e) => {
                            warn!("Event reader for CPU {} stopped: {}", cpu_id, e);
                            break;
                        }
                    };

                    if events.lost > 0 {
                        warn!("CPU {}: {} completions lost (perf buffer full)", cpu_id, events.lost);
                    }

                    for record in buffers.iter_mut().take(events.read) {
                        let Some(completion) = decode_completion(record) else {
                            warn!("CPU {}: short perf record ({} bytes)", cpu_id, record.len());
                            continue;
                        };

                        if verbose {
                            debug!(
                                "URB {}.{} [{:04x}:{:04x}] ep 0x{:02x} attr 0x{:02x}: {} bytes",
                                completion.bus,
                                completion.device,
                                completion.vendor,
                                completion.product,
                                completion.endpoint_address,
                                completion.attributes,
                                completion.actual_length
                            );
                        }

                        account_completion(&table, &completion);
                    }
                }
            });
        }

        Ok(())
    }
}

/// Something that yields cumulative per-key byte counters
pub trait CounterSource {
    fn read_counters(&mut self) -> Result<Vec<(TransferKey, u64)>>;
}

/// The kernel's USB_STATS map
pub struct KernelCounters {
    map: AyaHashMap<MapData, TransferKey, u64>,
}

impl KernelCounters {
    pub fn new(map: AyaHashMap<MapData, TransferKey, u64>) -> Self {
        Self { map }
    }
}

impl CounterSource for KernelCounters {
    fn read_counters(&mut self) -> Result<Vec<(TransferKey, u64)>> {
        self.map
            .iter()
            .map(|entry| entry.context("Failed to read USB_STATS entry"))
            .collect()
    }
}

/// Turns cumulative counters into per-poll deltas
#[derive(Debug, Default)]
pub struct DeltaTracker {
    last: HashMap<TransferKey, u64>,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute how much each counter grew since the previous call
    ///
    /// A counter below its previous value was evicted by the kernel LRU and
    /// recreated, so all of it is new. A recreated counter that has already
    /// grown past its old value is indistinguishable from plain growth and
    /// is undercounted as `value - previous`; a larger `--max-entries`
    /// makes kernel evictions rare. Keys absent from `counters` are
    /// forgotten. Only non-zero deltas are returned.
    pub fn deltas(&mut self, counters: Vec<(TransferKey, u64)>) -> Vec<(TransferKey, u64)> {
        let mut current = HashMap::with_capacity(counters.len());
        let mut deltas = Vec::new();

        for (key, value) in counters {
            let delta = match self.last.get(&key) {
                Some(&previous) if value >= previous => value - previous,
                _ => value,
            };
            if delta > 0 {
                deltas.push((key, delta));
            }
            current.insert(key, value);
        }

        self.last = current;
        deltas
    }

    /// Number of keys remembered from the last poll
    pub fn tracked(&self) -> usize {
        self.last.len()
    }
}

/// Polls a [`CounterSource`] and forwards deltas into the table
pub struct MapPoller<S: CounterSource> {
    source: S,
    tracker: DeltaTracker,
}

impl<S: CounterSource> MapPoller<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            tracker: DeltaTracker::new(),
        }
    }

    /// Read the source once; returns the number of bytes forwarded
    pub fn poll(&mut self, table: &AggregationTable) -> Result<u64> {
        let counters = self.source.read_counters()?;
        let mut forwarded = 0u64;

        for (key, delta) in self.tracker.deltas(counters) {
            if table.increment(key, delta) {
                forwarded += delta;
            }
        }

        Ok(forwarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransferType;

    fn key(endpoint: u8) -> TransferKey {
        TransferKey::new(1, 5, 0x1234, 0x5678, endpoint, TransferType::Bulk)
    }

    fn completion(endpoint_address: u8, attributes: u8, pipe: u32, actual_length: i32) -> UrbCompletion {
        UrbCompletion {
            bus: 1,
            device: 5,
            vendor: 0x1234,
            product: 0x5678,
            endpoint_address,
            attributes,
            _padding: [0; 2],
            pipe,
            actual_length,
        }
    }

    /// Replays a fixed sequence of cumulative readings
    struct ScriptedCounters {
        readings: Vec<Vec<(TransferKey, u64)>>,
    }

    impl CounterSource for ScriptedCounters {
        fn read_counters(&mut self) -> Result<Vec<(TransferKey, u64)>> {
            if self.readings.is_empty() {
                anyhow::bail!("no more readings");
            }
            Ok(self.readings.remove(0))
        }
    }

    #[test]
    fn test_decode_completion() {
        let original = completion(0x81, 0x02, 0x80, 512);
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &original as *const UrbCompletion as *const u8,
                mem::size_of::<UrbCompletion>(),
            )
        };

        assert_eq!(decode_completion(bytes), Some(original));
        assert_eq!(decode_completion(&bytes[..10]), None);
    }

    #[test]
    fn test_account_completion_skips_empty_transfers() {
        let table = AggregationTable::default();

        assert!(!account_completion(&table, &completion(0x81, 0x02, 0x80, 0)));
        assert!(!account_completion(&table, &completion(0x81, 0x02, 0x80, -71)));
        assert!(table.is_empty());

        assert!(account_completion(&table, &completion(0x81, 0x02, 0x80, 64)));
        assert!(account_completion(&table, &completion(0x81, 0x02, 0x80, 64)));
        assert_eq!(table.get(&key(0x81)), Some(128));
    }

    #[test]
    fn test_account_completion_splits_control_directions() {
        let table = AggregationTable::default();
        account_completion(&table, &completion(0x00, 0x00, 0x80, 8));
        account_completion(&table, &completion(0x00, 0x00, 0x00, 8));

        let control_in = TransferKey::new(1, 5, 0x1234, 0x5678, 0x80, TransferType::Control);
        let control_out = TransferKey::new(1, 5, 0x1234, 0x5678, 0x00, TransferType::Control);
        assert_eq!(table.get(&control_in), Some(8));
        assert_eq!(table.get(&control_out), Some(8));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_delta_tracker() {
        let mut tracker = DeltaTracker::new();

        assert_eq!(tracker.deltas(vec![(key(0x81), 100)]), vec![(key(0x81), 100)]);
        assert_eq!(tracker.deltas(vec![(key(0x81), 150)]), vec![(key(0x81), 50)]);
        // No growth, no delta
        assert!(tracker.deltas(vec![(key(0x81), 150)]).is_empty());
        // Evicted and recreated in the kernel
        assert_eq!(tracker.deltas(vec![(key(0x81), 20)]), vec![(key(0x81), 20)]);
    }

    #[test]
    fn test_delta_tracker_recreated_counter_above_previous() {
        let mut tracker = DeltaTracker::new();
        tracker.deltas(vec![(key(0x81), 100)]);

        // Evicted, recreated and grown to 150 between polls: only the
        // growth over the old value is visible
        assert_eq!(tracker.deltas(vec![(key(0x81), 150)]), vec![(key(0x81), 50)]);
    }

    #[test]
    fn test_delta_tracker_forgets_vanished_keys() {
        let mut tracker = DeltaTracker::new();
        tracker.deltas(vec![(key(0x81), 100), (key(0x02), 10)]);
        assert_eq!(tracker.tracked(), 2);

        tracker.deltas(vec![(key(0x81), 100)]);
        assert_eq!(tracker.tracked(), 1);

        // Reappearing key starts from scratch
        assert_eq!(tracker.deltas(vec![(key(0x02), 30)]), vec![(key(0x02), 30)]);
    }

    #[test]
    fn test_map_poller_feeds_table() {
        let source = ScriptedCounters {
            readings: vec![
                vec![(key(0x81), 64)],
                vec![(key(0x81), 128), (key(0x02), 16)],
            ],
        };
        let mut poller = MapPoller::new(source);
        let table = AggregationTable::default();

        assert_eq!(poller.poll(&table).unwrap(), 64);
        assert_eq!(poller.poll(&table).unwrap(), 80);
        assert_eq!(table.get(&key(0x81)), Some(128));
        assert_eq!(table.get(&key(0x02)), Some(16));

        assert!(poller.poll(&table).is_err());
    }

    #[tokio::test]
    async fn test_event_processor_creation() {
        let table = Arc::new(AggregationTable::default());
        let processor = EventProcessor::new(Arc::clone(&table), true);

        assert!(processor.verbose);
        assert_eq!(Arc::strong_count(&table), 2);
    }
}
