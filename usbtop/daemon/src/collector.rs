//! Periodic reporting over the aggregation table
//!
//! The collector is the table's only consumer. Every tick it drains the
//! table, keeps the set of endpoints seen recently, forgets devices that
//! have been idle for longer than the timeout and turns the drained bytes
//! into per-endpoint rates.

use crate::{
    table::AggregationTable,
    types::*,
};
use log::debug;
use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};
use usb_probe_common::constants::USB_DIR_IN;

/// Traffic collector for building per-interval reports
pub struct TrafficCollector {
    /// Nominal refresh interval, used for the first tick
    interval: Duration,
    /// Idle time after which a device disappears from reports
    timeout: Duration,
    /// Only report this bus
    bus_filter: Option<u32>,
    /// Endpoints that moved bytes since their device was last forgotten
    known_endpoints: HashSet<TransferKey>,
    /// Last tick at which each device moved bytes
    device_last_seen: HashMap<DeviceId, Instant>,
    last_tick: Option<Instant>,
}

impl TrafficCollector {
    /// Create a new collector
    ///
    /// # Arguments
    ///
    /// * `interval` - Refresh interval
    /// * `timeout` - Seconds before an inactive device is removed
    /// * `bus_filter` - Bus to report (0 = all buses)
    pub fn new(interval: Duration, timeout: Duration, bus_filter: u32) -> Self {
        Self {
            interval,
            timeout,
            bus_filter: (bus_filter != 0).then_some(bus_filter),
            known_endpoints: HashSet::new(),
            device_last_seen: HashMap::new(),
            last_tick: None,
        }
    }

    /// Drain the table and build the report for the interval ending at `now`
    pub fn collect(&mut self, table: &AggregationTable, now: Instant) -> TrafficReport {
        let elapsed = self
            .last_tick
            .map(|last| now.saturating_duration_since(last))
            .filter(|elapsed| !elapsed.is_zero())
            .unwrap_or(self.interval);
        self.last_tick = Some(now);

        let traffic: HashMap<TransferKey, u64> = table.drain().into_iter().collect();
        for key in traffic.keys() {
            self.known_endpoints.insert(*key);
            self.device_last_seen.insert(DeviceId::from(key), now);
        }

        self.expire_devices(table, now);

        let mut endpoints: Vec<TransferKey> = self
            .known_endpoints
            .iter()
            .filter(|key| self.bus_filter.map_or(true, |bus| key.bus == bus))
            .copied()
            .collect();
        endpoints.sort_by_key(|key| {
            (
                key.bus,
                key.device,
                key.endpoint_number(),
                key.endpoint & USB_DIR_IN,
                key.vendor,
                key.product,
                key.transfer_type,
            )
        });

        build_report(&endpoints, &traffic, elapsed, table)
    }

    /// Forget devices idle for longer than the timeout
    fn expire_devices(&mut self, table: &AggregationTable, now: Instant) {
        let timed_out: HashSet<DeviceId> = self
            .device_last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > self.timeout)
            .map(|(device, _)| *device)
            .collect();

        if timed_out.is_empty() {
            return;
        }

        self.device_last_seen
            .retain(|device, _| !timed_out.contains(device));
        self.known_endpoints
            .retain(|key| !timed_out.contains(&DeviceId::from(key)));
        let pruned = table.prune(|key| timed_out.contains(&DeviceId::from(key)));

        debug!(
            "Removed {} inactive device(s), pruned {} table entries",
            timed_out.len(),
            pruned
        );
    }

    /// Number of endpoints currently listed
    pub fn endpoint_count(&self) -> usize {
        self.known_endpoints.len()
    }

    /// Number of devices currently listed
    pub fn device_count(&self) -> usize {
        self.device_last_seen.len()
    }
}

fn build_report(
    endpoints: &[TransferKey],
    traffic: &HashMap<TransferKey, u64>,
    elapsed: Duration,
    table: &AggregationTable,
) -> TrafficReport {
    let seconds = elapsed.as_secs_f64();
    let mut buses: Vec<BusReport> = Vec::new();
    let mut total_bytes = 0u64;
    let mut last_device: Option<DeviceId> = None;

    for key in endpoints {
        let bytes = traffic.get(key).copied().unwrap_or(0);
        total_bytes += bytes;

        if buses.last().map_or(true, |bus| bus.bus != key.bus) {
            buses.push(BusReport {
                bus: key.bus,
                devices: Vec::new(),
            });
            last_device = None;
        }
        // Just pushed if missing
        let Some(bus) = buses.last_mut() else { continue };

        let device_id = DeviceId::from(key);
        if last_device != Some(device_id) {
            bus.devices.push(DeviceReport {
                device: key.device,
                vendor: key.vendor,
                product: key.product,
                endpoints: Vec::new(),
            });
            last_device = Some(device_id);
        }
        let Some(device) = bus.devices.last_mut() else { continue };

        device.endpoints.push(EndpointReport {
            address: key.endpoint,
            transfer_type: key.transfer_type().label().to_string(),
            direction: key.direction().label().to_string(),
            bytes,
            bytes_per_second: bytes as f64 / seconds,
        });
    }

    TrafficReport {
        timestamp: chrono::Utc::now().to_rfc3339(),
        interval_seconds: seconds,
        total_bytes,
        buses,
        table: table.stats(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(250);
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn key(bus: u32, device: u32, endpoint: u8, transfer_type: TransferType) -> TransferKey {
        TransferKey::new(bus, device, 0x1234, 0x5678, endpoint, transfer_type)
    }

    #[test]
    fn test_collector_basic() {
        let table = AggregationTable::default();
        let mut collector = TrafficCollector::new(INTERVAL, TIMEOUT, 0);

        table.increment(key(1, 5, 0x81, TransferType::Bulk), 64);
        table.increment(key(1, 5, 0x81, TransferType::Bulk), 64);

        let report = collector.collect(&table, Instant::now());

        assert_eq!(report.total_bytes, 128);
        assert_eq!(report.interval_seconds, 0.25);
        assert_eq!(report.buses.len(), 1);
        let device = &report.buses[0].devices[0];
        assert_eq!((device.device, device.vendor, device.product), (5, 0x1234, 0x5678));
        let endpoint = &device.endpoints[0];
        assert_eq!(endpoint.address, 0x81);
        assert_eq!(endpoint.transfer_type, "BULK");
        assert_eq!(endpoint.direction, "IN");
        assert_eq!(endpoint.bytes, 128);
        assert_eq!(endpoint.bytes_per_second, 512.0);
    }

    #[test]
    fn test_report_ordering() {
        let table = AggregationTable::default();
        let mut collector = TrafficCollector::new(INTERVAL, TIMEOUT, 0);

        for k in [
            key(2, 1, 0x81, TransferType::Interrupt),
            key(1, 7, 0x02, TransferType::Bulk),
            key(1, 7, 0x81, TransferType::Bulk),
            key(1, 7, 0x80, TransferType::Control),
            key(1, 7, 0x00, TransferType::Control),
            key(1, 3, 0x83, TransferType::Isochronous),
        ] {
            table.increment(k, 10);
        }

        let report = collector.collect(&table, Instant::now());
        let order: Vec<(u32, u32, u8)> = report
            .endpoints()
            .map(|(bus, device, endpoint)| (bus.bus, device.device, endpoint.address))
            .collect();

        assert_eq!(
            order,
            vec![
                (1, 3, 0x83),
                (1, 7, 0x00),
                (1, 7, 0x80),
                (1, 7, 0x81),
                (1, 7, 0x02),
                (2, 1, 0x81),
            ]
        );
        assert_eq!(report.buses.len(), 2);
        assert_eq!(report.buses[0].devices.len(), 2);
    }

    #[test]
    fn test_bus_filter() {
        let table = AggregationTable::default();
        let mut collector = TrafficCollector::new(INTERVAL, TIMEOUT, 2);

        table.increment(key(1, 5, 0x81, TransferType::Bulk), 100);
        table.increment(key(2, 4, 0x81, TransferType::Bulk), 50);

        let report = collector.collect(&table, Instant::now());
        assert_eq!(report.buses.len(), 1);
        assert_eq!(report.buses[0].bus, 2);
        assert_eq!(report.total_bytes, 50);
    }

    #[test]
    fn test_idle_endpoints_stay_until_timeout() {
        let table = AggregationTable::default();
        let mut collector = TrafficCollector::new(INTERVAL, TIMEOUT, 0);
        let start = Instant::now();
        let bulk = key(1, 5, 0x81, TransferType::Bulk);

        table.increment(bulk, 64);
        collector.collect(&table, start);

        // Quiet, but within the timeout: listed at zero
        let report = collector.collect(&table, start + Duration::from_secs(2));
        assert_eq!(report.buses[0].devices[0].endpoints[0].bytes, 0);
        assert_eq!(report.interval_seconds, 2.0);

        // Past the timeout: gone from the report and from the table
        let report = collector.collect(&table, start + Duration::from_secs(6));
        assert!(report.buses.is_empty());
        assert_eq!(collector.device_count(), 0);
        assert_eq!(collector.endpoint_count(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_active_device_is_kept() {
        let table = AggregationTable::default();
        let mut collector = TrafficCollector::new(INTERVAL, TIMEOUT, 0);
        let start = Instant::now();
        let idle = key(1, 5, 0x81, TransferType::Bulk);
        let busy = key(1, 6, 0x81, TransferType::Bulk);

        table.increment(idle, 1);
        table.increment(busy, 1);
        collector.collect(&table, start);

        table.increment(busy, 1);
        let report = collector.collect(&table, start + Duration::from_secs(10));

        assert_eq!(report.buses[0].devices.len(), 1);
        assert_eq!(report.buses[0].devices[0].device, 6);
        assert_eq!(table.get(&idle), None);
        assert_eq!(table.get(&busy), Some(0));
    }
}
