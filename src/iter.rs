/// Full-table scan over `lookup` and `next_key`.
///
/// The map has no "first key" call: `next_key` returns the first key only
/// when handed a key that is not resident. The scan therefore probes a few
/// fill patterns for one that is absent and seeds the traversal with it.
///
/// The scan runs on the blocking pool and pushes decoded entries into a
/// bounded queue; `TableIter` is the consumer end.

use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::accessor::{Accessor, MapAccessor};
use crate::config::ScanOptions;
use crate::error::{hex, Result, TableError};
use crate::module::{ModuleInner, TableId};
use crate::table::Entry;

/// Sentinel candidates, tried in order: all-zero, all-0xff, all-0x55.
pub const SENTINEL_PATTERNS: [u8; 3] = [0x00, 0xff, 0x55];

/// First sentinel candidate that is not resident in the map.
pub(crate) fn find_sentinel<M: MapAccessor + ?Sized>(
    accessor: &Accessor<'_, M>,
    key_size: usize,
    table: &str,
) -> Result<Vec<u8>> {
    for pattern in SENTINEL_PATTERNS {
        let candidate = vec![pattern; key_size];
        let resident = accessor
            .lookup(&candidate)
            .map_err(|err| err.into_table_error("lookup", hex(&candidate)))?;
        if resident.is_none() {
            return Ok(candidate);
        }
        debug!("{}: sentinel candidate {:#04x} is resident", table, pattern);
    }
    Err(TableError::NoSentinel {
        table: table.to_string(),
    })
}

#[derive(Debug, Default)]
struct ScanStats {
    delivered: usize,
    skipped: usize,
}

enum ScanEnd {
    Done,
    Stopped,
    Failed(TableError),
}

struct Producer {
    module: Arc<ModuleInner>,
    id: TableId,
    tx: mpsc::Sender<Result<Entry>>,
    stop: Arc<AtomicBool>,
    stats: ScanStats,
}

impl Producer {
    fn run(mut self) {
        let name = self.module.meta(self.id).name;
        match self.scan(&name) {
            ScanEnd::Done => info!(
                "SCAN {}: delivered {} entries ({} vanished mid-scan)",
                name, self.stats.delivered, self.stats.skipped
            ),
            ScanEnd::Stopped => debug!(
                "SCAN {}: stopped by consumer after {} entries",
                name, self.stats.delivered
            ),
            ScanEnd::Failed(err) => {
                warn!(
                    "SCAN {}: aborted after {} entries: {}",
                    name, self.stats.delivered, err
                );
                let _ = self.tx.blocking_send(Err(err));
            }
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.tx.is_closed()
    }

    fn scan(&mut self, name: &str) -> ScanEnd {
        let meta = self.module.meta(self.id);
        let seed = find_sentinel(&meta.accessor(&*self.module.maps), meta.key.size(), name);
        let mut key = match seed {
            Ok(key) => key,
            Err(err) => return ScanEnd::Failed(err),
        };

        loop {
            if self.stopped() {
                return ScanEnd::Stopped;
            }
            // Metadata is re-read per step; the module may remap the fd.
            let meta = self.module.meta(self.id);
            let accessor = meta.accessor(&*self.module.maps);
            key = match accessor.next_key(&key) {
                Ok(Some(next)) => next,
                Ok(None) => return ScanEnd::Done,
                Err(err) => return ScanEnd::Failed(err.into_table_error("next_key", hex(&key))),
            };
            let leaf = match accessor.lookup(&key) {
                Ok(Some(leaf)) => leaf,
                Ok(None) => {
                    self.stats.skipped += 1;
                    continue;
                }
                Err(err) => return ScanEnd::Failed(err.into_table_error("lookup", hex(&key))),
            };
            let codec = meta.codec();
            let entry = match (codec.decode_key(&key), codec.decode_leaf(&leaf)) {
                (Ok(key), Ok(value)) => Entry { key, value },
                (Err(err), _) | (_, Err(err)) => return ScanEnd::Failed(err),
            };
            if self.tx.blocking_send(Ok(entry)).is_err() {
                return ScanEnd::Stopped;
            }
            self.stats.delivered += 1;
        }
    }
}

/// Start a scan of table `id`. The producer holds the module for the
/// duration of the scan.
///
/// # Panics
///
/// Outside a tokio runtime.
pub(crate) fn spawn_scan(module: Arc<ModuleInner>, id: TableId, options: ScanOptions) -> TableIter {
    let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
    let stop = Arc::new(AtomicBool::new(false));
    let producer = Producer {
        module,
        id,
        tx,
        stop: Arc::clone(&stop),
        stats: ScanStats::default(),
    };
    tokio::task::spawn_blocking(move || producer.run());
    TableIter { rx, stop }
}

/// Consumer end of a scan. Yields entries in map order; an aborted scan
/// ends with one `Err` after the entries delivered so far.
///
/// Dropping the iterator stops the scan.
pub struct TableIter {
    rx: mpsc::Receiver<Result<Entry>>,
    stop: Arc<AtomicBool>,
}

impl TableIter {
    pub async fn next(&mut self) -> Option<Result<Entry>> {
        self.rx.recv().await
    }

    /// Stop the scan. Entries already queued can still be drained.
    pub fn cancel(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.rx.close();
    }

    /// Drain the scan, failing on the first error.
    pub async fn collect_entries(mut self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        while let Some(item) = self.next().await {
            entries.push(item?);
        }
        Ok(entries)
    }
}

impl Stream for TableIter {
    type Item = Result<Entry>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for TableIter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TypeDescriptor;
    use crate::module::Module;
    use crate::table::Table;
    use futures::StreamExt;

    fn u8_table(module: &Module) -> Table {
        module
            .create_table(
                "bytes",
                TypeDescriptor::parse("u8").unwrap(),
                TypeDescriptor::parse("u8").unwrap(),
                256,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_table() {
        let module = Module::in_memory();
        let table = u8_table(&module);
        assert!(table.iter().collect_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sentinel_falls_through_resident_patterns() {
        let module = Module::in_memory();
        let table = u8_table(&module);
        table.set("0", "1").unwrap();
        table.set("255", "2").unwrap();

        let mut entries = table.iter().collect_entries().await.unwrap();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(entries, [Entry::new("0", "1"), Entry::new("255", "2")]);
    }

    #[tokio::test]
    async fn test_all_sentinels_resident_fails_loudly() {
        let module = Module::in_memory();
        let table = u8_table(&module);
        for key in ["0", "255", "85", "7"] {
            table.set(key, "1").unwrap();
        }
        let mut iter = table.iter();
        match iter.next().await {
            Some(Err(TableError::NoSentinel { table })) => assert_eq!(table, "bytes"),
            other => panic!("expected NoSentinel, got {other:?}"),
        }
        assert!(iter.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_and_cancel() {
        let module = Module::in_memory();
        let table = u8_table(&module);
        for k in 1..=50 {
            table.set(&k.to_string(), "0").unwrap();
        }

        let streamed: Vec<_> = table.iter().collect().await;
        assert_eq!(streamed.len(), 50);

        let mut iter = table.iter_with(ScanOptions { queue_capacity: 1 });
        assert!(iter.next().await.unwrap().is_ok());
        iter.cancel();
        let mut rest = 0;
        while let Some(item) = iter.next().await {
            item.unwrap();
            rest += 1;
        }
        assert!(rest <= 1, "at most one queued entry survives a cancel");
    }
}
