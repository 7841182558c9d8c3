// notification.rs - device notification registry and dispatcher
// =========================================================================

use crate::codec;
use crate::types::{AdsNotificationHeader, AmsAddr};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// User callback invoked for every delivered notification sample.
///
/// Runs on the dispatcher task. It must not block on router calls for the
/// port it was registered under.
pub type NotificationCallback = Arc<dyn Fn(&AmsAddr, &AdsNotificationHeader, &[u8], u32) + Send + Sync>;

struct NotificationEntry {
    port: u16,
    user: u32,
    callback: NotificationCallback,
}

/// Subscriptions of one source address, plus the remote IP they were
/// created through (needed for connection GC once routes are gone).
struct NotifyTable {
    conn_ip: Ipv4Addr,
    entries: HashMap<u32, Arc<NotificationEntry>>,
}

type TableMap = HashMap<AmsAddr, NotifyTable>;

/// Owns the notification tables and the single dispatcher task draining
/// the queue fed by the connection receive loops.
pub(crate) struct NotificationDispatcher {
    tables: Arc<Mutex<TableMap>>,
    queue: mpsc::UnboundedSender<(AmsAddr, Vec<u8>)>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(AmsAddr, Vec<u8>)>();
        let tables: Arc<Mutex<TableMap>> = Arc::new(Mutex::new(HashMap::new()));
        let task_tables = Arc::clone(&tables);
        let task = crate::runtime().spawn(async move {
            while let Some((source, payload)) = rx.recv().await {
                dispatch(&task_tables, &source, &payload);
            }
        });
        NotificationDispatcher {
            tables,
            queue: tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// A sender half for a connection's receive loop to push frames into.
    pub fn sender(&self) -> mpsc::UnboundedSender<(AmsAddr, Vec<u8>)> {
        self.queue.clone()
    }

    /// Records a device-assigned handle together with its owner and callback.
    pub fn create_mapping(
        &self,
        source: AmsAddr,
        conn_ip: Ipv4Addr,
        handle: u32,
        port: u16,
        user: u32,
        callback: NotificationCallback,
    ) {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(source).or_insert_with(|| NotifyTable {
            conn_ip,
            entries: HashMap::new(),
        });
        table.conn_ip = conn_ip;
        table
            .entries
            .insert(handle, Arc::new(NotificationEntry { port, user, callback }));
    }

    /// Removes one mapping. Returns the remote IP it was registered through
    /// if the mapping existed, so the caller can GC the connection.
    ///
    /// Safe while a delivery is in flight: the dispatcher works on its own
    /// `Arc` of the entry, never on the table slot.
    pub fn delete_mapping(&self, source: &AmsAddr, handle: u32) -> Option<Ipv4Addr> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(source)?;
        let removed = table.entries.remove(&handle).map(|_| table.conn_ip);
        if table.entries.is_empty() {
            tables.remove(source);
        }
        removed
    }

    /// All `(source, handle)` pairs registered by `port`.
    pub fn collect_orphaned(&self, port: u16) -> Vec<(AmsAddr, u32)> {
        let tables = self.tables.lock().unwrap();
        let mut pairs = Vec::new();
        for (source, table) in tables.iter() {
            for (handle, entry) in table.entries.iter() {
                if entry.port == port {
                    pairs.push((*source, *handle));
                }
            }
        }
        pairs
    }

    /// Whether any live subscription still depends on the connection to `ip`.
    pub fn has_for_ip(&self, ip: Ipv4Addr) -> bool {
        self.tables
            .lock()
            .unwrap()
            .values()
            .any(|table| table.conn_ip == ip && !table.entries.is_empty())
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Decodes one queued frame and runs the registered callbacks.
///
/// The table lock is only held to look an entry up, never across a callback;
/// a panicking callback is contained and logged.
fn dispatch(tables: &Mutex<TableMap>, source: &AmsAddr, payload: &[u8]) {
    let stamps = match codec::parse_notification(payload) {
        Ok(stamps) => stamps,
        Err(err) => {
            warn!("dropping malformed notification frame from {}: {}", source, err);
            return;
        }
    };
    for stamp in stamps {
        for sample in stamp.samples {
            let entry = {
                let tables = tables.lock().unwrap();
                tables
                    .get(source)
                    .and_then(|table| table.entries.get(&sample.handle))
                    .cloned()
            };
            let entry = match entry {
                Some(entry) => entry,
                None => {
                    // Device fired after local deletion; drop silently.
                    debug!("no subscriber for handle {:#x} from {}", sample.handle, source);
                    continue;
                }
            };
            let header = AdsNotificationHeader {
                timestamp: stamp.timestamp,
                sample_size: sample.data.len() as u32,
            };
            let callback = Arc::clone(&entry.callback);
            let result = catch_unwind(AssertUnwindSafe(|| {
                callback(source, &header, &sample.data, entry.user)
            }));
            if result.is_err() {
                error!(
                    "notification callback for {} handle {:#x} panicked",
                    source, sample.handle
                );
            }
        }
    }
}
