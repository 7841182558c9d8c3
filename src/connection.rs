// connection.rs - one shared TCP connection per remote device
// =========================================================================

use crate::codec::{self, AmsTcpHeader, AoeHeader};
use crate::error::{AdsError, Result};
use crate::frame::Frame;
use crate::types::AmsAddr;
use log::{debug, warn};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

/// Channel feeding `DEVICE_NOTIFICATION` frames to the router's dispatcher.
pub(crate) type NotifySender = UnboundedSender<(AmsAddr, Vec<u8>)>;

/// A decoded response frame handed back to the waiting caller.
#[derive(Debug)]
pub(crate) struct AoeResponse {
    pub header: AoeHeader,
    pub payload: Vec<u8>,
}

type SlotResult = Result<AoeResponse>;

struct PendingSlot {
    port: u16,
    tx: oneshot::Sender<SlotResult>,
}

/// Outstanding requests keyed by invoke-id, plus the id counter.
///
/// Allocation and registration happen in one critical section so a response
/// can never arrive before its slot exists.
struct PendingTable {
    next_invoke_id: u32,
    slots: HashMap<u32, PendingSlot>,
}

impl PendingTable {
    fn new() -> Self {
        PendingTable {
            next_invoke_id: 0,
            slots: HashMap::new(),
        }
    }

    /// Allocates a fresh invoke-id and registers a slot for it. Skips ids
    /// still held by live requests, so wraparound never aliases a waiter.
    fn register(&mut self, port: u16) -> (u32, oneshot::Receiver<SlotResult>) {
        loop {
            self.next_invoke_id = self.next_invoke_id.wrapping_add(1);
            let invoke_id = self.next_invoke_id;
            if invoke_id != 0 && !self.slots.contains_key(&invoke_id) {
                let (tx, rx) = oneshot::channel();
                self.slots.insert(invoke_id, PendingSlot { port, tx });
                return (invoke_id, rx);
            }
        }
    }

    /// Completes the slot waiting on `invoke_id`, if any.
    fn complete(&mut self, invoke_id: u32, response: AoeResponse) -> bool {
        match self.slots.remove(&invoke_id) {
            Some(slot) => {
                let _ = slot.tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    fn discard(&mut self, invoke_id: u32) {
        self.slots.remove(&invoke_id);
    }

    fn take_port(&mut self, port: u16) -> Vec<PendingSlot> {
        let ids: Vec<u32> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.port == port)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.slots.remove(&id))
            .collect()
    }

    fn take_all(&mut self) -> Vec<PendingSlot> {
        self.slots.drain().map(|(_, slot)| slot).collect()
    }
}

/// One TCP connection to a remote device's ADS router.
///
/// All NetIds routed to the same IP share one connection; its receive loop
/// runs on the crate's background runtime and demultiplexes incoming frames
/// into pending-request completions and notification deliveries.
pub(crate) struct AdsConnection {
    ip: Ipv4Addr,
    local_ip: Ipv4Addr,
    writer: AsyncMutex<OwnedWriteHalf>,
    pending: Mutex<PendingTable>,
    alive: AtomicBool,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl AdsConnection {
    /// Opens a connection to `dest` and starts its receive loop.
    ///
    /// The socket is created on the background runtime so it outlives
    /// whatever runtime the caller happens to be on.
    pub async fn connect(dest: SocketAddrV4, notify: NotifySender) -> Result<Arc<Self>> {
        let stream = crate::runtime()
            .spawn(async move {
                let stream = TcpStream::connect(dest).await?;
                stream.set_nodelay(true)?;
                std::io::Result::Ok(stream)
            })
            .await
            .map_err(|_| AdsError::TransportClosed)??;

        let local_ip = match stream.local_addr()? {
            SocketAddr::V4(addr) => *addr.ip(),
            SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(AdsConnection {
            ip: *dest.ip(),
            local_ip,
            writer: AsyncMutex::new(write_half),
            pending: Mutex::new(PendingTable::new()),
            alive: AtomicBool::new(true),
            recv_task: Mutex::new(None),
        });
        let handle = crate::runtime().spawn(Self::recv_loop(Arc::clone(&conn), read_half, notify));
        *conn.recv_task.lock().unwrap() = Some(handle);
        debug!("connected to {}", dest);
        Ok(conn)
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// Local IPv4 the OS picked for this socket; used to derive the local
    /// NetId when none was configured.
    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Sends one request frame and returns the completion to wait on.
    ///
    /// The caller supplies the command body; this stacks the AoE and AMS/TCP
    /// headers on top and writes the whole frame under the send mutex.
    pub async fn request(
        &self,
        target: AmsAddr,
        source: AmsAddr,
        cmd_id: u16,
        mut frame: Frame,
        port: u16,
    ) -> Result<(u32, oneshot::Receiver<SlotResult>)> {
        if !self.is_alive() {
            return Err(AdsError::TransportClosed);
        }
        let (invoke_id, rx) = self.pending.lock().unwrap().register(port);

        let aoe = AoeHeader::request(target, source, cmd_id, frame.remaining() as u32, invoke_id);
        frame.prepend(&aoe.encode());
        let tcp = AmsTcpHeader {
            length: frame.remaining() as u32,
        };
        frame.prepend(&tcp.encode());

        let mut writer = self.writer.lock().await;
        if !self.is_alive() {
            drop(writer);
            self.pending.lock().unwrap().discard(invoke_id);
            return Err(AdsError::TransportClosed);
        }
        if let Err(err) = writer.write_all(frame.as_slice()).await {
            drop(writer);
            warn!("send to {} failed: {}", self.ip, err);
            self.pending.lock().unwrap().discard(invoke_id);
            self.shutdown();
            return Err(AdsError::TransportClosed);
        }
        drop(writer);
        debug!(
            "sent cmd {} invoke {} ({} bytes) to {}",
            cmd_id,
            invoke_id,
            frame.remaining(),
            target
        );
        Ok((invoke_id, rx))
    }

    /// Waits for the response to `invoke_id` for at most `timeout_ms`.
    ///
    /// On timeout the slot is withdrawn, so a response arriving later finds
    /// nothing to complete and is dropped by the receive loop.
    pub async fn await_response(
        &self,
        invoke_id: u32,
        rx: oneshot::Receiver<SlotResult>,
        timeout_ms: u32,
    ) -> Result<AoeResponse> {
        match tokio::time::timeout(Duration::from_millis(u64::from(timeout_ms)), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AdsError::TransportClosed),
            Err(_) => {
                self.pending.lock().unwrap().discard(invoke_id);
                Err(AdsError::Timeout(timeout_ms))
            }
        }
    }

    /// Cancels every outstanding request issued through `port`.
    pub fn abort_port(&self, port: u16) {
        for slot in self.pending.lock().unwrap().take_port(port) {
            let _ = slot.tx.send(Err(AdsError::Aborted));
        }
    }

    /// Tears the connection down: no new sends, receive loop stopped, every
    /// waiter aborted with `TransportClosed`.
    pub fn shutdown(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            if let Some(handle) = self.recv_task.lock().unwrap().take() {
                handle.abort();
            }
            self.fail_all();
        }
    }

    fn fail_all(&self) {
        for slot in self.pending.lock().unwrap().take_all() {
            let _ = slot.tx.send(Err(AdsError::TransportClosed));
        }
    }

    async fn recv_loop(conn: Arc<AdsConnection>, mut read: OwnedReadHalf, notify: NotifySender) {
        loop {
            let mut tcp_buf = [0u8; codec::AMS_TCP_HEADER_SIZE];
            if let Err(err) = read.read_exact(&mut tcp_buf).await {
                debug!("connection to {} closed: {}", conn.ip, err);
                break;
            }
            let tcp = match AmsTcpHeader::decode(&tcp_buf) {
                Ok(header) => header,
                Err(_) => break,
            };
            if (tcp.length as usize) < codec::AOE_HEADER_SIZE {
                warn!("frame from {} shorter than an AoE header", conn.ip);
                break;
            }
            let mut frame = vec![0u8; tcp.length as usize];
            if let Err(err) = read.read_exact(&mut frame).await {
                debug!("connection to {} closed mid-frame: {}", conn.ip, err);
                break;
            }
            let header = match AoeHeader::decode(&frame) {
                Ok(header) => header,
                Err(err) => {
                    warn!("undecodable AoE header from {}: {}", conn.ip, err);
                    break;
                }
            };
            if header.length as usize + codec::AOE_HEADER_SIZE != tcp.length as usize {
                warn!(
                    "inconsistent frame lengths from {}: AoE {} + header != AMS/TCP {}",
                    conn.ip, header.length, tcp.length
                );
                break;
            }
            let payload = frame.split_off(codec::AOE_HEADER_SIZE);

            if header.cmd_id == codec::cmd::DEVICE_NOTIFICATION {
                if notify.send((header.source, payload)).is_err() {
                    // Dispatcher is gone, the router is being torn down.
                    break;
                }
                continue;
            }

            let completed = conn
                .pending
                .lock()
                .unwrap()
                .complete(header.invoke_id, AoeResponse { header, payload });
            if !completed {
                warn!(
                    "dropping response from {} with unknown invoke id {}",
                    conn.ip, header.invoke_id
                );
            }
        }
        conn.alive.store(false, Ordering::Release);
        conn.fail_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_ids_of_live_slots_are_distinct() {
        let mut table = PendingTable::new();
        let (a, _rx_a) = table.register(30000);
        let (b, _rx_b) = table.register(30000);
        let (c, _rx_c) = table.register(30001);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert_eq!(table.slots.len(), 3);
    }

    #[test]
    fn register_skips_ids_still_in_flight() {
        let mut table = PendingTable::new();
        let (first, _rx) = table.register(30000);
        assert_eq!(first, 1);
        // Force the counter to wrap straight into the occupied id.
        table.next_invoke_id = 0;
        let (second, _rx2) = table.register(30000);
        assert_eq!(second, 2);
    }

    #[test]
    fn register_never_hands_out_zero() {
        let mut table = PendingTable::new();
        table.next_invoke_id = u32::MAX;
        let (id, _rx) = table.register(30000);
        assert_ne!(id, 0);
    }

    #[test]
    fn complete_is_one_shot_per_slot() {
        let mut table = PendingTable::new();
        let (id, mut rx) = table.register(30000);
        let response = AoeResponse {
            header: AoeHeader::request(AmsAddr::default(), AmsAddr::default(), 2, 0, id),
            payload: Vec::new(),
        };
        assert!(table.complete(id, response));
        assert!(rx.try_recv().is_ok());
        let again = AoeResponse {
            header: AoeHeader::request(AmsAddr::default(), AmsAddr::default(), 2, 0, id),
            payload: Vec::new(),
        };
        assert!(!table.complete(id, again));
    }

    #[test]
    fn take_port_only_drains_that_port() {
        let mut table = PendingTable::new();
        let (_a, _rx_a) = table.register(30000);
        let (_b, _rx_b) = table.register(30001);
        let (_c, _rx_c) = table.register(30000);
        let drained = table.take_port(30000);
        assert_eq!(drained.len(), 2);
        assert_eq!(table.slots.len(), 1);
    }
}
