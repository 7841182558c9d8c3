// lib.rs - Rust ADS/AMS client library
// =========================================================================
//
// # Rust ADS
//
// A client-side ADS/AMS (Automation Device Specification over AMS) runtime
// for talking to Beckhoff TwinCAT devices. The router multiplexes
// request/response traffic and asynchronous device notifications between
// local AMS ports and remote devices over TCP, sharing one connection per
// remote IP across any number of routes and local ports.
//
// ## Features
//
// - **AMS/AoE wire codec**: little-endian packed headers, encoded and
//   decoded field by field
// - **Connection sharing**: one TCP connection per remote IP, demultiplexed
//   by invoke-id
// - **Device notifications**: subscription bookkeeping and a dedicated
//   dispatcher task that survives port closure and connection loss
// - **Per-port timeouts**: every local AMS port carries its own request
//   deadline

use crate::connection::AdsConnection;
use crate::notification::NotificationDispatcher;
use lazy_static::lazy_static;
use log::{debug, warn};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;

pub mod codec;
mod connection;
pub mod error;
pub mod frame;
mod notification;
pub mod types;

// Re-export commonly used items
pub use error::{AdsError, Result};
pub use frame::Frame;
pub use notification::NotificationCallback;
pub use types::{
    ads_state, ports, trans_mode, AdsNotificationAttrib, AdsNotificationHeader, AdsVersion,
    AmsAddr, AmsNetId, ADS_TCP_SERVER_PORT, DEFAULT_TIMEOUT_MS, NUM_PORTS_MAX, PORT_BASE,
};

lazy_static! {
    /// Background runtime driving connection receive loops and the
    /// notification dispatcher, independent of whatever runtime the
    /// caller lives on.
    static ref RUNTIME: Runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("ads-router")
        .enable_all()
        .build()
        .expect("failed to start ADS background runtime");

    /// The process-wide router handed out by [`router()`].
    static ref ROUTER: AmsRouter = AmsRouter::new();
}

pub(crate) fn runtime() -> &'static Runtime {
    &RUNTIME
}

/// Returns the process-wide router instance.
///
/// The original ADS C API exposes exactly one router per process; this is
/// the equivalent convenience. Independent routers can still be created
/// with [`AmsRouter::new`].
pub fn router() -> AmsRouter {
    ROUTER.clone()
}

// =========================================================================
// ROUTER STATE
// =========================================================================

#[derive(Clone, Copy)]
struct PortState {
    timeout_ms: u32,
}

#[derive(Default)]
struct RouteTable {
    /// Logical NetId -> remote IP bindings.
    routes: HashMap<AmsNetId, Ipv4Addr>,
    /// One shared connection per remote IP.
    connections: HashMap<Ipv4Addr, Arc<AdsConnection>>,
}

struct RouterInner {
    ports: Mutex<[Option<PortState>; NUM_PORTS_MAX]>,
    local_net_id: Mutex<AmsNetId>,
    table: Mutex<RouteTable>,
    dispatcher: NotificationDispatcher,
}

impl Drop for RouterInner {
    fn drop(&mut self) {
        let connections: Vec<Arc<AdsConnection>> = {
            let mut table = self.table.lock().unwrap();
            table.connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            conn.shutdown();
        }
    }
}

/// The ADS router: the top-level API surface of this crate.
///
/// Owns the local AMS port set, the route map, the TCP connections and the
/// notification registry. Cloning is cheap and every clone talks to the
/// same underlying router.
///
/// # Examples
///
/// ```rust,no_run
/// use rust_ads::{AmsAddr, AmsRouter, ports};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let ads = AmsRouter::new();
///     let port = ads.open_port()?;
///
///     let net_id = "5.24.37.144.1.1".parse()?;
///     ads.add_route(net_id, "192.168.0.231".parse()?).await?;
///
///     let plc = AmsAddr::new(net_id, ports::PLC_RUNTIME);
///     let mut value = [0u8; 4];
///     let n = ads.read(port, &plc, 0x4020, 0, &mut value).await?;
///     println!("read {} bytes: {:?}", n, &value[..n]);
///
///     ads.close_port(port).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct AmsRouter {
    inner: Arc<RouterInner>,
}

impl AmsRouter {
    /// Creates an independent router with no ports, routes or connections.
    pub fn new() -> Self {
        AmsRouter {
            inner: Arc::new(RouterInner {
                ports: Mutex::new([None; NUM_PORTS_MAX]),
                local_net_id: Mutex::new(AmsNetId::ZERO),
                table: Mutex::new(RouteTable::default()),
                dispatcher: NotificationDispatcher::new(),
            }),
        }
    }

    // =====================================================================
    // PORT MANAGEMENT
    // =====================================================================

    /// Opens a local AMS port and returns its number.
    ///
    /// Ports come from a fixed set of [`NUM_PORTS_MAX`] slots starting at
    /// [`PORT_BASE`]; the lowest free slot is used. Each port starts with
    /// the default request timeout of [`DEFAULT_TIMEOUT_MS`].
    pub fn open_port(&self) -> Result<u16> {
        let mut ports = self.inner.ports.lock().unwrap();
        for (index, slot) in ports.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(PortState {
                    timeout_ms: DEFAULT_TIMEOUT_MS,
                });
                return Ok(PORT_BASE + index as u16);
            }
        }
        Err(AdsError::PortExhausted)
    }

    /// Closes a local AMS port.
    ///
    /// Notifications registered through the port are deleted on their
    /// devices first (best effort; the local mapping goes away regardless),
    /// then every request still in flight on the port is aborted, then the
    /// port is released. After return no callback registered under this
    /// port runs again.
    pub async fn close_port(&self, port: u16) -> Result<()> {
        self.port_timeout(port)?;
        for (source, handle) in self.inner.dispatcher.collect_orphaned(port) {
            if let Err(err) = self.del_notification(port, &source, handle).await {
                warn!(
                    "deleting notification {:#x} at {} while closing port {} failed: {}",
                    handle, source, port, err
                );
                if let Some(ip) = self.inner.dispatcher.delete_mapping(&source, handle) {
                    self.gc_connection(ip);
                }
            }
        }
        let connections: Vec<Arc<AdsConnection>> = {
            let table = self.inner.table.lock().unwrap();
            table.connections.values().cloned().collect()
        };
        for conn in connections {
            conn.abort_port(port);
        }
        self.inner.ports.lock().unwrap()[Self::port_index(port)?] = None;
        debug!("closed port {}", port);
        Ok(())
    }

    /// Returns the AMS address of a local port: the configured (or derived)
    /// local NetId paired with the port number.
    ///
    /// Until a NetId is configured via [`set_local_net_id`] or derived from
    /// the first established connection, the NetId part is all-zero.
    ///
    /// [`set_local_net_id`]: AmsRouter::set_local_net_id
    pub fn get_local_address(&self, port: u16) -> Result<AmsAddr> {
        self.port_timeout(port)?;
        Ok(AmsAddr::new(self.local_net_id(), port))
    }

    /// Configures the local NetId instead of deriving it from the local IP.
    pub fn set_local_net_id(&self, net_id: AmsNetId) {
        *self.inner.local_net_id.lock().unwrap() = net_id;
    }

    /// Returns the request timeout of `port` in milliseconds.
    pub fn get_timeout(&self, port: u16) -> Result<u32> {
        self.port_timeout(port)
    }

    /// Sets the request timeout of `port` in milliseconds.
    ///
    /// Requests already in flight keep the timeout they were issued with.
    pub fn set_timeout(&self, port: u16, timeout_ms: u32) -> Result<()> {
        let index = Self::port_index(port)?;
        let mut ports = self.inner.ports.lock().unwrap();
        match ports[index].as_mut() {
            Some(state) => {
                state.timeout_ms = timeout_ms;
                Ok(())
            }
            None => Err(AdsError::InvalidPort(port)),
        }
    }

    fn port_index(port: u16) -> Result<usize> {
        let index = port.wrapping_sub(PORT_BASE) as usize;
        if port >= PORT_BASE && index < NUM_PORTS_MAX {
            Ok(index)
        } else {
            Err(AdsError::InvalidPort(port))
        }
    }

    /// Timeout snapshot for an open port; doubles as the open check.
    fn port_timeout(&self, port: u16) -> Result<u32> {
        let index = Self::port_index(port)?;
        self.inner.ports.lock().unwrap()[index]
            .as_ref()
            .map(|state| state.timeout_ms)
            .ok_or(AdsError::InvalidPort(port))
    }

    fn local_net_id(&self) -> AmsNetId {
        *self.inner.local_net_id.lock().unwrap()
    }

    // =====================================================================
    // ROUTES & CONNECTIONS
    // =====================================================================

    /// Adds (or re-points) a route binding `net_id` to the device at `ip`,
    /// connecting to the well-known ADS TCP port.
    pub async fn add_route(&self, net_id: AmsNetId, ip: Ipv4Addr) -> Result<()> {
        self.add_route_to(net_id, SocketAddrV4::new(ip, ADS_TCP_SERVER_PORT))
            .await
    }

    /// Adds a route to a device given by hostname, resolving it to the
    /// first IPv4 address.
    pub async fn add_route_host(&self, net_id: AmsNetId, host: &str) -> Result<()> {
        let mut addrs = tokio::net::lookup_host((host, ADS_TCP_SERVER_PORT)).await?;
        let ip = addrs
            .find_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
            .ok_or(AdsError::InvalidParam("host has no IPv4 address"))?;
        self.add_route(net_id, ip).await
    }

    /// Adds a route with an explicit TCP destination, for devices behind
    /// port forwarding or gateways listening off the well-known port.
    ///
    /// One connection exists per remote IP no matter how many NetIds route
    /// to it. Re-adding an existing binding is a no-op; re-pointing a NetId
    /// at a different IP may orphan the previous connection, which is then
    /// destroyed once nothing else references it. If the connection to this
    /// IP has died since, a fresh one is established.
    pub async fn add_route_to(&self, net_id: AmsNetId, dest: SocketAddrV4) -> Result<()> {
        if net_id.is_zero() {
            return Err(AdsError::InvalidParam("route NetId must not be zero"));
        }
        let ip = *dest.ip();

        // Fast path: a live connection to this IP already exists.
        {
            let mut table = self.inner.table.lock().unwrap();
            let live = table
                .connections
                .get(&ip)
                .map(|conn| conn.is_alive())
                .unwrap_or(false);
            if live {
                let previous = table.routes.insert(net_id, ip);
                drop(table);
                if let Some(old_ip) = previous {
                    if old_ip != ip {
                        self.gc_connection(old_ip);
                    }
                }
                return Ok(());
            }
        }

        let conn = AdsConnection::connect(dest, self.inner.dispatcher.sender()).await?;
        {
            let mut local = self.inner.local_net_id.lock().unwrap();
            if local.is_zero() {
                *local = AmsNetId::from_ip(conn.local_ip());
                debug!("derived local NetId {}", *local);
            }
        }

        let mut to_shutdown: Option<Arc<AdsConnection>> = None;
        let previous = {
            let mut table = self.inner.table.lock().unwrap();
            let raced = table
                .connections
                .get(&ip)
                .map(|existing| existing.is_alive())
                .unwrap_or(false);
            if raced {
                // Another caller connected first; keep the established one.
                to_shutdown = Some(conn);
            } else if let Some(dead) = table.connections.insert(ip, Arc::clone(&conn)) {
                to_shutdown = Some(dead);
            }
            table.routes.insert(net_id, ip)
        };
        if let Some(old) = to_shutdown {
            old.shutdown();
        }
        if let Some(old_ip) = previous {
            if old_ip != ip {
                self.gc_connection(old_ip);
            }
        }
        Ok(())
    }

    /// Removes the route for `net_id`.
    ///
    /// The underlying connection is destroyed only once no other route
    /// references it and no notifications remain for it.
    pub fn del_route(&self, net_id: &AmsNetId) {
        let removed = self.inner.table.lock().unwrap().routes.remove(net_id);
        if let Some(ip) = removed {
            self.gc_connection(ip);
        }
    }

    /// Destroys the connection to `ip` if nothing references it anymore.
    fn gc_connection(&self, ip: Ipv4Addr) {
        let conn = {
            let mut table = self.inner.table.lock().unwrap();
            let still_routed = table.routes.values().any(|route_ip| *route_ip == ip);
            if still_routed || self.inner.dispatcher.has_for_ip(ip) {
                return;
            }
            table.connections.remove(&ip)
        };
        if let Some(conn) = conn {
            debug!("dropping unreferenced connection to {}", ip);
            conn.shutdown();
        }
    }

    fn connection_for(&self, net_id: &AmsNetId) -> Result<Arc<AdsConnection>> {
        let table = self.inner.table.lock().unwrap();
        let ip = table.routes.get(net_id).ok_or(AdsError::NoRoute(*net_id))?;
        table
            .connections
            .get(ip)
            .cloned()
            .ok_or(AdsError::NoRoute(*net_id))
    }

    // =====================================================================
    // ADS REQUESTS
    // =====================================================================

    /// Sends one command frame and returns the response payload with the
    /// AoE error code already checked. The port's timeout is sampled here,
    /// when the request is issued.
    async fn ads_request(
        &self,
        port: u16,
        dest: &AmsAddr,
        cmd_id: u16,
        body: Frame,
    ) -> Result<Vec<u8>> {
        let timeout_ms = self.port_timeout(port)?;
        let conn = self.connection_for(&dest.net_id)?;
        let source = AmsAddr::new(self.local_net_id(), port);
        let (invoke_id, rx) = conn.request(*dest, source, cmd_id, body, port).await?;
        let response = conn.await_response(invoke_id, rx, timeout_ms).await?;
        if response.header.error_code != 0 {
            return Err(AdsError::Ads(response.header.error_code));
        }
        Ok(response.payload)
    }

    /// Reads `buf.len()` bytes from `group`/`offset` on the device and
    /// returns how many bytes the device actually delivered.
    pub async fn read(
        &self,
        port: u16,
        dest: &AmsAddr,
        index_group: u32,
        index_offset: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        let body = codec::read_request(index_group, index_offset, buf.len() as u32);
        let payload = self.ads_request(port, dest, codec::cmd::READ, body).await?;
        let mut reader = codec::BodyReader::new(&payload);
        let result = reader.u32()?;
        if result != 0 {
            return Err(AdsError::Ads(result));
        }
        let read_len = reader.u32()? as usize;
        if read_len > buf.len() {
            return Err(AdsError::Decode("device returned more data than requested"));
        }
        buf[..read_len].copy_from_slice(reader.bytes(read_len)?);
        Ok(read_len)
    }

    /// Writes `data` to `group`/`offset` on the device.
    pub async fn write(
        &self,
        port: u16,
        dest: &AmsAddr,
        index_group: u32,
        index_offset: u32,
        data: &[u8],
    ) -> Result<()> {
        let body = codec::write_request(index_group, index_offset, data);
        let payload = self.ads_request(port, dest, codec::cmd::WRITE, body).await?;
        Self::check_result(&payload)
    }

    /// Writes `data` and reads up to `buf.len()` bytes back in one round
    /// trip. Returns the number of bytes read.
    pub async fn read_write(
        &self,
        port: u16,
        dest: &AmsAddr,
        index_group: u32,
        index_offset: u32,
        buf: &mut [u8],
        data: &[u8],
    ) -> Result<usize> {
        let body = codec::read_write_request(index_group, index_offset, buf.len() as u32, data);
        let payload = self
            .ads_request(port, dest, codec::cmd::READ_WRITE, body)
            .await?;
        let mut reader = codec::BodyReader::new(&payload);
        let result = reader.u32()?;
        if result != 0 {
            return Err(AdsError::Ads(result));
        }
        let read_len = reader.u32()? as usize;
        if read_len > buf.len() {
            return Err(AdsError::Decode("device returned more data than requested"));
        }
        buf[..read_len].copy_from_slice(reader.bytes(read_len)?);
        Ok(read_len)
    }

    /// Reads the ADS state and the device state, e.g.
    /// ([`ads_state::RUN`], 0).
    pub async fn read_state(&self, port: u16, dest: &AmsAddr) -> Result<(u16, u16)> {
        let payload = self
            .ads_request(port, dest, codec::cmd::READ_STATE, Frame::new())
            .await?;
        let mut reader = codec::BodyReader::new(&payload);
        let result = reader.u32()?;
        if result != 0 {
            return Err(AdsError::Ads(result));
        }
        Ok((reader.u16()?, reader.u16()?))
    }

    /// Reads the device name and version.
    pub async fn read_device_info(&self, port: u16, dest: &AmsAddr) -> Result<(String, AdsVersion)> {
        let payload = self
            .ads_request(port, dest, codec::cmd::READ_DEVICE_INFO, Frame::new())
            .await?;
        let mut reader = codec::BodyReader::new(&payload);
        let result = reader.u32()?;
        if result != 0 {
            return Err(AdsError::Ads(result));
        }
        let version = AdsVersion {
            version: reader.u8()?,
            revision: reader.u8()?,
            build: reader.u16()?,
        };
        let raw_name = reader.bytes(16)?;
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
        let name = String::from_utf8_lossy(&raw_name[..end]).into_owned();
        Ok((name, version))
    }

    /// Requests a state transition on the device, e.g. to
    /// [`ads_state::RECONFIG`]. `data` is command-specific and usually
    /// empty.
    pub async fn write_control(
        &self,
        port: u16,
        dest: &AmsAddr,
        ads_state: u16,
        dev_state: u16,
        data: &[u8],
    ) -> Result<()> {
        let body = codec::write_control_request(ads_state, dev_state, data);
        let payload = self
            .ads_request(port, dest, codec::cmd::WRITE_CONTROL, body)
            .await?;
        Self::check_result(&payload)
    }

    // =====================================================================
    // DEVICE NOTIFICATIONS
    // =====================================================================

    /// Subscribes to a variable on the device.
    ///
    /// The device chooses the returned notification handle; `callback` runs
    /// on the router's dispatcher task for every delivered sample, with the
    /// source address, the sample metadata, the sample bytes and `user`
    /// passed back verbatim. Callbacks for one source arrive in wire order.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use rust_ads::{AdsNotificationAttrib, AmsAddr, AmsRouter, ports};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let ads = AmsRouter::new();
    ///     let port = ads.open_port()?;
    ///     let net_id = "5.24.37.144.1.1".parse()?;
    ///     ads.add_route(net_id, "192.168.0.231".parse()?).await?;
    ///     let plc = AmsAddr::new(net_id, ports::PLC_RUNTIME);
    ///
    ///     let attrib = AdsNotificationAttrib::server_on_change(4, 10_000);
    ///     let handle = ads
    ///         .add_notification(port, &plc, 0x4020, 0, &attrib, |source, header, data, _| {
    ///             println!("{}: {:?} at {}", source, data, header.timestamp);
    ///         }, 0)
    ///         .await?;
    ///
    ///     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    ///     ads.del_notification(port, &plc, handle).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn add_notification<F>(
        &self,
        port: u16,
        dest: &AmsAddr,
        index_group: u32,
        index_offset: u32,
        attrib: &AdsNotificationAttrib,
        callback: F,
        user: u32,
    ) -> Result<u32>
    where
        F: Fn(&AmsAddr, &AdsNotificationHeader, &[u8], u32) + Send + Sync + 'static,
    {
        let conn = self.connection_for(&dest.net_id)?;
        let body = codec::add_notification_request(index_group, index_offset, attrib);
        let payload = self
            .ads_request(port, dest, codec::cmd::ADD_DEVICE_NOTIFICATION, body)
            .await?;
        let mut reader = codec::BodyReader::new(&payload);
        let result = reader.u32()?;
        if result != 0 {
            return Err(AdsError::Ads(result));
        }
        let handle = reader.u32()?;
        self.inner
            .dispatcher
            .create_mapping(*dest, conn.ip(), handle, port, user, Arc::new(callback));
        debug!("notification {:#x} registered at {}", handle, dest);
        Ok(handle)
    }

    /// Deletes a notification on the device and removes the local mapping.
    pub async fn del_notification(&self, port: u16, dest: &AmsAddr, handle: u32) -> Result<()> {
        let body = codec::del_notification_request(handle);
        let payload = self
            .ads_request(port, dest, codec::cmd::DEL_DEVICE_NOTIFICATION, body)
            .await?;
        Self::check_result(&payload)?;
        if let Some(ip) = self.inner.dispatcher.delete_mapping(dest, handle) {
            self.gc_connection(ip);
        }
        Ok(())
    }

    /// Checks the leading ADS result code of a response body that carries
    /// nothing else of interest.
    fn check_result(payload: &[u8]) -> Result<()> {
        let result = codec::BodyReader::new(payload).u32()?;
        if result != 0 {
            return Err(AdsError::Ads(result));
        }
        Ok(())
    }
}

impl Default for AmsRouter {
    fn default() -> Self {
        AmsRouter::new()
    }
}
