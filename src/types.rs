// types.rs - AMS addressing and ADS protocol value types
// =========================================================================

use crate::error::{AdsError, Result};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// TCP port of the ADS/AMS server on a TwinCAT device (0xBF02).
pub const ADS_TCP_SERVER_PORT: u16 = 48898;

/// Default per-port request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u32 = 5000;

/// First local AMS port handed out by [`crate::AmsRouter::open_port`].
pub const PORT_BASE: u16 = 30000;

/// Number of local AMS ports a router can have open at once.
pub const NUM_PORTS_MAX: usize = 8;

/// Well-known AMS ports inside a TwinCAT device.
pub mod ports {
    /// TwinCAT 2 PLC runtime 1.
    pub const PLC_RUNTIME_TC2: u16 = 801;
    /// TwinCAT 3 PLC runtime 1.
    pub const PLC_RUNTIME: u16 = 851;
    /// NC runtime.
    pub const NC: u16 = 500;
    /// System service (file access, routes, licensing).
    pub const SYSTEM_SERVICE: u16 = 10000;
    /// Local ADS router of the device.
    pub const ROUTER: u16 = 1;
}

/// ADS device states as carried by `READ_STATE` / `WRITE_CONTROL`.
pub mod ads_state {
    pub const INVALID: u16 = 0;
    pub const IDLE: u16 = 1;
    pub const RESET: u16 = 2;
    pub const INIT: u16 = 3;
    pub const START: u16 = 4;
    pub const RUN: u16 = 5;
    pub const STOP: u16 = 6;
    pub const SAVE_CFG: u16 = 7;
    pub const LOAD_CFG: u16 = 8;
    pub const POWER_FAILURE: u16 = 9;
    pub const POWER_GOOD: u16 = 10;
    pub const ERROR: u16 = 11;
    pub const SHUTDOWN: u16 = 12;
    pub const SUSPEND: u16 = 13;
    pub const RESUME: u16 = 14;
    pub const CONFIG: u16 = 15;
    pub const RECONFIG: u16 = 16;
}

/// Transmission modes for device notifications.
pub mod trans_mode {
    pub const NO_TRANS: u32 = 0;
    pub const CLIENT_CYCLE: u32 = 1;
    pub const CLIENT_ON_CHANGE: u32 = 2;
    /// Device samples cyclically at `cycle_time`.
    pub const SERVER_CYCLE: u32 = 3;
    /// Device samples when the value changes.
    pub const SERVER_ON_CHANGE: u32 = 4;
}

/// Six-octet logical node identifier inside AMS.
///
/// The textual form is six decimal octets separated by dots, the same
/// notation TwinCAT uses:
///
/// ```rust
/// use rust_ads::AmsNetId;
///
/// let id: AmsNetId = "5.24.37.144.1.1".parse().unwrap();
/// assert_eq!(id.to_string(), "5.24.37.144.1.1");
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AmsNetId(pub [u8; 6]);

impl AmsNetId {
    /// The all-zero NetId, meaning "not configured".
    pub const ZERO: AmsNetId = AmsNetId([0; 6]);

    /// Derives a NetId from a local IPv4 address by appending `.1.1`,
    /// the convention TwinCAT uses for self-assigned NetIds.
    pub fn from_ip(ip: Ipv4Addr) -> Self {
        let o = ip.octets();
        AmsNetId([o[0], o[1], o[2], o[3], 1, 1])
    }

    /// Returns true for the unset all-zero value.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl From<[u8; 6]> for AmsNetId {
    fn from(octets: [u8; 6]) -> Self {
        AmsNetId(octets)
    }
}

impl fmt::Display for AmsNetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(f, "{}.{}.{}.{}.{}.{}", o[0], o[1], o[2], o[3], o[4], o[5])
    }
}

impl FromStr for AmsNetId {
    type Err = AdsError;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split('.');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or(AdsError::InvalidParam("AmsNetId needs six octets"))?;
            *octet = part
                .parse()
                .map_err(|_| AdsError::InvalidParam("AmsNetId octet is not a decimal u8"))?;
        }
        if parts.next().is_some() {
            return Err(AdsError::InvalidParam("AmsNetId has more than six octets"));
        }
        Ok(AmsNetId(octets))
    }
}

/// Full AMS address: a node plus the AMS port of a service inside it.
///
/// The port selects a logical service (e.g. [`ports::PLC_RUNTIME`]), not a
/// TCP port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AmsAddr {
    pub net_id: AmsNetId,
    pub port: u16,
}

impl AmsAddr {
    pub fn new(net_id: AmsNetId, port: u16) -> Self {
        AmsAddr { net_id, port }
    }
}

impl fmt::Display for AmsAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.net_id, self.port)
    }
}

/// Device version triple returned by `READ_DEVICE_INFO`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdsVersion {
    pub version: u8,
    pub revision: u8,
    pub build: u16,
}

impl fmt::Display for AdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.version, self.revision, self.build)
    }
}

/// Parameters of a device notification subscription.
///
/// `length` is the sample size in bytes; `max_delay` and `cycle_time` are in
/// 100 ns units, as the device expects them on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdsNotificationAttrib {
    pub length: u32,
    pub trans_mode: u32,
    pub max_delay: u32,
    pub cycle_time: u32,
}

impl AdsNotificationAttrib {
    /// Cyclic sampling every `cycle_time` 100 ns units.
    pub fn server_cycle(length: u32, cycle_time: u32) -> Self {
        AdsNotificationAttrib {
            length,
            trans_mode: trans_mode::SERVER_CYCLE,
            max_delay: 0,
            cycle_time,
        }
    }

    /// Sampling on change, checked every `cycle_time` 100 ns units.
    pub fn server_on_change(length: u32, cycle_time: u32) -> Self {
        AdsNotificationAttrib {
            length,
            trans_mode: trans_mode::SERVER_ON_CHANGE,
            max_delay: 0,
            cycle_time,
        }
    }
}

/// Per-sample metadata handed to notification callbacks.
///
/// `timestamp` is the device's Windows FILETIME (100 ns ticks since
/// 1601-01-01), passed through unconverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdsNotificationHeader {
    pub timestamp: u64,
    pub sample_size: u32,
}
