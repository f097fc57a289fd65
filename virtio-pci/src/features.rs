//! Feature bits and their negotiation.
//!
//! Ref: 2.2 Feature Bits, 3.1.1 Driver Requirements: Device Initialization

use core::fmt;
use core::ops::{BitAnd, BitOr};

use crate::error::NegotiationError;
use crate::regs::{CommonCfg, Mmio};
use crate::status::{DeviceState, DeviceStatus, StatusMachine};

/// A 64-bit feature set as exchanged through the two 32-bit select windows.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FeatureBits(u64);

impl FeatureBits {
    pub const EMPTY: FeatureBits = FeatureBits(0);

    pub const fn from_bits(bits: u64) -> Self {
        FeatureBits(bits)
    }

    pub const fn from_halves(low: u32, high: u32) -> Self {
        FeatureBits((high as u64) << 32 | low as u64)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn low(self) -> u32 {
        self.0 as u32
    }

    pub const fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: FeatureBits) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_subset_of(self, other: FeatureBits) -> bool {
        other.contains(self)
    }

    pub const fn difference(self, other: FeatureBits) -> Self {
        FeatureBits(self.0 & !other.0)
    }

    pub fn has(self, transport: Transport) -> bool {
        self.contains(transport.into())
    }
}

impl fmt::Debug for FeatureBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeatureBits({:#018x})", self.0)
    }
}

impl BitAnd for FeatureBits {
    type Output = FeatureBits;
    fn bitand(self, rhs: FeatureBits) -> FeatureBits {
        FeatureBits(self.0 & rhs.0)
    }
}

impl BitOr for FeatureBits {
    type Output = FeatureBits;
    fn bitor(self, rhs: FeatureBits) -> FeatureBits {
        FeatureBits(self.0 | rhs.0)
    }
}

impl From<Transport> for FeatureBits {
    fn from(flags: Transport) -> Self {
        FeatureBits(flags.bits())
    }
}

impl From<BlockFeatures> for FeatureBits {
    fn from(flags: BlockFeatures) -> Self {
        FeatureBits(flags.bits())
    }
}

bitflags::bitflags! {
    /// Device-independent feature bits.
    ///
    /// Ref: 6 Reserved Feature Bits
    pub struct Transport: u64 {
        /// The driver can use descriptors with the INDIRECT flag set
        const RING_INDIRECT_DESC = 1 << 28;
        /// Enables the used_event and avail_event fields
        const RING_EVENT_IDX = 1 << 29;
        /// The device complies with VirtIO 1.x rather than the legacy interface
        ///
        /// Mandatory for the modern PCI transport.
        const VERSION_1 = 1 << 32;
        /// The device can be used on a platform where access to memory is
        /// limited or translated
        const ACCESS_PLATFORM = 1 << 33;
        /// Support for the packed virtqueue layout
        const RING_PACKED = 1 << 34;
        /// Buffers are used by the device in the order they were made available
        const IN_ORDER = 1 << 35;
        /// Memory accesses by the driver and device are ordered as by the platform
        const ORDER_PLATFORM = 1 << 36;
        /// The device supports single root I/O virtualization
        const SR_IOV = 1 << 37;
        /// The driver passes extra data in its device notifications
        const NOTIFICATION_DATA = 1 << 38;
        /// The driver can reset a queue individually
        const RING_RESET = 1 << 40;
        /// The device exposes administration virtqueues
        const ADMIN_VQ = 1 << 41;
    }
}

bitflags::bitflags! {
    /// Block device feature bits.
    ///
    /// Ref: 5.2.3 Feature bits
    pub struct BlockFeatures: u64 {
        const SIZE_MAX = 1 << 1;
        const SEG_MAX = 1 << 2;
        const GEOMETRY = 1 << 4;
        const RO = 1 << 5;
        const BLK_SIZE = 1 << 6;
        const FLUSH = 1 << 9;
        const TOPOLOGY = 1 << 10;
        const CONFIG_WCE = 1 << 11;
        const MQ = 1 << 12;
        const DISCARD = 1 << 13;
        const WRITE_ZEROES = 1 << 14;
        const LIFETIME = 1 << 15;
        const SECURE_ERASE = 1 << 16;
        const ZONED = 1 << 17;
    }
}

/// Reads the full 64-bit set of features the device offers.
pub fn device_features<M: Mmio>(cfg: &mut CommonCfg<M>) -> Result<FeatureBits, NegotiationError> {
    let low = cfg.device_features(0)?;
    let high = cfg.device_features(1)?;
    Ok(FeatureBits::from_halves(low, high))
}

/// Negotiates features with a device whose status has reached DRIVER.
///
/// The accepted set is `requested & offered`. `VERSION_1` is always part of
/// `required`, so callers must also request it. On success the device status
/// carries FEATURES_OK; on any failure past the status check the driver sets
/// FAILED.
pub fn negotiate<M: Mmio>(
    cfg: &mut CommonCfg<M>,
    status: &mut StatusMachine,
    required: FeatureBits,
    requested: FeatureBits,
) -> Result<FeatureBits, NegotiationError> {
    status.expect_next(DeviceState::FeaturesOk)?;

    let offered = device_features(cfg)?;
    let required = required | Transport::VERSION_1.into();
    let accepted = requested & offered;
    log::debug!("features offered {:?}, requested {:?}, accepted {:?}", offered, requested, accepted);

    if !accepted.contains(required) {
        let missing = required.difference(accepted);
        log::error!("device lacks required features {:?}", missing);
        status.fail(cfg)?;
        return Err(NegotiationError::MissingRequiredFeature { missing });
    }

    cfg.set_driver_features(0, accepted.low())?;
    cfg.set_driver_features(1, accepted.high())?;
    status.advance(cfg, DeviceState::FeaturesOk)?;

    // The device clears FEATURES_OK when it cannot operate with this subset.
    if !cfg.device_status()?.contains(DeviceStatus::FEATURES_OK) {
        log::error!("device rejected features {:?}", accepted);
        status.fail(cfg)?;
        return Err(NegotiationError::FeaturesRejected { accepted });
    }
    Ok(accepted)
}
