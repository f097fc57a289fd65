//! PCI identification of VirtIO functions.
//!
//! Ref: 4.1.2 PCI Device Discovery

use core::fmt;

/// Vendor ID of every VirtIO function.
pub const VIRTIO_VENDOR_ID: u16 = 0x1af4;

const TRANSITIONAL_FIRST: u16 = 0x1000;
const TRANSITIONAL_LAST: u16 = 0x103f;
const MODERN_BASE: u16 = 0x1040;
const MODERN_LAST: u16 = 0x107f;

/// The first two words of a PCI configuration header.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciVendorDevice {
    pub vendor_id: u16,
    pub device_id: u16,
}

impl PciVendorDevice {
    pub const fn new(vendor_id: u16, device_id: u16) -> Self {
        PciVendorDevice { vendor_id, device_id }
    }

    pub fn is_virtio(&self) -> bool {
        self.vendor_id == VIRTIO_VENDOR_ID && (TRANSITIONAL_FIRST..=MODERN_LAST).contains(&self.device_id)
    }

    /// The VirtIO device ID, from either the modern (`0x1040 + id`) or the
    /// transitional PCI device ID.
    pub fn virtio_device_id(&self) -> Option<u16> {
        if !self.is_virtio() {
            return None;
        }
        match self.device_id {
            id @ MODERN_BASE..=MODERN_LAST => Some(id - MODERN_BASE),
            TRANSITIONAL_FIRST..=TRANSITIONAL_LAST => transitional_id(self.device_id),
            _ => None,
        }
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        self.virtio_device_id().map(DeviceType::from)
    }
}

impl fmt::Debug for PciVendorDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.device_id)
    }
}

// Ref: 4.1.2.3 Legacy Interfaces: A Note on PCI Device Discovery
fn transitional_id(device_id: u16) -> Option<u16> {
    match device_id {
        0x1000 => Some(1),
        0x1001 => Some(2),
        0x1002 => Some(5),
        0x1003 => Some(3),
        0x1004 => Some(8),
        0x1005 => Some(4),
        0x1009 => Some(9),
        _ => None,
    }
}

/// Device types this crate has names for.
///
/// Ref: 5 Device Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Network,
    Block,
    Console,
    Entropy,
    Balloon,
    Scsi,
    P9,
    Gpu,
    Input,
    Socket,
    Other(u16),
}

impl From<u16> for DeviceType {
    fn from(id: u16) -> Self {
        match id {
            1 => DeviceType::Network,
            2 => DeviceType::Block,
            3 => DeviceType::Console,
            4 => DeviceType::Entropy,
            5 => DeviceType::Balloon,
            8 => DeviceType::Scsi,
            9 => DeviceType::P9,
            16 => DeviceType::Gpu,
            18 => DeviceType::Input,
            19 => DeviceType::Socket,
            other => DeviceType::Other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modern_and_transitional_ids() {
        assert_eq!(PciVendorDevice::new(0x1af4, 0x1042).device_type(), Some(DeviceType::Block));
        assert_eq!(PciVendorDevice::new(0x1af4, 0x1001).device_type(), Some(DeviceType::Block));
        assert_eq!(PciVendorDevice::new(0x1af4, 0x1000).device_type(), Some(DeviceType::Network));
        assert_eq!(PciVendorDevice::new(0x1af4, 0x1050).device_type(), Some(DeviceType::Gpu));
        assert_eq!(
            PciVendorDevice::new(0x1af4, 0x107f).device_type(),
            Some(DeviceType::Other(0x3f))
        );
    }

    #[test]
    fn non_virtio_functions() {
        assert!(!PciVendorDevice::new(0x8086, 0x1042).is_virtio());
        assert!(!PciVendorDevice::new(0x1af4, 0x1100).is_virtio());
        assert_eq!(PciVendorDevice::new(0x1af4, 0x1100).virtio_device_id(), None);
        // inside the transitional range but unassigned
        assert_eq!(PciVendorDevice::new(0x1af4, 0x1020).virtio_device_id(), None);
    }
}
