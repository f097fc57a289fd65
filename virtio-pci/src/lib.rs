//! VirtIO PCI modern transport core.
//!
//! The crate drives a VirtIO device whose PCI capabilities have already been
//! resolved to mapped regions: it walks the device status sequence, negotiates
//! features through the common configuration window, programs virtqueues and
//! runs the split ring protocol on them.
//!
//! Ref: Virtual I/O Device (VIRTIO) Version 1.2, 4.1 Virtio Over PCI Bus and
//! 2.7 Split Virtqueues.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod dma;
mod error;
pub mod features;
pub mod notify;
pub mod pci;
pub mod queue;
pub mod regs;
pub mod ring;
pub mod sim;
pub mod status;
pub mod transport;

pub use config::{BlkConfig, BlkGeometry, DeviceConfig, CONFIG_READ_ATTEMPTS};
pub use dma::{DmaAllocator, DmaRegion, HeapDmaAllocator};
pub use error::{
    ConfigError, DmaError, Error, NegotiationError, PollError, QueueConfigError,
    RegisterAccessError, StatusError, SubmitError,
};
pub use features::{BlockFeatures, FeatureBits, Transport};
pub use notify::IsrStatus;
pub use pci::{DeviceType, PciVendorDevice};
pub use queue::{Buffer, Completion, Completions, Direction, QueueConfig, Token, Virtqueue};
pub use regs::{Mmio, MmioRegion};
pub use status::{DeviceState, DeviceStatus};
pub use transport::{PciRegions, VirtioPciTransport};
