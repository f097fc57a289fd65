use thiserror::Error;

use crate::features::FeatureBits;
use crate::status::DeviceState;

/// An access to a mapped capability region that the region cannot serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegisterAccessError {
    #[error("{width}-byte access at offset {offset:#x} lies outside the {len:#x}-byte region")]
    OutOfRange { offset: usize, width: usize, len: usize },
    #[error("{width}-byte access at offset {offset:#x} is not naturally aligned")]
    Misaligned { offset: usize, width: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StatusError {
    #[error("cannot move device status from {from:?} to {to:?}")]
    InvalidTransition { from: DeviceState, to: DeviceState },
    #[error("device status did not read back as zero after {polls} polls")]
    ResetTimeout { polls: usize },
    #[error("device has set DEVICE_NEEDS_RESET")]
    NeedsReset,
    #[error(transparent)]
    Register(#[from] RegisterAccessError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("device does not offer required features {missing:?}")]
    MissingRequiredFeature { missing: FeatureBits },
    #[error("device cleared FEATURES_OK for {accepted:?}")]
    FeaturesRejected { accepted: FeatureBits },
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Register(#[from] RegisterAccessError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DmaError {
    #[error("no DMA memory left for {size} bytes aligned to {align}")]
    OutOfMemory { size: usize, align: usize },
    #[error("invalid DMA request of {size} bytes aligned to {align}")]
    InvalidLayout { size: usize, align: usize },
    #[error("physical address {paddr:#x} was not handed out by this allocator")]
    UnknownRegion { paddr: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueConfigError {
    #[error("queue {index} does not exist, device has {num_queues} queues")]
    NoSuchQueue { index: u16, num_queues: u16 },
    #[error("device reports queue {index} as unavailable")]
    QueueUnavailable { index: u16 },
    #[error("queue {index} is already enabled")]
    AlreadyEnabled { index: u16 },
    #[error("queue size {requested} cannot be used with device maximum {device_max}")]
    UnsupportedQueueSize { requested: u16, device_max: u16 },
    #[error("device rejected MSI-X vector {vector} for queue {index}")]
    MsixVectorRejected { index: u16, vector: u16 },
    #[error("doorbell of queue {index} at offset {offset:#x} lies outside the {len:#x}-byte notify region")]
    NotifyOutOfRange { index: u16, offset: usize, len: usize },
    #[error("VIRTIO_F_RING_RESET was not negotiated")]
    ResetUnsupported,
    #[error("device did not complete the reset of queue {index}")]
    ResetTimeout { index: u16 },
    #[error("queue {index} is still live and cannot be released")]
    StillLive { index: u16 },
    #[error("queues cannot be configured in state {state:?}")]
    WrongState { state: DeviceState },
    #[error(transparent)]
    Dma(#[from] DmaError),
    #[error(transparent)]
    Register(#[from] RegisterAccessError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("chain needs {needed} descriptors but only {free} are free")]
    QueueFull { needed: usize, free: usize },
    #[error("cannot submit an empty descriptor chain")]
    EmptyChain,
    #[error("queue was invalidated and must be recreated")]
    QueueInvalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("used ring names head {head} which is not an outstanding chain")]
    CorruptedRing { head: u32 },
    #[error("device has set DEVICE_NEEDS_RESET")]
    DeviceNeedsReset,
    #[error("queue was reset by the driver")]
    QueueReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("config generation kept changing over {attempts} read attempts")]
    Unstable { attempts: usize },
    #[error("device exposes no device-specific configuration region")]
    NoDeviceConfig,
    #[error(transparent)]
    Register(#[from] RegisterAccessError),
}

/// Any failure of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Register(#[from] RegisterAccessError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Dma(#[from] DmaError),
    #[error(transparent)]
    QueueConfig(#[from] QueueConfigError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
