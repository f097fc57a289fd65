//! The device status field and the initialization sequence it records.
//!
//! Ref: 2.1 Device Status Field, 3.1 Device Initialization

use core::hint::spin_loop;

use crate::error::StatusError;
use crate::regs::{offset, CommonCfg, Mmio};

/// Polls of `device_status` allowed for a reset to read back as zero.
pub const RESET_POLL_LIMIT: usize = 1000;

bitflags::bitflags! {
    /// The device status field.
    #[derive(Default)]
    pub struct DeviceStatus: u8 {
        /// Indicates that the guest OS has found the device and recognized it
        /// as a valid virtio device.
        const ACKNOWLEDGE = 1;

        /// Indicates that the guest OS knows how to drive the device.
        const DRIVER = 2;

        /// Indicates that the driver is set up and ready to drive the device.
        const DRIVER_OK = 4;

        /// Indicates that the driver has acknowledged all the features it
        /// understands, and feature negotiation is complete.
        const FEATURES_OK = 8;

        /// Indicates that the device has experienced an error from which it
        /// can’t recover.
        const DEVICE_NEEDS_RESET = 64;

        /// Indicates that something went wrong in the guest, and it has given
        /// up on the device. This could be an internal error, or the driver
        /// didn’t like the device for some reason, or even a fatal error
        /// during device operation.
        const FAILED = 128;
    }
}

/// Where the driver stands in the initialization sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Reset,
    Acknowledge,
    Driver,
    FeaturesOk,
    DriverOk,
    Failed,
    NeedsReset,
}

impl DeviceState {
    /// Interprets a raw status value, error bits taking precedence.
    pub fn from_status(status: DeviceStatus) -> Self {
        if status.contains(DeviceStatus::FAILED) {
            DeviceState::Failed
        } else if status.contains(DeviceStatus::DEVICE_NEEDS_RESET) {
            DeviceState::NeedsReset
        } else if status.contains(DeviceStatus::DRIVER_OK) {
            DeviceState::DriverOk
        } else if status.contains(DeviceStatus::FEATURES_OK) {
            DeviceState::FeaturesOk
        } else if status.contains(DeviceStatus::DRIVER) {
            DeviceState::Driver
        } else if status.contains(DeviceStatus::ACKNOWLEDGE) {
            DeviceState::Acknowledge
        } else {
            DeviceState::Reset
        }
    }

    fn next(self) -> Option<DeviceState> {
        match self {
            DeviceState::Reset => Some(DeviceState::Acknowledge),
            DeviceState::Acknowledge => Some(DeviceState::Driver),
            DeviceState::Driver => Some(DeviceState::FeaturesOk),
            DeviceState::FeaturesOk => Some(DeviceState::DriverOk),
            DeviceState::DriverOk | DeviceState::Failed | DeviceState::NeedsReset => None,
        }
    }

    fn bit(self) -> DeviceStatus {
        match self {
            DeviceState::Reset => DeviceStatus::empty(),
            DeviceState::Acknowledge => DeviceStatus::ACKNOWLEDGE,
            DeviceState::Driver => DeviceStatus::DRIVER,
            DeviceState::FeaturesOk => DeviceStatus::FEATURES_OK,
            DeviceState::DriverOk => DeviceStatus::DRIVER_OK,
            DeviceState::Failed => DeviceStatus::FAILED,
            DeviceState::NeedsReset => DeviceStatus::DEVICE_NEEDS_RESET,
        }
    }
}

/// Driver-side record of the status sequence.
///
/// Every forward step is a read-modify-write that sets exactly one bit; only
/// [`StatusMachine::reset`] clears bits.
#[derive(Debug)]
pub struct StatusMachine {
    state: DeviceState,
}

impl Default for StatusMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusMachine {
    pub const fn new() -> Self {
        StatusMachine { state: DeviceState::Reset }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Writes zero and waits for the device to read back zero.
    ///
    /// Every bit counts, reserved ones included. A device that never reads
    /// back zero leaves the machine in [`DeviceState::Failed`].
    pub fn reset<M: Mmio>(&mut self, cfg: &mut CommonCfg<M>) -> Result<(), StatusError> {
        let regs = cfg.registers();
        regs.write_u8(offset::DEVICE_STATUS, 0)?;
        for _ in 0..RESET_POLL_LIMIT {
            if regs.read_u8(offset::DEVICE_STATUS)? == 0 {
                log::debug!("device reset complete");
                self.state = DeviceState::Reset;
                return Ok(());
            }
            spin_loop();
        }
        log::error!("device did not complete reset after {} polls", RESET_POLL_LIMIT);
        self.state = DeviceState::Failed;
        Err(StatusError::ResetTimeout { polls: RESET_POLL_LIMIT })
    }

    pub(crate) fn expect_next(&self, to: DeviceState) -> Result<(), StatusError> {
        if self.state.next() == Some(to) {
            Ok(())
        } else {
            Err(StatusError::InvalidTransition { from: self.state, to })
        }
    }

    /// Sets the status bit of `to`, which must directly follow the current state.
    ///
    /// Bits the driver does not know about are written back unchanged.
    pub fn advance<M: Mmio>(
        &mut self,
        cfg: &mut CommonCfg<M>,
        to: DeviceState,
    ) -> Result<DeviceStatus, StatusError> {
        self.expect_next(to)?;
        let regs = cfg.registers();
        let current = regs.read_u8(offset::DEVICE_STATUS)?;
        if current & DeviceStatus::DEVICE_NEEDS_RESET.bits() != 0 {
            log::warn!("device needs reset, cannot enter {:?}", to);
            self.state = DeviceState::NeedsReset;
            return Err(StatusError::NeedsReset);
        }
        let raw = current | to.bit().bits();
        regs.write_u8(offset::DEVICE_STATUS, raw)?;
        log::debug!("device status {:?} -> {:?}", self.state, to);
        self.state = to;
        Ok(DeviceStatus::from_bits_truncate(raw))
    }

    /// Sets FAILED. The device stays unusable until reset.
    pub fn fail<M: Mmio>(&mut self, cfg: &mut CommonCfg<M>) -> Result<(), StatusError> {
        let regs = cfg.registers();
        let current = regs.read_u8(offset::DEVICE_STATUS)?;
        regs.write_u8(offset::DEVICE_STATUS, current | DeviceStatus::FAILED.bits())?;
        log::warn!("device marked FAILED in state {:?}", self.state);
        self.state = DeviceState::Failed;
        Ok(())
    }

    /// Re-reads the device, noticing a DEVICE_NEEDS_RESET raised since the last look.
    pub fn poll<M: Mmio>(&mut self, cfg: &CommonCfg<M>) -> Result<DeviceState, StatusError> {
        let current = cfg.device_status()?;
        if current.contains(DeviceStatus::DEVICE_NEEDS_RESET) && self.state != DeviceState::NeedsReset {
            log::warn!("device raised DEVICE_NEEDS_RESET in state {:?}", self.state);
            self.state = DeviceState::NeedsReset;
        }
        Ok(self.state)
    }
}

/// Read-only handle on `device_status` held by each virtqueue.
#[derive(Debug, Clone)]
pub(crate) struct StatusProbe<M> {
    mmio: M,
}

impl<M: Mmio> StatusProbe<M> {
    /// `mmio` must be a common configuration region already validated by
    /// [`CommonCfg::new`].
    pub(crate) fn new(mmio: M) -> Self {
        StatusProbe { mmio }
    }

    pub(crate) fn needs_reset(&self) -> bool {
        DeviceStatus::from_bits_truncate(self.mmio.read8(offset::DEVICE_STATUS))
            .contains(DeviceStatus::DEVICE_NEEDS_RESET)
    }
}
