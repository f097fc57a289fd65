//! Notification and ISR status capability regions.
//!
//! Ref: 4.1.4.4 Notification structure layout, 4.1.4.5 ISR status capability

use crate::error::{QueueConfigError, RegisterAccessError};
use crate::regs::{Mmio, Registers};

/// The notification capability region and its `notify_off_multiplier`.
#[derive(Debug, Clone)]
pub struct NotifyRegion<M> {
    mmio: M,
    multiplier: u32,
}

impl<M: Mmio + Clone> NotifyRegion<M> {
    pub fn new(mmio: M, multiplier: u32) -> Self {
        NotifyRegion { mmio, multiplier }
    }

    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }

    /// Builds the doorbell of queue `index` from its `queue_notify_off`.
    ///
    /// The doorbell is 2 bytes wide, or 4 with VIRTIO_F_NOTIFICATION_DATA, and
    /// must lie within the region.
    pub fn notifier(
        &self,
        index: u16,
        notify_off: u16,
        notification_data: bool,
    ) -> Result<Notifier<M>, QueueConfigError> {
        let len = self.mmio.len();
        let width = if notification_data { 4 } else { 2 };
        let offset = usize::from(notify_off).saturating_mul(self.multiplier as usize);
        let fits = offset.checked_add(width).map_or(false, |end| end <= len);
        if !fits || offset % width != 0 {
            return Err(QueueConfigError::NotifyOutOfRange { index, offset, len });
        }
        Ok(Notifier { mmio: self.mmio.clone(), offset, index, notification_data })
    }
}

/// Doorbell of one queue.
#[derive(Debug, Clone)]
pub struct Notifier<M> {
    mmio: M,
    offset: usize,
    index: u16,
    notification_data: bool,
}

impl<M: Mmio> Notifier<M> {
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Rings the doorbell. `next_avail` is the available index just published.
    pub fn notify(&self, next_avail: u16) {
        if self.notification_data {
            // le32 { vqn: 16, next_off: 15, next_wrap: 1 }; for split rings
            // next_off and next_wrap together are the full available index.
            let data = u32::from(self.index) | u32::from(next_avail) << 16;
            self.mmio.write32(self.offset, data.to_le());
        } else {
            self.mmio.write16(self.offset, self.index.to_le());
        }
    }
}

bitflags::bitflags! {
    /// ISR status bits.
    pub struct IsrStatus: u8 {
        /// A virtqueue has new used buffers
        const QUEUE = 1;
        /// The device-specific configuration changed
        const DEVICE_CONFIG = 2;
    }
}

/// The ISR status capability region.
#[derive(Debug, Clone)]
pub struct IsrRegion<M> {
    regs: Registers<M>,
}

impl<M: Mmio> IsrRegion<M> {
    pub fn new(mmio: M) -> Result<Self, RegisterAccessError> {
        let regs = Registers::new(mmio);
        if regs.len() < 1 {
            return Err(RegisterAccessError::OutOfRange { offset: 0, width: 1, len: regs.len() });
        }
        Ok(IsrRegion { regs })
    }

    /// Reads the ISR status. The read itself acknowledges the interrupt.
    pub fn read_and_ack(&self) -> Result<IsrStatus, RegisterAccessError> {
        Ok(IsrStatus::from_bits_truncate(self.regs.read_u8(0)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimNotification};

    #[test]
    fn doorbell_offset_scales_with_multiplier() {
        let device = SimDevice::new(0, &[8, 8, 8]);
        let notify = NotifyRegion::new(device.notify(), 4);
        let notifier = notify.notifier(2, 2, false).unwrap();
        assert_eq!(notifier.offset(), 8);
        notifier.notify(7);
        assert_eq!(device.notifications(), [SimNotification { offset: 8, value: 2 }]);
    }

    #[test]
    fn notification_data_carries_available_index() {
        let device = SimDevice::new(0, &[8, 8]);
        let notify = NotifyRegion::new(device.notify(), 4);
        notify.notifier(1, 1, true).unwrap().notify(0x8003);
        assert_eq!(device.notifications(), [SimNotification { offset: 4, value: 0x8003_0001 }]);
    }

    #[test]
    fn doorbell_outside_region_is_rejected() {
        let device = SimDevice::new(0, &[8]);
        let notify = NotifyRegion::new(device.notify(), 4);
        let len = device.notify().len();
        assert_eq!(
            notify.notifier(0, 1000, false).unwrap_err(),
            QueueConfigError::NotifyOutOfRange { index: 0, offset: 4000, len }
        );
    }

    #[test]
    fn isr_read_clears() {
        let device = SimDevice::new(0, &[8]);
        let isr = IsrRegion::new(device.isr()).unwrap();
        device.raise_interrupt(IsrStatus::QUEUE | IsrStatus::DEVICE_CONFIG);
        assert_eq!(isr.read_and_ack().unwrap(), IsrStatus::QUEUE | IsrStatus::DEVICE_CONFIG);
        assert!(isr.read_and_ack().unwrap().is_empty());
    }
}
