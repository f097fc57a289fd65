//! The VirtIO PCI transport: one device behind its resolved capability regions.
//!
//! Ref: 4.1.4 Virtio Structure PCI Capabilities, 3.1.1 Driver Requirements:
//! Device Initialization
//!
//! The PCI capability walk happens elsewhere; [`PciRegions`] carries the
//! regions it found. A typical bring-up is [`VirtioPciTransport::begin_init`],
//! [`VirtioPciTransport::negotiate`], one
//! [`VirtioPciTransport::configure_queue`] per queue, then
//! [`VirtioPciTransport::driver_ok`].

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::{read_stable, BlkConfig, DeviceConfig};
use crate::dma::DmaAllocator;
use crate::error::{ConfigError, Error, NegotiationError, QueueConfigError, RegisterAccessError, StatusError};
use crate::features::{self, FeatureBits, Transport};
use crate::notify::{IsrRegion, IsrStatus, NotifyRegion};
use crate::pci::{DeviceType, PciVendorDevice};
use crate::queue::{self, QueueConfig, Virtqueue, NO_VECTOR};
use crate::regs::{CommonCfg, Mmio};
use crate::status::{DeviceState, StatusMachine};

/// Capability regions of one VirtIO PCI function, already mapped.
#[derive(Debug, Clone)]
pub struct PciRegions<M> {
    pub id: PciVendorDevice,
    /// VIRTIO_PCI_CAP_COMMON_CFG
    pub common: M,
    /// VIRTIO_PCI_CAP_NOTIFY_CFG
    pub notify: M,
    pub notify_off_multiplier: u32,
    /// VIRTIO_PCI_CAP_ISR_CFG
    pub isr: M,
    /// VIRTIO_PCI_CAP_DEVICE_CFG, absent for devices without one
    pub device: Option<M>,
}

pub struct VirtioPciTransport<M> {
    id: PciVendorDevice,
    common: CommonCfg<M>,
    notify: NotifyRegion<M>,
    isr: IsrRegion<M>,
    device: Option<DeviceConfig<M>>,
    status: StatusMachine,
    negotiated: FeatureBits,
    // Bumped on every device reset; queues created before it are stale.
    epoch: Arc<AtomicU32>,
}

impl<M: Mmio + Clone> VirtioPciTransport<M> {
    /// Wraps the regions without touching the device.
    pub fn new(regions: PciRegions<M>) -> Result<Self, RegisterAccessError> {
        if !regions.id.is_virtio() {
            log::warn!("{:?} is not a VirtIO function", regions.id);
        }
        Ok(VirtioPciTransport {
            id: regions.id,
            common: CommonCfg::new(regions.common)?,
            notify: NotifyRegion::new(regions.notify, regions.notify_off_multiplier),
            isr: IsrRegion::new(regions.isr)?,
            device: regions.device.map(DeviceConfig::new),
            status: StatusMachine::new(),
            negotiated: FeatureBits::EMPTY,
            epoch: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn id(&self) -> PciVendorDevice {
        self.id
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        self.id.device_type()
    }

    pub fn state(&self) -> DeviceState {
        self.status.state()
    }

    /// Features accepted by the last successful negotiation.
    pub fn negotiated(&self) -> FeatureBits {
        self.negotiated
    }

    pub fn num_queues(&self) -> Result<u16, RegisterAccessError> {
        self.common.num_queues()
    }

    pub fn common(&self) -> &CommonCfg<M> {
        &self.common
    }

    /// Features the device offers.
    pub fn offered_features(&mut self) -> Result<FeatureBits, NegotiationError> {
        features::device_features(&mut self.common)
    }

    /// Resets the device, then sets ACKNOWLEDGE and DRIVER.
    pub fn begin_init(&mut self) -> Result<(), StatusError> {
        log::info!("[VIRTIO] initializing {:?} ({:?})", self.id, self.device_type());
        self.reset_device()?;
        self.status.advance(&mut self.common, DeviceState::Acknowledge)?;
        self.status.advance(&mut self.common, DeviceState::Driver)?;
        Ok(())
    }

    pub fn negotiate(
        &mut self,
        required: FeatureBits,
        requested: FeatureBits,
    ) -> Result<FeatureBits, NegotiationError> {
        let accepted = features::negotiate(&mut self.common, &mut self.status, required, requested)?;
        self.negotiated = accepted;
        Ok(accepted)
    }

    /// Sets up and enables queue `index`.
    ///
    /// Allowed once features are negotiated; after DRIVER_OK only when
    /// VIRTIO_F_RING_RESET was negotiated.
    pub fn configure_queue<A>(
        &mut self,
        index: u16,
        config: QueueConfig,
        alloc: &mut A,
    ) -> Result<Virtqueue<M>, QueueConfigError>
    where
        A: DmaAllocator + ?Sized,
    {
        let state = match self.status.poll(&self.common) {
            Ok(state) => state,
            Err(StatusError::Register(err)) => return Err(err.into()),
            Err(_) => self.status.state(),
        };
        let allowed = match state {
            DeviceState::FeaturesOk => true,
            DeviceState::DriverOk => self.negotiated.has(Transport::RING_RESET),
            _ => false,
        };
        if !allowed {
            return Err(QueueConfigError::WrongState { state });
        }
        let notification_data = self.negotiated.has(Transport::NOTIFICATION_DATA);
        queue::configure(
            &mut self.common,
            &self.notify,
            index,
            config,
            notification_data,
            self.epoch.clone(),
            alloc,
        )
    }

    /// Routes configuration change interrupts to `vector`.
    ///
    /// Returns whether the device accepted the vector.
    pub fn set_config_msix_vector(&mut self, vector: u16) -> Result<bool, RegisterAccessError> {
        self.common.set_config_msix_vector(vector)?;
        let accepted = self.common.config_msix_vector()? == vector;
        if !accepted && vector != NO_VECTOR {
            log::warn!("device rejected config MSI-X vector {}", vector);
        }
        Ok(accepted)
    }

    pub fn driver_ok(&mut self) -> Result<(), StatusError> {
        self.status.advance(&mut self.common, DeviceState::DriverOk)?;
        log::info!("[VIRTIO] {:?} is live, features {:?}", self.id, self.negotiated);
        Ok(())
    }

    /// Gives up on the device by setting FAILED.
    pub fn fail(&mut self) -> Result<(), StatusError> {
        self.status.fail(&mut self.common)
    }

    /// Notices a DEVICE_NEEDS_RESET raised by the device.
    pub fn poll_status(&mut self) -> Result<DeviceState, StatusError> {
        self.status.poll(&self.common)
    }

    /// Reads and thereby acknowledges the ISR status.
    pub fn read_isr(&self) -> Result<IsrStatus, RegisterAccessError> {
        self.isr.read_and_ack()
    }

    /// Reads a device configuration block under the generation guard.
    pub fn read_device_config<T, F>(&self, mut read: F) -> Result<T, ConfigError>
    where
        F: FnMut(&DeviceConfig<M>) -> Result<T, RegisterAccessError>,
    {
        let device = self.device.as_ref().ok_or(ConfigError::NoDeviceConfig)?;
        read_stable(&self.common, || read(device))
    }

    pub fn blk_config(&self) -> Result<BlkConfig, ConfigError> {
        self.read_device_config(BlkConfig::read)
    }

    fn reset_device(&mut self) -> Result<(), StatusError> {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.negotiated = FeatureBits::EMPTY;
        self.status.reset(&mut self.common)
    }

    /// Resets the whole device and hands the memory of `queues` back to `alloc`.
    ///
    /// Every queue of this transport becomes invalid, including ones not
    /// passed here. A failed release does not stop the others; the first
    /// error is returned once all of `queues` were tried. If the device never
    /// acknowledges the reset the rings stay allocated, since the device may
    /// still be using them, and the transport is left [`DeviceState::Failed`].
    pub fn reset<A, I>(&mut self, alloc: &mut A, queues: I) -> Result<(), Error>
    where
        A: DmaAllocator + ?Sized,
        I: IntoIterator<Item = Virtqueue<M>>,
    {
        if let Err(err) = self.reset_device() {
            log::error!("device reset failed, leaking queue memory: {}", err);
            return Err(err.into());
        }
        let mut first = None;
        for queue in queues {
            if let Err(err) = self.release_queue(queue, alloc) {
                first.get_or_insert(Error::from(err));
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resets a single queue through `queue_reset`, leaving the device running.
    ///
    /// The queue is invalid afterwards; release it with
    /// [`VirtioPciTransport::release_queue`] and configure it anew.
    pub fn disable_queue(&mut self, queue: &Virtqueue<M>) -> Result<(), QueueConfigError> {
        if !self.negotiated.has(Transport::RING_RESET) {
            return Err(QueueConfigError::ResetUnsupported);
        }
        queue::reset(&mut self.common, queue.index())?;
        queue.detach();
        Ok(())
    }

    /// Returns the ring memory of a queue to `alloc`.
    ///
    /// Fails with [`QueueConfigError::StillLive`] while the device may still
    /// access the queue; its memory is then leaked.
    pub fn release_queue<A>(&mut self, queue: Virtqueue<M>, alloc: &mut A) -> Result<(), QueueConfigError>
    where
        A: DmaAllocator + ?Sized,
    {
        let index = queue.index();
        if !queue.belongs_to(&self.epoch) || !queue.is_detached() {
            log::warn!("queue {} is still live, leaking its ring memory", index);
            return Err(QueueConfigError::StillLive { index });
        }
        alloc.free(queue.region().paddr())?;
        log::debug!("queue {}: ring memory released", index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HeapDmaAllocator;
    use crate::error::PollError;
    use crate::features::BlockFeatures;
    use crate::queue::Buffer;
    use crate::sim::{SimDevice, SimMmio};
    use crate::status::DeviceStatus;

    const BLOCK: PciVendorDevice = PciVendorDevice::new(0x1af4, 0x1042);

    fn transport(features: u64, sizes: &[u16]) -> (SimDevice, VirtioPciTransport<SimMmio>) {
        let device = SimDevice::new(features, sizes);
        let transport = VirtioPciTransport::new(device.regions(BLOCK)).unwrap();
        (device, transport)
    }

    fn ready(transport: &mut VirtioPciTransport<SimMmio>, requested: FeatureBits) {
        transport.begin_init().unwrap();
        transport.negotiate(Transport::VERSION_1.into(), requested).unwrap();
    }

    #[test]
    fn full_bring_up() {
        let offered = Transport::VERSION_1.bits() | BlockFeatures::FLUSH.bits();
        let (device, mut transport) = transport(offered, &[128]);
        let mut dma = HeapDmaAllocator::with_capacity(64 * 1024).unwrap();
        assert_eq!(transport.device_type(), Some(DeviceType::Block));

        ready(&mut transport, FeatureBits::from_bits(offered));
        let queue = transport.configure_queue(0, QueueConfig::new(64), &mut dma).unwrap();
        transport.driver_ok().unwrap();

        assert_eq!(transport.state(), DeviceState::DriverOk);
        assert!(device.status().contains(DeviceStatus::DRIVER_OK));
        assert_eq!(transport.negotiated().bits(), offered);
        assert_eq!(queue.size(), 64);
    }

    #[test]
    fn queues_need_negotiated_features() {
        let (_device, mut transport) = transport(Transport::VERSION_1.bits(), &[8]);
        let mut dma = HeapDmaAllocator::with_capacity(64 * 1024).unwrap();
        transport.begin_init().unwrap();
        assert_eq!(
            transport.configure_queue(0, QueueConfig::new(8), &mut dma).unwrap_err(),
            QueueConfigError::WrongState { state: DeviceState::Driver }
        );

        transport.negotiate(FeatureBits::EMPTY, Transport::VERSION_1.into()).unwrap();
        transport.driver_ok().unwrap();
        assert_eq!(
            transport.configure_queue(0, QueueConfig::new(8), &mut dma).unwrap_err(),
            QueueConfigError::WrongState { state: DeviceState::DriverOk }
        );
    }

    #[test]
    fn config_msix_vector_readback() {
        let (device, mut transport) = transport(Transport::VERSION_1.bits(), &[8]);
        device.set_msix_vectors(4);
        assert!(transport.set_config_msix_vector(3).unwrap());
        assert!(!transport.set_config_msix_vector(9).unwrap());
        assert_eq!(device.config_msix_vector(), NO_VECTOR);
    }

    #[test]
    fn reset_invalidates_and_frees_queues() {
        let (_device, mut transport) = transport(Transport::VERSION_1.bits(), &[8, 8]);
        let mut dma = HeapDmaAllocator::with_capacity(64 * 1024).unwrap();
        ready(&mut transport, Transport::VERSION_1.into());
        let q0 = transport.configure_queue(0, QueueConfig::new(8), &mut dma).unwrap();
        let q1 = transport.configure_queue(1, QueueConfig::new(8), &mut dma).unwrap();
        assert_eq!(dma.live_regions(), 2);

        assert_eq!(
            transport.release_queue(q1, &mut dma),
            Err(QueueConfigError::StillLive { index: 1 })
        );
        transport.reset(&mut dma, [q0]).unwrap();
        assert_eq!(transport.state(), DeviceState::Reset);
        assert_eq!(transport.negotiated(), FeatureBits::EMPTY);
        // q1 was leaked on purpose above
        assert_eq!(dma.live_regions(), 1);
    }

    #[test]
    fn reset_releases_remaining_queues_after_a_failure() {
        let (_device, mut transport) = transport(Transport::VERSION_1.bits(), &[8, 8]);
        let (_other_device, mut other) = self::transport(Transport::VERSION_1.bits(), &[8]);
        let mut dma = HeapDmaAllocator::with_capacity(64 * 1024).unwrap();
        let mut other_dma = HeapDmaAllocator::with_capacity(64 * 1024).unwrap();
        ready(&mut transport, Transport::VERSION_1.into());
        ready(&mut other, Transport::VERSION_1.into());
        let foreign = other.configure_queue(0, QueueConfig::new(8), &mut other_dma).unwrap();
        let q0 = transport.configure_queue(0, QueueConfig::new(8), &mut dma).unwrap();
        let q1 = transport.configure_queue(1, QueueConfig::new(8), &mut dma).unwrap();

        assert_eq!(
            transport.reset(&mut dma, [foreign, q0, q1]),
            Err(Error::QueueConfig(QueueConfigError::StillLive { index: 0 }))
        );
        assert_eq!(dma.live_regions(), 0);
        assert_eq!(other_dma.live_regions(), 1);
        assert_eq!(transport.state(), DeviceState::Reset);
    }

    #[test]
    fn reset_timeout_blocks_queue_setup() {
        let (device, mut transport) = transport(Transport::VERSION_1.bits(), &[8]);
        let mut dma = HeapDmaAllocator::with_capacity(64 * 1024).unwrap();
        ready(&mut transport, Transport::VERSION_1.into());
        assert_eq!(transport.state(), DeviceState::FeaturesOk);

        device.set_reset_delay(crate::status::RESET_POLL_LIMIT + 1);
        assert_eq!(
            transport.reset(&mut dma, core::iter::empty()),
            Err(Error::Status(StatusError::ResetTimeout { polls: crate::status::RESET_POLL_LIMIT }))
        );
        assert_eq!(transport.state(), DeviceState::Failed);
        assert_eq!(
            transport.configure_queue(0, QueueConfig::new(8), &mut dma).unwrap_err(),
            QueueConfigError::WrongState { state: DeviceState::Failed }
        );
        assert_eq!(dma.live_regions(), 0);
    }

    #[test]
    fn stale_queue_reports_reset() {
        let (_device, mut transport) = transport(Transport::VERSION_1.bits(), &[8]);
        let mut dma = HeapDmaAllocator::with_capacity(64 * 1024).unwrap();
        ready(&mut transport, Transport::VERSION_1.into());
        let queue = transport.configure_queue(0, QueueConfig::new(8), &mut dma).unwrap();
        transport.begin_init().unwrap();
        assert_eq!(queue.poll_completions().next(), Some(Err(PollError::QueueReset)));
        transport.release_queue(queue, &mut dma).unwrap();
        assert_eq!(dma.live_regions(), 0);
    }

    #[test]
    fn disable_queue_needs_ring_reset() {
        let (device, mut transport) = transport(Transport::VERSION_1.bits() | Transport::RING_RESET.bits(), &[8]);
        let mut dma = HeapDmaAllocator::with_capacity(64 * 1024).unwrap();
        ready(&mut transport, Transport::VERSION_1.into());
        let queue = transport.configure_queue(0, QueueConfig::new(8), &mut dma).unwrap();
        assert_eq!(transport.disable_queue(&queue), Err(QueueConfigError::ResetUnsupported));

        transport.begin_init().unwrap();
        transport.release_queue(queue, &mut dma).unwrap();
        transport
            .negotiate(FeatureBits::EMPTY, FeatureBits::from(Transport::VERSION_1 | Transport::RING_RESET))
            .unwrap();
        let queue = transport.configure_queue(0, QueueConfig::new(8), &mut dma).unwrap();
        transport.driver_ok().unwrap();

        transport.disable_queue(&queue).unwrap();
        assert!(!device.queue(0).enabled);
        assert_eq!(queue.submit(&[Buffer::readable(0, 1)]), Err(crate::SubmitError::QueueInvalid));
        transport.release_queue(queue, &mut dma).unwrap();

        let queue = transport.configure_queue(0, QueueConfig::new(4), &mut dma).unwrap();
        assert_eq!(queue.size(), 4);
        assert_eq!(dma.live_regions(), 1);
    }

    #[test]
    fn notification_data_selects_wide_doorbell() {
        let offered = Transport::VERSION_1.bits() | Transport::NOTIFICATION_DATA.bits();
        let (device, mut transport) = transport(offered, &[8, 8]);
        let mut dma = HeapDmaAllocator::with_capacity(64 * 1024).unwrap();
        ready(&mut transport, FeatureBits::from_bits(offered));
        let queue = transport.configure_queue(1, QueueConfig::new(8), &mut dma).unwrap();
        transport.driver_ok().unwrap();

        queue.submit(&[Buffer::readable(0x1000, 4)]).unwrap();
        let rung = device.notifications();
        assert_eq!(rung.len(), 1);
        assert_eq!(rung[0].offset, 4);
        assert_eq!(rung[0].value, 1 | 1 << 16);
    }

    #[test]
    fn device_config_needs_region() {
        let device = SimDevice::new(Transport::VERSION_1.bits(), &[]);
        let mut regions = device.regions(BLOCK);
        regions.device = None;
        let transport = VirtioPciTransport::new(regions).unwrap();
        assert_eq!(transport.blk_config(), Err(ConfigError::NoDeviceConfig));
    }

    #[test]
    fn isr_is_acknowledged_by_reading() {
        let (device, transport) = transport(Transport::VERSION_1.bits(), &[]);
        device.raise_interrupt(IsrStatus::DEVICE_CONFIG);
        assert_eq!(transport.read_isr().unwrap(), IsrStatus::DEVICE_CONFIG);
        assert_eq!(transport.read_isr().unwrap(), IsrStatus::empty());
    }
}
