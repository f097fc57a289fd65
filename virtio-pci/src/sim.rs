//! A simulated VirtIO PCI device.
//!
//! [`SimDevice`] models the device side of the common configuration, notify,
//! ISR and device configuration regions in memory, and plays the device role
//! on split rings that live in identity-mapped memory (as handed out by
//! [`crate::HeapDmaAllocator::with_capacity`]). It is meant for tests and for
//! exercising drivers without hardware.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use spin::Mutex;

use crate::notify::IsrStatus;
use crate::pci::PciVendorDevice;
use crate::queue::{Buffer, NO_VECTOR};
use crate::regs::{offset, Mmio, COMMON_CFG_LEN};
use crate::ring::{AvailFlags, DescFlags, UsedFlags};
use crate::status::DeviceStatus;
use crate::transport::PciRegions;

/// Device-side state of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimQueue {
    pub max_size: u16,
    pub size: u16,
    pub msix_vector: u16,
    pub enabled: bool,
    pub desc: u64,
    pub driver: u64,
    pub device: u64,
    /// `queue_reset` reads back 1 after a queue reset until re-enabled.
    pub reset: bool,
    last_avail: u16,
}

impl SimQueue {
    fn new(max_size: u16) -> Self {
        SimQueue {
            max_size,
            size: max_size,
            msix_vector: NO_VECTOR,
            enabled: false,
            desc: 0,
            driver: 0,
            device: 0,
            reset: false,
            last_avail: 0,
        }
    }

    fn clear(&mut self) {
        *self = SimQueue::new(self.max_size);
    }
}

/// One doorbell write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimNotification {
    pub offset: usize,
    pub value: u32,
}

/// A descriptor chain taken off an available ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimChain {
    pub head: u16,
    pub buffers: Vec<Buffer>,
}

#[derive(Debug)]
struct SimState {
    device_features: u64,
    device_feature_select: u32,
    driver_features: u64,
    driver_feature_select: u32,
    config_msix_vector: u16,
    status: u8,
    reject_features: bool,
    reset_delay: usize,
    stale_reads: usize,
    stale_status: u8,
    config_generation: u8,
    tears_remaining: usize,
    pending_tear: bool,
    msix_vectors: u16,
    queue_select: u16,
    queues: Vec<SimQueue>,
    isr: u8,
    notifications: Vec<SimNotification>,
    device_config: Vec<u8>,
}

impl SimState {
    fn reset(&mut self) {
        self.device_feature_select = 0;
        self.driver_features = 0;
        self.driver_feature_select = 0;
        self.config_msix_vector = NO_VECTOR;
        self.queue_select = 0;
        self.isr = 0;
        for queue in &mut self.queues {
            queue.clear();
        }
    }

    fn selected(&mut self) -> Option<&mut SimQueue> {
        self.queues.get_mut(usize::from(self.queue_select))
    }

    fn read_status(&mut self) -> u8 {
        if self.stale_reads > 0 {
            self.stale_reads -= 1;
            self.stale_status
        } else {
            self.status
        }
    }

    fn write_status(&mut self, value: u8) {
        if value == 0 {
            self.stale_status = self.status;
            self.stale_reads = self.reset_delay;
            self.status = 0;
            self.reset();
            return;
        }
        let mut status = value;
        if self.reject_features {
            status &= !DeviceStatus::FEATURES_OK.bits();
        }
        self.status = status;
    }

    fn read_common(&mut self, at: usize) -> u32 {
        match at {
            offset::DEVICE_FEATURE_SELECT => self.device_feature_select,
            offset::DEVICE_FEATURE => match self.device_feature_select {
                0 => self.device_features as u32,
                1 => (self.device_features >> 32) as u32,
                _ => 0,
            },
            offset::DRIVER_FEATURE_SELECT => self.driver_feature_select,
            offset::DRIVER_FEATURE => match self.driver_feature_select {
                0 => self.driver_features as u32,
                1 => (self.driver_features >> 32) as u32,
                _ => 0,
            },
            offset::CONFIG_MSIX_VECTOR => u32::from(self.config_msix_vector),
            offset::NUM_QUEUES => self.queues.len() as u32,
            offset::DEVICE_STATUS => u32::from(self.read_status()),
            offset::CONFIG_GENERATION => {
                if self.pending_tear {
                    self.pending_tear = false;
                    self.tears_remaining -= 1;
                    self.config_generation = self.config_generation.wrapping_add(1);
                }
                u32::from(self.config_generation)
            }
            offset::QUEUE_SELECT => u32::from(self.queue_select),
            offset::QUEUE_NOTIFY_OFF | offset::QUEUE_NOTIF_CONFIG_DATA => {
                let index = self.queue_select;
                self.selected().map_or(0, |_| u32::from(index))
            }
            _ => {
                let queue = match self.selected() {
                    Some(queue) => *queue,
                    None => return 0,
                };
                match at {
                    offset::QUEUE_SIZE => u32::from(queue.size),
                    offset::QUEUE_MSIX_VECTOR => u32::from(queue.msix_vector),
                    offset::QUEUE_ENABLE => u32::from(queue.enabled),
                    offset::QUEUE_RESET => u32::from(queue.reset),
                    a if a == offset::QUEUE_DESC => queue.desc as u32,
                    a if a == offset::QUEUE_DESC + 4 => (queue.desc >> 32) as u32,
                    a if a == offset::QUEUE_DRIVER => queue.driver as u32,
                    a if a == offset::QUEUE_DRIVER + 4 => (queue.driver >> 32) as u32,
                    a if a == offset::QUEUE_DEVICE => queue.device as u32,
                    a if a == offset::QUEUE_DEVICE + 4 => (queue.device >> 32) as u32,
                    _ => 0,
                }
            }
        }
    }

    fn write_common(&mut self, at: usize, value: u32) {
        let msix_vectors = self.msix_vectors;
        let accept_vector = |vector: u16| {
            if vector == NO_VECTOR || vector < msix_vectors {
                vector
            } else {
                NO_VECTOR
            }
        };
        match at {
            offset::DEVICE_FEATURE_SELECT => self.device_feature_select = value,
            offset::DRIVER_FEATURE_SELECT => self.driver_feature_select = value,
            offset::DRIVER_FEATURE => match self.driver_feature_select {
                0 => self.driver_features = self.driver_features & !0xffff_ffff | u64::from(value),
                1 => self.driver_features = self.driver_features & 0xffff_ffff | u64::from(value) << 32,
                _ => {}
            },
            offset::CONFIG_MSIX_VECTOR => self.config_msix_vector = accept_vector(value as u16),
            offset::DEVICE_STATUS => self.write_status(value as u8),
            offset::QUEUE_SELECT => self.queue_select = value as u16,
            _ => {
                let queue = match self.selected() {
                    Some(queue) => queue,
                    None => return,
                };
                let low = |old: u64| old & !0xffff_ffff | u64::from(value);
                let high = |old: u64| old & 0xffff_ffff | u64::from(value) << 32;
                match at {
                    offset::QUEUE_SIZE => queue.size = value as u16,
                    offset::QUEUE_MSIX_VECTOR => queue.msix_vector = accept_vector(value as u16),
                    offset::QUEUE_ENABLE if value == 1 => {
                        queue.enabled = true;
                        queue.reset = false;
                    }
                    offset::QUEUE_RESET if value == 1 => {
                        queue.clear();
                        queue.reset = true;
                    }
                    a if a == offset::QUEUE_DESC => queue.desc = low(queue.desc),
                    a if a == offset::QUEUE_DESC + 4 => queue.desc = high(queue.desc),
                    a if a == offset::QUEUE_DRIVER => queue.driver = low(queue.driver),
                    a if a == offset::QUEUE_DRIVER + 4 => queue.driver = high(queue.driver),
                    a if a == offset::QUEUE_DEVICE => queue.device = low(queue.device),
                    a if a == offset::QUEUE_DEVICE + 4 => queue.device = high(queue.device),
                    _ => {}
                }
            }
        }
    }

    fn read_device(&mut self, at: usize, width: usize) -> u32 {
        if self.tears_remaining > 0 {
            self.pending_tear = true;
        }
        let mut bytes = [0u8; 4];
        if let Some(src) = self.device_config.get(at..at + width) {
            bytes[..width].copy_from_slice(src);
        }
        u32::from_le_bytes(bytes)
    }

    fn write_device(&mut self, at: usize, width: usize, value: u32) {
        if let Some(dst) = self.device_config.get_mut(at..at + width) {
            dst.copy_from_slice(&value.to_le_bytes()[..width]);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    Common,
    Notify,
    Isr,
    Device,
}

/// One region of a [`SimDevice`].
#[derive(Debug, Clone)]
pub struct SimMmio {
    state: Arc<Mutex<SimState>>,
    window: Window,
}

impl SimMmio {
    fn read(&self, at: usize, width: usize) -> u32 {
        let mut state = self.state.lock();
        match self.window {
            Window::Common => state.read_common(at) & mask(width),
            Window::Notify => 0,
            Window::Isr => core::mem::take(&mut state.isr).into(),
            Window::Device => state.read_device(at, width),
        }
    }

    fn write(&self, at: usize, width: usize, value: u32) {
        let mut state = self.state.lock();
        match self.window {
            Window::Common => state.write_common(at, value & mask(width)),
            Window::Notify => state.notifications.push(SimNotification { offset: at, value }),
            Window::Isr => {}
            Window::Device => state.write_device(at, width, value),
        }
    }
}

fn mask(width: usize) -> u32 {
    match width {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    }
}

impl Mmio for SimMmio {
    fn len(&self) -> usize {
        match self.window {
            Window::Common => COMMON_CFG_LEN,
            Window::Notify => SimDevice::NOTIFY_MULTIPLIER as usize * self.state.lock().queues.len(),
            Window::Isr => 1,
            Window::Device => self.state.lock().device_config.len(),
        }
    }

    fn read8(&self, offset: usize) -> u8 {
        self.read(offset, 1) as u8
    }

    fn read16(&self, offset: usize) -> u16 {
        (self.read(offset, 2) as u16).to_le()
    }

    fn read32(&self, offset: usize) -> u32 {
        self.read(offset, 4).to_le()
    }

    fn write8(&self, offset: usize, value: u8) {
        self.write(offset, 1, u32::from(value))
    }

    fn write16(&self, offset: usize, value: u16) {
        self.write(offset, 2, u32::from(u16::from_le(value)))
    }

    fn write32(&self, offset: usize, value: u32) {
        self.write(offset, 4, u32::from_le(value))
    }
}

/// Handle on a simulated device. Clones share the device.
#[derive(Debug, Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    /// `notify_off_multiplier` of the simulated notify region; queue `n`
    /// reports `queue_notify_off == n`.
    pub const NOTIFY_MULTIPLIER: u32 = 4;

    /// A device offering `features` with one queue per entry of `max_sizes`.
    pub fn new(features: u64, max_sizes: &[u16]) -> Self {
        let state = SimState {
            device_features: features,
            device_feature_select: 0,
            driver_features: 0,
            driver_feature_select: 0,
            config_msix_vector: NO_VECTOR,
            status: 0,
            reject_features: false,
            reset_delay: 0,
            stale_reads: 0,
            stale_status: 0,
            config_generation: 0,
            tears_remaining: 0,
            pending_tear: false,
            msix_vectors: 0,
            queue_select: 0,
            queues: max_sizes.iter().map(|&max| SimQueue::new(max)).collect(),
            isr: 0,
            notifications: Vec::new(),
            device_config: vec![0; 32],
        };
        SimDevice { state: Arc::new(Mutex::new(state)) }
    }

    fn window(&self, window: Window) -> SimMmio {
        SimMmio { state: self.state.clone(), window }
    }

    pub fn common(&self) -> SimMmio {
        self.window(Window::Common)
    }

    pub fn notify(&self) -> SimMmio {
        self.window(Window::Notify)
    }

    pub fn isr(&self) -> SimMmio {
        self.window(Window::Isr)
    }

    pub fn device_cfg(&self) -> SimMmio {
        self.window(Window::Device)
    }

    /// All four regions, as a capability walk would have found them.
    pub fn regions(&self, id: PciVendorDevice) -> PciRegions<SimMmio> {
        PciRegions {
            id,
            common: self.common(),
            notify: self.notify(),
            notify_off_multiplier: Self::NOTIFY_MULTIPLIER,
            isr: self.isr(),
            device: Some(self.device_cfg()),
        }
    }

    /// Features the driver last wrote.
    pub fn driver_features(&self) -> u64 {
        self.state.lock().driver_features
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_truncate(self.state.lock().status)
    }

    /// The status byte as stored, reserved bits included.
    pub fn raw_status(&self) -> u8 {
        self.state.lock().status
    }

    /// Overwrites the status byte from the device side.
    pub fn force_status(&self, raw: u8) {
        self.state.lock().status = raw;
    }

    /// Makes the device clear FEATURES_OK whenever the driver sets it.
    pub fn set_reject_features(&self, reject: bool) {
        self.state.lock().reject_features = reject;
    }

    /// After each reset, `device_status` keeps reading its old value `reads` times.
    pub fn set_reset_delay(&self, reads: usize) {
        self.state.lock().reset_delay = reads;
    }

    pub fn raise_needs_reset(&self) {
        self.state.lock().status |= DeviceStatus::DEVICE_NEEDS_RESET.bits();
    }

    pub fn raise_interrupt(&self, isr: IsrStatus) {
        self.state.lock().isr |= isr.bits();
    }

    pub fn notifications(&self) -> Vec<SimNotification> {
        self.state.lock().notifications.clone()
    }

    pub fn set_device_config(&self, bytes: &[u8]) {
        self.state.lock().device_config = bytes.to_vec();
    }

    /// Changes the device configuration, bumping `config_generation`.
    pub fn update_device_config(&self, at: usize, bytes: &[u8]) {
        let mut state = self.state.lock();
        if let Some(dst) = state.device_config.get_mut(at..at + bytes.len()) {
            dst.copy_from_slice(bytes);
        }
        state.config_generation = state.config_generation.wrapping_add(1);
        state.isr |= IsrStatus::DEVICE_CONFIG.bits();
    }

    /// The next `times` configuration reads race with a device update.
    pub fn tear_config_reads(&self, times: usize) {
        self.state.lock().tears_remaining = times;
    }

    /// Number of MSI-X vectors the device accepts.
    pub fn set_msix_vectors(&self, vectors: u16) {
        self.state.lock().msix_vectors = vectors;
    }

    pub fn config_msix_vector(&self) -> u16 {
        self.state.lock().config_msix_vector
    }

    /// Device-side state of queue `index`.
    pub fn queue(&self, index: u16) -> SimQueue {
        self.state.lock().queues[usize::from(index)]
    }

    fn ring(&self, index: u16) -> SimQueue {
        let queue = self.queue(index);
        debug_assert!(queue.enabled, "queue {} is not enabled", index);
        queue
    }

    /// # Safety
    ///
    /// Queue `index` must be enabled and its ring memory identity-mapped and live.
    pub unsafe fn avail_idx(&self, index: u16) -> u16 {
        read_u16(self.ring(index).driver + 2)
    }

    /// # Safety
    ///
    /// As for [`SimDevice::avail_idx`].
    pub unsafe fn avail_flags(&self, index: u16) -> AvailFlags {
        AvailFlags::from_bits_truncate(read_u16(self.ring(index).driver))
    }

    /// Sets or clears the NO_NOTIFY hint in the used ring.
    ///
    /// # Safety
    ///
    /// As for [`SimDevice::avail_idx`].
    pub unsafe fn set_no_notify(&self, index: u16, no_notify: bool) {
        let flags = if no_notify { UsedFlags::NO_NOTIFY } else { UsedFlags::empty() };
        write_u16(self.ring(index).device, flags.bits());
    }

    /// Takes the next chain the driver made available, if any.
    ///
    /// # Safety
    ///
    /// As for [`SimDevice::avail_idx`].
    pub unsafe fn pop_avail(&self, index: u16) -> Option<SimChain> {
        let queue = self.ring(index);
        let avail_idx = read_u16(queue.driver + 2);
        fence(Ordering::Acquire);
        if avail_idx == queue.last_avail {
            return None;
        }
        let slot = queue.last_avail & (queue.size - 1);
        let head = read_u16(queue.driver + 4 + 2 * u64::from(slot));

        let mut buffers = Vec::new();
        let mut next = head;
        for _ in 0..queue.size {
            let desc = queue.desc + 16 * u64::from(next);
            let flags = DescFlags::from_bits_truncate(read_u16(desc + 12));
            let addr = read_u64(desc);
            let len = read_u32(desc + 8);
            buffers.push(if flags.contains(DescFlags::WRITE) {
                Buffer::writable(addr, len)
            } else {
                Buffer::readable(addr, len)
            });
            if !flags.contains(DescFlags::NEXT) {
                break;
            }
            next = read_u16(desc + 14);
        }

        self.state.lock().queues[usize::from(index)].last_avail = queue.last_avail.wrapping_add(1);
        Some(SimChain { head, buffers })
    }

    /// Publishes a used ring entry `{id, len}`.
    ///
    /// # Safety
    ///
    /// As for [`SimDevice::avail_idx`].
    pub unsafe fn push_used(&self, index: u16, id: u32, len: u32) {
        let queue = self.ring(index);
        let used_idx = read_u16(queue.device + 2);
        let elem = queue.device + 4 + 8 * u64::from(used_idx & (queue.size - 1));
        write_u32(elem, id);
        write_u32(elem + 4, len);
        fence(Ordering::Release);
        write_u16(queue.device + 2, used_idx.wrapping_add(1));
        self.state.lock().isr |= IsrStatus::QUEUE.bits();
    }

    /// Takes the next available chain and completes it with `len` bytes written.
    ///
    /// # Safety
    ///
    /// As for [`SimDevice::avail_idx`].
    pub unsafe fn complete_next(&self, index: u16, len: u32) -> Option<SimChain> {
        let chain = self.pop_avail(index)?;
        self.push_used(index, u32::from(chain.head), len);
        Some(chain)
    }
}

unsafe fn read_u16(paddr: u64) -> u16 {
    u16::from_le(ptr::read_volatile(paddr as usize as *const u16))
}

unsafe fn read_u32(paddr: u64) -> u32 {
    u32::from_le(ptr::read_volatile(paddr as usize as *const u32))
}

unsafe fn read_u64(paddr: u64) -> u64 {
    u64::from_le(ptr::read_volatile(paddr as usize as *const u64))
}

unsafe fn write_u16(paddr: u64, value: u16) {
    ptr::write_volatile(paddr as usize as *mut u16, value.to_le())
}

unsafe fn write_u32(paddr: u64, value: u32) {
    ptr::write_volatile(paddr as usize as *mut u32, value.to_le())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{CommonCfg, Registers};

    #[test]
    fn status_reset_clears_queue_state() {
        let device = SimDevice::new(0, &[64]);
        let mut cfg = CommonCfg::new(device.common()).unwrap();
        {
            let mut q = cfg.select_queue(0).unwrap();
            q.set_size(16).unwrap();
            q.set_desc(0x1234_5678_9abc_d000).unwrap();
            q.enable().unwrap();
        }
        let q = device.queue(0);
        assert_eq!((q.size, q.desc, q.enabled), (16, 0x1234_5678_9abc_d000, true));

        cfg.set_device_status(DeviceStatus::empty()).unwrap();
        assert_eq!(device.queue(0), SimQueue::new(64));
    }

    #[test]
    fn unselected_queue_reads_as_absent() {
        let device = SimDevice::new(0, &[64]);
        let mut cfg = CommonCfg::new(device.common()).unwrap();
        assert_eq!(cfg.num_queues().unwrap(), 1);
        assert_eq!(cfg.select_queue(5).unwrap().size().unwrap(), 0);
        assert_eq!(cfg.select_queue(0).unwrap().size().unwrap(), 64);
    }

    #[test]
    fn generation_moves_after_torn_read() {
        let device = SimDevice::new(0, &[]);
        let cfg = CommonCfg::new(device.common()).unwrap();
        let config = Registers::new(device.device_cfg());
        device.tear_config_reads(1);

        let before = cfg.config_generation().unwrap();
        config.read_u32(0).unwrap();
        assert_ne!(cfg.config_generation().unwrap(), before);

        let before = cfg.config_generation().unwrap();
        config.read_u32(0).unwrap();
        assert_eq!(cfg.config_generation().unwrap(), before);
    }

    #[test]
    fn queue_reset_reads_back_one_until_enabled() {
        let device = SimDevice::new(0, &[8]);
        let mut cfg = CommonCfg::new(device.common()).unwrap();
        let mut q = cfg.select_queue(0).unwrap();
        q.enable().unwrap();
        q.request_reset().unwrap();
        assert_eq!(q.reset_state().unwrap(), 1);
        assert!(!q.enabled().unwrap());
        q.enable().unwrap();
        assert_eq!(q.reset_state().unwrap(), 0);
    }
}
