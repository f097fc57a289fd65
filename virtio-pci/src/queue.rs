//! Virtqueue configuration and the split ring runtime.
//!
//! Ref: 2.7.13 Supplying Buffers to The Device, 2.7.14 Receiving Used Buffers
//! From The Device, 4.1.5.1.3 Virtqueue Configuration
//!
//! A [`Virtqueue`] may be shared between one submitting and one completing
//! thread. The available ring producer state, the used ring consumer state and
//! the descriptor free list each sit behind their own lock; the free list lock
//! is only ever taken last and held briefly. A single submitter per queue never
//! contends on the producer lock.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};

use spin::{Mutex, MutexGuard};

use crate::dma::{DmaAllocator, DmaRegion};
use crate::error::{PollError, QueueConfigError, SubmitError};
use crate::notify::{NotifyRegion, Notifier};
use crate::regs::{CommonCfg, Mmio};
use crate::ring::{AvailFlags, DescFlags, RingLayout, RingMemory, UsedFlags, QUEUE_ALIGN};
use crate::status::StatusProbe;

/// MSI-X "no vector" value, also what the device reports for a rejected vector.
pub const NO_VECTOR: u16 = 0xffff;

/// Polls of `queue_reset` allowed for a queue reset to complete.
pub const QUEUE_RESET_POLL_LIMIT: usize = 1000;

/// Parameters of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Wanted number of entries; clamped to the device maximum.
    pub size: u16,
    /// MSI-X vector to route this queue's interrupts to.
    pub msix_vector: Option<u16>,
}

impl QueueConfig {
    pub fn new(size: u16) -> Self {
        QueueConfig { size, msix_vector: None }
    }

    pub fn with_msix_vector(self, vector: u16) -> Self {
        QueueConfig { msix_vector: Some(vector), ..self }
    }
}

/// Who may access a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The driver provides data for the device to read.
    DeviceReads,
    /// The driver provides room for the device to write into.
    DeviceWrites,
}

/// One physically contiguous buffer of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    pub addr: u64,
    pub len: u32,
    pub direction: Direction,
}

impl Buffer {
    pub fn readable(addr: u64, len: u32) -> Self {
        Buffer { addr, len, direction: Direction::DeviceReads }
    }

    pub fn writable(addr: u64, len: u32) -> Self {
        Buffer { addr, len, direction: Direction::DeviceWrites }
    }
}

/// Identifies a submitted chain until it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u16);

impl Token {
    /// Index of the head descriptor of the chain.
    pub fn head(self) -> u16 {
        self.0
    }
}

/// A chain the device has finished with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub token: Token,
    /// Bytes the device wrote into the chain.
    pub len: u32,
}

/// Size used for a `requested` queue on a device offering at most `device_max`.
pub(crate) fn negotiated_size(requested: u16, device_max: u16) -> Result<u16, QueueConfigError> {
    let size = requested.min(device_max);
    if size == 0 || !size.is_power_of_two() {
        return Err(QueueConfigError::UnsupportedQueueSize { requested, device_max });
    }
    Ok(size)
}

/// Programs queue `index` and returns it enabled.
pub(crate) fn configure<M, A>(
    cfg: &mut CommonCfg<M>,
    notify: &NotifyRegion<M>,
    index: u16,
    config: QueueConfig,
    notification_data: bool,
    epoch: Arc<AtomicU32>,
    alloc: &mut A,
) -> Result<Virtqueue<M>, QueueConfigError>
where
    M: Mmio + Clone,
    A: DmaAllocator + ?Sized,
{
    let num_queues = cfg.num_queues()?;
    if index >= num_queues {
        return Err(QueueConfigError::NoSuchQueue { index, num_queues });
    }
    let status = StatusProbe::new(cfg.registers().mmio().clone());

    let mut q = cfg.select_queue(index)?;
    if q.enabled()? {
        return Err(QueueConfigError::AlreadyEnabled { index });
    }
    let device_max = q.size()?;
    if device_max == 0 {
        return Err(QueueConfigError::QueueUnavailable { index });
    }
    let size = negotiated_size(config.size, device_max)?;
    let notifier = notify.notifier(index, q.notify_off()?, notification_data)?;

    q.set_size(size)?;
    if let Some(vector) = config.msix_vector {
        q.set_msix_vector(vector)?;
        if q.msix_vector()? != vector {
            log::warn!("queue {}: device rejected MSI-X vector {}", index, vector);
            return Err(QueueConfigError::MsixVectorRejected { index, vector });
        }
    }

    let layout = RingLayout::new(size);
    let region = alloc.allocate(layout.total_size(), QUEUE_ALIGN)?;
    let ring = RingMemory::new(region, layout);

    let programmed = q
        .set_desc(ring.desc_paddr())
        .and_then(|_| q.set_driver(ring.avail_paddr()))
        .and_then(|_| q.set_device(ring.used_paddr()))
        .and_then(|_| q.enable());
    if let Err(err) = programmed {
        if let Err(free_err) = alloc.free(region.paddr()) {
            log::warn!("queue {}: leaking ring memory: {}", index, free_err);
        }
        return Err(err.into());
    }

    log::debug!(
        "queue {}: size {} (device max {}), desc {:#x} driver {:#x} device {:#x}",
        index,
        size,
        device_max,
        ring.desc_paddr(),
        ring.avail_paddr(),
        ring.used_paddr()
    );
    Ok(Virtqueue::new(index, ring, notifier, status, epoch))
}

/// Resets queue `index` on the device side through `queue_reset`.
pub(crate) fn reset<M: Mmio>(cfg: &mut CommonCfg<M>, index: u16) -> Result<(), QueueConfigError> {
    let mut q = cfg.select_queue(index)?;
    q.request_reset()?;
    for _ in 0..QUEUE_RESET_POLL_LIMIT {
        if q.reset_state()? == 1 {
            log::debug!("queue {}: reset", index);
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(QueueConfigError::ResetTimeout { index })
}

struct AvailState {
    next_idx: u16,
}

struct UsedState {
    last_seen: u16,
}

/// Driver-side bookkeeping of the descriptor table.
struct DescTable {
    /// Free descriptor indices, used as a stack.
    free: Vec<u16>,
    /// Shadow of each descriptor's `next`, so reclaiming never reads memory
    /// the device can reach.
    next: Vec<u16>,
    /// Chain length of each outstanding head.
    chains: Vec<Option<u16>>,
    outstanding: usize,
}

impl DescTable {
    fn new(size: u16) -> Self {
        DescTable {
            free: (0..size).rev().collect(),
            next: alloc::vec![0; usize::from(size)],
            chains: alloc::vec![None; usize::from(size)],
            outstanding: 0,
        }
    }

    fn release(&mut self, head: u16, len: u16) {
        let mut index = head;
        for _ in 0..len {
            self.free.push(index);
            index = self.next[usize::from(index)];
        }
        self.chains[usize::from(head)] = None;
        self.outstanding -= 1;
    }
}

/// An enabled split virtqueue.
///
/// Dropping a queue leaks its ring memory; hand it back through
/// [`crate::VirtioPciTransport::release_queue`] once the device no longer
/// uses it.
pub struct Virtqueue<M> {
    index: u16,
    size: u16,
    ring: RingMemory,
    notifier: Notifier<M>,
    status: StatusProbe<M>,
    epoch: Arc<AtomicU32>,
    created_in: u32,
    detached: AtomicBool,
    avail: Mutex<AvailState>,
    used: Mutex<UsedState>,
    descs: Mutex<DescTable>,
    fault: Mutex<Option<PollError>>,
}

impl<M: Mmio> Virtqueue<M> {
    fn new(
        index: u16,
        ring: RingMemory,
        notifier: Notifier<M>,
        status: StatusProbe<M>,
        epoch: Arc<AtomicU32>,
    ) -> Self {
        let size = ring.layout().size();
        let created_in = epoch.load(Ordering::Acquire);
        Virtqueue {
            index,
            size,
            ring,
            notifier,
            status,
            epoch,
            created_in,
            detached: AtomicBool::new(false),
            avail: Mutex::new(AvailState { next_idx: 0 }),
            used: Mutex::new(UsedState { last_seen: 0 }),
            descs: Mutex::new(DescTable::new(size)),
            fault: Mutex::new(None),
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    /// Descriptors available to new chains.
    pub fn num_free(&self) -> usize {
        self.descs.lock().free.len()
    }

    /// Chains submitted and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.descs.lock().outstanding
    }

    /// Whether the queue can still be used, i.e. neither the device nor the
    /// driver has reset it and its ring was never found corrupted.
    pub fn is_live(&self) -> bool {
        self.current_fault().is_none()
    }

    fn current_fault(&self) -> Option<PollError> {
        let mut fault = self.fault.lock();
        if fault.is_none() && self.epoch.load(Ordering::Acquire) != self.created_in {
            *fault = Some(PollError::QueueReset);
        }
        *fault
    }

    pub(crate) fn invalidate(&self, reason: PollError) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(reason);
        }
    }

    /// Marks the queue as reset on the device side, so the device no longer
    /// touches its ring memory.
    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
        self.invalidate(PollError::QueueReset);
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire) || self.epoch.load(Ordering::Acquire) != self.created_in
    }

    pub(crate) fn belongs_to(&self, epoch: &Arc<AtomicU32>) -> bool {
        Arc::ptr_eq(&self.epoch, epoch)
    }

    #[cfg(test)]
    pub(crate) fn ring(&self) -> &RingMemory {
        &self.ring
    }

    pub(crate) fn region(&self) -> DmaRegion {
        self.ring.region()
    }

    /// Asks the device not to interrupt when it uses buffers from this queue.
    ///
    /// The device may ignore the hint.
    pub fn set_interrupt_suppression(&self, suppress: bool) {
        let _avail = self.avail.lock();
        let flags = if suppress { AvailFlags::NO_INTERRUPT } else { AvailFlags::empty() };
        self.ring.set_avail_flags(flags);
    }

    /// Exposes `buffers` to the device as one descriptor chain.
    ///
    /// Never waits: a queue without enough free descriptors reports
    /// [`SubmitError::QueueFull`].
    pub fn submit(&self, buffers: &[Buffer]) -> Result<Token, SubmitError> {
        if self.current_fault().is_some() {
            return Err(SubmitError::QueueInvalid);
        }
        if buffers.is_empty() {
            return Err(SubmitError::EmptyChain);
        }

        let mut avail = self.avail.lock();
        let head = {
            let mut descs = self.descs.lock();
            let free = descs.free.len();
            if free < buffers.len() {
                return Err(SubmitError::QueueFull { needed: buffers.len(), free });
            }

            // Built back to front so every descriptor knows its successor.
            let mut next = None;
            for buffer in buffers.iter().rev() {
                let index = descs.free.pop().ok_or(SubmitError::QueueFull { needed: buffers.len(), free })?;
                let mut flags = match buffer.direction {
                    Direction::DeviceReads => DescFlags::empty(),
                    Direction::DeviceWrites => DescFlags::WRITE,
                };
                if let Some(next) = next {
                    flags |= DescFlags::NEXT;
                    descs.next[usize::from(index)] = next;
                }
                self.ring.write_descriptor(index, buffer.addr, buffer.len, flags, next.unwrap_or(0));
                next = Some(index);
            }
            let head = next.ok_or(SubmitError::EmptyChain)?;
            descs.chains[usize::from(head)] = Some(buffers.len() as u16);
            descs.outstanding += 1;
            head
        };

        let slot = avail.next_idx & (self.size - 1);
        self.ring.write_avail_slot(slot, head);
        avail.next_idx = avail.next_idx.wrapping_add(1);
        self.ring.publish_avail_idx(avail.next_idx);

        // The index must be visible before the device's hint is sampled.
        fence(Ordering::SeqCst);
        if !self.ring.used_flags().contains(UsedFlags::NO_NOTIFY) {
            self.notifier.notify(avail.next_idx);
        }
        log::trace!("queue {}: submitted head {} ({} buffers)", self.index, head, buffers.len());
        Ok(Token(head))
    }

    /// Chains the device has completed since the last call.
    ///
    /// The sequence is lazy and ends when it catches up with the device's used
    /// index, after yielding an error, or when dropped; the next call resumes
    /// from the last chain yielded. Only one sequence per queue exists at a
    /// time, a second caller waits for the first to be dropped.
    pub fn poll_completions(&self) -> Completions<'_, M> {
        Completions { queue: self, used: self.used.lock(), started: false, done: false }
    }
}

impl<M: Mmio> fmt::Debug for Virtqueue<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Virtqueue")
            .field("index", &self.index)
            .field("size", &self.size)
            .field("desc", &self.ring.desc_paddr())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Completed chains of one queue, see [`Virtqueue::poll_completions`].
pub struct Completions<'a, M> {
    queue: &'a Virtqueue<M>,
    used: MutexGuard<'a, UsedState>,
    started: bool,
    done: bool,
}

impl<M: Mmio> Completions<'_, M> {
    fn fail(&mut self, err: PollError) -> Option<Result<Completion, PollError>> {
        self.done = true;
        Some(Err(err))
    }
}

impl<M: Mmio> Iterator for Completions<'_, M> {
    type Item = Result<Completion, PollError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let queue = self.queue;
        if !self.started {
            self.started = true;
            if queue.status.needs_reset() {
                log::warn!("queue {}: device needs reset, outstanding chains are lost", queue.index);
                queue.invalidate(PollError::DeviceNeedsReset);
            }
            if let Some(fault) = queue.current_fault() {
                return self.fail(fault);
            }
        }

        let used_idx = queue.ring.used_idx();
        if used_idx == self.used.last_seen {
            self.done = true;
            return None;
        }

        let slot = self.used.last_seen & (queue.size - 1);
        let elem = queue.ring.used_elem(slot);
        let mut descs = queue.descs.lock();
        let chain = u16::try_from(elem.id)
            .ok()
            .filter(|&head| head < queue.size)
            .and_then(|head| descs.chains[usize::from(head)].map(|len| (head, len)));
        let (head, len) = match chain {
            Some(chain) => chain,
            None => {
                drop(descs);
                log::error!("queue {}: used ring names unknown head {}", queue.index, elem.id);
                let err = PollError::CorruptedRing { head: elem.id };
                queue.invalidate(err);
                return self.fail(err);
            }
        };
        descs.release(head, len);
        drop(descs);

        self.used.last_seen = self.used.last_seen.wrapping_add(1);
        log::trace!("queue {}: completed head {} ({} bytes)", queue.index, head, elem.len);
        Some(Ok(Completion { token: Token(head), len: elem.len }))
    }
}
