//! Device-specific configuration and the generation guard around it.
//!
//! Ref: 2.5.1 Driver Requirements: Device Configuration Space

use crate::error::{ConfigError, RegisterAccessError};
use crate::regs::{CommonCfg, Mmio, Registers};

/// Attempts [`read_stable`] makes before giving up.
pub const CONFIG_READ_ATTEMPTS: usize = 5;

/// Runs `read` until `config_generation` is the same before and after it.
///
/// A changed generation means the device updated its configuration while it
/// was being read, so the value may be torn and is discarded.
pub fn read_stable<M, T, F>(common: &CommonCfg<M>, mut read: F) -> Result<T, ConfigError>
where
    M: Mmio,
    F: FnMut() -> Result<T, RegisterAccessError>,
{
    for attempt in 1..=CONFIG_READ_ATTEMPTS {
        let before = common.config_generation()?;
        let value = read()?;
        let after = common.config_generation()?;
        if before == after {
            return Ok(value);
        }
        log::debug!(
            "config generation moved {} -> {} during read (attempt {})",
            before,
            after,
            attempt
        );
    }
    log::warn!("device configuration kept changing over {} reads", CONFIG_READ_ATTEMPTS);
    Err(ConfigError::Unstable { attempts: CONFIG_READ_ATTEMPTS })
}

/// The device-specific configuration region.
///
/// Reads through this type are not guarded on their own; wrap multi-field
/// reads in [`read_stable`].
#[derive(Debug, Clone)]
pub struct DeviceConfig<M> {
    regs: Registers<M>,
}

impl<M: Mmio> DeviceConfig<M> {
    pub fn new(mmio: M) -> Self {
        DeviceConfig { regs: Registers::new(mmio) }
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.len() == 0
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8, RegisterAccessError> {
        self.regs.read_u8(offset)
    }

    pub fn read_u16(&self, offset: usize) -> Result<u16, RegisterAccessError> {
        self.regs.read_u16(offset)
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, RegisterAccessError> {
        self.regs.read_u32(offset)
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64, RegisterAccessError> {
        self.regs.read_u64(offset)
    }

    pub fn write_u8(&self, offset: usize, value: u8) -> Result<(), RegisterAccessError> {
        self.regs.write_u8(offset, value)
    }

    pub fn write_u16(&self, offset: usize, value: u16) -> Result<(), RegisterAccessError> {
        self.regs.write_u16(offset, value)
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), RegisterAccessError> {
        self.regs.write_u32(offset, value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlkGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

/// Leading fields of `virtio_blk_config`.
///
/// Ref: 5.2.4 Device configuration layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlkConfig {
    /// Capacity in 512-byte sectors
    pub capacity: u64,
    pub size_max: u32,
    pub seg_max: u32,
    pub geometry: BlkGeometry,
    pub blk_size: u32,
}

impl BlkConfig {
    /// Bytes of the configuration region these fields cover.
    pub const LEN: usize = 24;

    /// Reads the fields once, without the generation guard.
    pub fn read<M: Mmio>(config: &DeviceConfig<M>) -> Result<Self, RegisterAccessError> {
        Ok(BlkConfig {
            capacity: config.read_u64(0)?,
            size_max: config.read_u32(8)?,
            seg_max: config.read_u32(12)?,
            geometry: BlkGeometry {
                cylinders: config.read_u16(16)?,
                heads: config.read_u8(18)?,
                sectors: config.read_u8(19)?,
            },
            blk_size: config.read_u32(20)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    fn blk_bytes() -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes[0..8].copy_from_slice(&0x0020_0000u64.to_le_bytes());
        bytes[8..12].copy_from_slice(&65536u32.to_le_bytes());
        bytes[12..16].copy_from_slice(&126u32.to_le_bytes());
        bytes[16..18].copy_from_slice(&1024u16.to_le_bytes());
        bytes[18] = 16;
        bytes[19] = 63;
        bytes[20..24].copy_from_slice(&4096u32.to_le_bytes());
        bytes
    }

    #[test]
    fn blk_config_fields() {
        let device = SimDevice::new(0, &[]);
        device.set_device_config(&blk_bytes());
        let config = DeviceConfig::new(device.device_cfg());
        assert_eq!(
            BlkConfig::read(&config).unwrap(),
            BlkConfig {
                capacity: 0x0020_0000,
                size_max: 65536,
                seg_max: 126,
                geometry: BlkGeometry { cylinders: 1024, heads: 16, sectors: 63 },
                blk_size: 4096,
            }
        );
    }

    #[test]
    fn torn_reads_are_retried() {
        let device = SimDevice::new(0, &[]);
        device.set_device_config(&blk_bytes());
        let common = CommonCfg::new(device.common()).unwrap();
        let config = DeviceConfig::new(device.device_cfg());

        device.tear_config_reads(CONFIG_READ_ATTEMPTS - 1);
        let mut calls = 0;
        let value = read_stable(&common, || {
            calls += 1;
            BlkConfig::read(&config)
        })
        .unwrap();
        assert_eq!(calls, CONFIG_READ_ATTEMPTS);
        assert_eq!(value.blk_size, 4096);
    }

    #[test]
    fn endless_tearing_is_unstable() {
        let device = SimDevice::new(0, &[]);
        let common = CommonCfg::new(device.common()).unwrap();
        let config = DeviceConfig::new(device.device_cfg());

        device.tear_config_reads(CONFIG_READ_ATTEMPTS);
        assert_eq!(
            read_stable(&common, || config.read_u32(0)),
            Err(ConfigError::Unstable { attempts: CONFIG_READ_ATTEMPTS })
        );
    }

    #[test]
    fn read_errors_pass_through() {
        let device = SimDevice::new(0, &[]);
        let common = CommonCfg::new(device.common()).unwrap();
        let config = DeviceConfig::new(device.device_cfg());
        assert_eq!(
            read_stable(&common, || config.read_u32(64)),
            Err(ConfigError::Register(RegisterAccessError::OutOfRange { offset: 64, width: 4, len: 32 }))
        );
    }
}
