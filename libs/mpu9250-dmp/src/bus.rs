//! I2C transport.
//!
//! [`Bus`] generalizes register access over the wire so everything above it
//! (configurator, DMP loader, FIFO reader, calibration) can run against a
//! mock in tests. The Linux implementation, [`I2cBus`], talks to a
//! `/dev/i2c-N` character device and caches the selected slave address so
//! the address ioctl is only reissued on change.

use std::sync::atomic::{AtomicBool, Ordering};

use i2cdev::core::I2CDevice;
use i2cdev::linux::LinuxI2CDevice;
use mpu9250_regs::{dmp, mpu9250::regs};

use crate::error::{Error, Result};

/// Largest single transfer the bus will issue; bigger reads are chunked.
pub const MAX_TRANSFER: usize = 128;

/// Register-level access to a device on an I2C bus.
pub trait Bus: Send {
    /// Select the slave address for subsequent transfers.
    fn set_device_address(&mut self, addr: u16) -> Result<()>;

    /// Read `buf.len()` bytes starting at `reg`.
    fn read_bytes(&mut self, reg: u8, buf: &mut [u8]) -> Result<()>;

    /// Write `data` starting at `reg`.
    fn write_bytes(&mut self, reg: u8, data: &[u8]) -> Result<()>;

    /// Assert the cooperative bus claim, returning the prior state.
    ///
    /// This is advisory only: it never blocks, it just lets well-behaved
    /// users of the same bus see each other. The DMP handler holds it for
    /// the duration of each FIFO read and the calibration routines refuse
    /// to start while it is set.
    fn lock(&mut self) -> bool;

    /// Release the cooperative claim, returning the prior state.
    fn unlock(&mut self) -> bool;

    /// Observe the cooperative claim.
    fn is_locked(&self) -> bool;

    fn read_byte(&mut self, reg: u8) -> Result<u8> {
        let mut buf = [0u8];
        self.read_bytes(reg, &mut buf)?;
        Ok(buf[0])
    }

    fn write_byte(&mut self, reg: u8, value: u8) -> Result<()> {
        self.write_bytes(reg, &[value])
    }

    /// Read a big-endian 16-bit word (high byte at `reg`).
    fn read_word(&mut self, reg: u8) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes(reg, &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    /// Set or clear one bit of a register.
    ///
    /// Read-modify-write with no hardware atomicity; callers serialize
    /// access themselves (the driver always holds its bus mutex here).
    fn write_bit(&mut self, reg: u8, bit: u8, value: bool) -> Result<()> {
        let b = self.read_byte(reg)?;
        let b = if value { b | (1 << bit) } else { b & !(1 << bit) };
        self.write_byte(reg, b)
    }

    /// Write to DMP memory at `addr` = bank << 8 | start.
    ///
    /// Fails closed with [`Error::BankCrossing`] when the payload would
    /// span a 256-byte bank; a crossing write lands in the wrong bank and
    /// corrupts firmware state in ways that are miserable to debug.
    fn write_mem(&mut self, addr: u16, data: &[u8]) -> Result<()> {
        let start = (addr & 0xFF) as usize;
        if start + data.len() > dmp::BANK_SIZE {
            return Err(Error::BankCrossing {
                addr,
                len: data.len(),
            });
        }
        self.write_bytes(regs::BANK_SEL, &[(addr >> 8) as u8, addr as u8])?;
        self.write_bytes(regs::MEM_R_W, data)
    }

    /// Read from DMP memory at `addr` = bank << 8 | start.
    fn read_mem(&mut self, addr: u16, buf: &mut [u8]) -> Result<()> {
        let start = (addr & 0xFF) as usize;
        if start + buf.len() > dmp::BANK_SIZE {
            return Err(Error::BankCrossing {
                addr,
                len: buf.len(),
            });
        }
        self.write_bytes(regs::BANK_SEL, &[(addr >> 8) as u8, addr as u8])?;
        self.read_bytes(regs::MEM_R_W, buf)
    }
}

/// How many bus numbers the advisory claim table covers.
const MAX_BUS: usize = 16;

/// Advisory claims are per bus number and process-wide, so separate driver
/// instances (the DMP handler and a calibration routine, say) can see each
/// other's activity.
static BUS_CLAIMS: [AtomicBool; MAX_BUS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const UNCLAIMED: AtomicBool = AtomicBool::new(false);
    [UNCLAIMED; MAX_BUS]
};

/// A Linux `/dev/i2c-N` bus with slave-address caching and an advisory
/// claim flag.
pub struct I2cBus {
    dev: LinuxI2CDevice,
    bus: u32,
    addr: u16,
}

impl I2cBus {
    pub fn new(bus: u32, addr: u16) -> Result<I2cBus> {
        if bus as usize >= MAX_BUS {
            return Err(Error::Config("i2c bus number out of range"));
        }
        let dev = LinuxI2CDevice::new(format!("/dev/i2c-{}", bus), addr)?;
        log::trace!("opened /dev/i2c-{} at {:#04x}", bus, addr);
        Ok(I2cBus { dev, bus, addr })
    }

    pub fn bus_number(&self) -> u32 {
        self.bus
    }

    fn claim(&self) -> &AtomicBool {
        &BUS_CLAIMS[self.bus as usize]
    }
}

impl Bus for I2cBus {
    fn set_device_address(&mut self, addr: u16) -> Result<()> {
        if self.addr == addr {
            return Ok(());
        }
        self.dev.set_slave_address(addr)?;
        self.addr = addr;
        Ok(())
    }

    fn read_bytes(&mut self, reg: u8, buf: &mut [u8]) -> Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            let end = (offset + MAX_TRANSFER).min(buf.len());
            self.dev.write(&[reg]).map_err(|e| {
                log::error!("i2c-{} write of register {:#04x} failed: {}", self.bus, reg, e);
                Error::Transport(e)
            })?;
            self.dev.read(&mut buf[offset..end]).map_err(|e| {
                log::error!("i2c-{} read at {:#04x} failed: {}", self.bus, reg, e);
                Error::Transport(e)
            })?;
            offset = end;
        }
        Ok(())
    }

    fn write_bytes(&mut self, reg: u8, data: &[u8]) -> Result<()> {
        let mut msg = Vec::with_capacity(data.len() + 1);
        msg.push(reg);
        msg.extend_from_slice(data);
        self.dev.write(&msg).map_err(|e| {
            log::error!("i2c-{} write at {:#04x} failed: {}", self.bus, reg, e);
            Error::Transport(e)
        })
    }

    fn lock(&mut self) -> bool {
        self.claim().swap(true, Ordering::SeqCst)
    }

    fn unlock(&mut self) -> bool {
        self.claim().swap(false, Ordering::SeqCst)
    }

    fn is_locked(&self) -> bool {
        self.claim().load(Ordering::SeqCst)
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockBus;
    use super::*;

    #[test]
    fn write_mem_rejects_bank_crossing() {
        let mut bus = MockBus::new();
        // 250 + 10 crosses the 256-byte bank
        let err = bus.write_mem(0x02FA, &[0u8; 10]).unwrap_err();
        assert!(matches!(err, Error::BankCrossing { addr: 0x02FA, len: 10 }));
        // nothing must have reached the wire
        assert!(bus.journal.is_empty());
    }

    #[test]
    fn write_mem_pages_the_bank_registers() {
        let mut bus = MockBus::new();
        bus.write_mem(0x0310, &[1, 2, 3]).unwrap();
        assert_eq!(
            bus.writes_to(mpu9250_regs::mpu9250::I2C_ADDRESS, regs::BANK_SEL),
            vec![vec![0x03, 0x10]]
        );
        assert_eq!(&bus.mem[0x0310..0x0313], &[1, 2, 3]);
    }

    #[test]
    fn read_mem_round_trips() {
        let mut bus = MockBus::new();
        bus.write_mem(0x0100, &[9, 8, 7, 6]).unwrap();
        let mut buf = [0u8; 4];
        bus.read_mem(0x0100, &mut buf).unwrap();
        assert_eq!(buf, [9, 8, 7, 6]);
    }

    #[test]
    fn lock_is_advisory_and_returns_prior_state() {
        let mut bus = MockBus::new();
        assert!(!bus.lock());
        assert!(bus.lock());
        assert!(bus.is_locked());
        assert!(bus.unlock());
        assert!(!bus.is_locked());
    }

    #[test]
    fn write_bit_read_modify_writes() {
        let mut bus = MockBus::new();
        bus.write_byte(0x10, 0b1000_0001).unwrap();
        bus.write_bit(0x10, 2, true).unwrap();
        assert_eq!(bus.reg(mpu9250_regs::mpu9250::I2C_ADDRESS, 0x10), 0b1000_0101);
        bus.write_bit(0x10, 7, false).unwrap();
        assert_eq!(bus.reg(mpu9250_regs::mpu9250::I2C_ADDRESS, 0x10), 0b0000_0101);
    }
}
