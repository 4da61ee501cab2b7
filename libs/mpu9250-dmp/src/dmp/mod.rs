//! DMP control: firmware upload, feature configuration, FIFO plumbing.
//!
//! The stanza bytes written into DMP RAM are opcode patches for the stock
//! firmware image, carried over from the InvenSense motion driver. They are
//! only meaningful at these addresses in this image.

use std::thread::sleep;
use std::time::Duration;

use mpu9250_regs::dmp::{self, addrs};
use mpu9250_regs::mpu9250::{flags, regs};

use crate::bus::Bus;
use crate::config::{AccelFsr, Config};
use crate::error::{Error, Result};

/// Compiled DMP firmware image, loaded bank by bank at startup.
static FIRMWARE: &[u8; dmp::CODE_SIZE] = include_bytes!("firmware.bin");

/// Tap axis selectors.
pub const TAP_X: u8 = 0x01;
pub const TAP_Y: u8 = 0x02;
pub const TAP_Z: u8 = 0x04;
pub const TAP_XYZ: u8 = 0x07;

/// Upload the firmware image and set the program entry point.
///
/// Writes go out in 16-byte chunks, each read back and compared; any
/// mismatch is fatal since partially-written firmware must never run.
pub fn load_firmware<B: Bus>(bus: &mut B) -> Result<()> {
    let mut verify = [0u8; dmp::LOAD_CHUNK];
    let mut addr = 0usize;
    while addr < dmp::CODE_SIZE {
        let this_write = dmp::LOAD_CHUNK.min(dmp::CODE_SIZE - addr);
        let chunk = &FIRMWARE[addr..addr + this_write];
        bus.write_mem(addr as u16, chunk)?;
        bus.read_mem(addr as u16, &mut verify[..this_write])?;
        if &verify[..this_write] != chunk {
            log::error!("firmware verify failed at {:#06x}", addr);
            return Err(Error::FirmwareCorrupted { addr: addr as u16 });
        }
        addr += this_write;
    }
    bus.write_bytes(
        regs::PRGM_START_H,
        &dmp::START_ADDR.to_be_bytes(),
    )?;
    Ok(())
}

/// Push the mount orientation into the DMP.
///
/// `scalar` packs three 3-bit row codes (axis index plus sign bit) of the
/// chip-to-body rotation; see [`crate::config::Orientation`].
pub fn set_orientation<B: Bus>(bus: &mut B, scalar: u16) -> Result<()> {
    const GYRO_AXES: [u8; 3] = [0x4c, 0xcd, 0x6c];
    const ACCEL_AXES: [u8; 3] = [0x0c, 0xc9, 0x2c];
    const GYRO_SIGN: [u8; 3] = [0x36, 0x56, 0x76];
    const ACCEL_SIGN: [u8; 3] = [0x26, 0x46, 0x66];

    let gyro_regs = [
        GYRO_AXES[(scalar & 3) as usize],
        GYRO_AXES[((scalar >> 3) & 3) as usize],
        GYRO_AXES[((scalar >> 6) & 3) as usize],
    ];
    let accel_regs = [
        ACCEL_AXES[(scalar & 3) as usize],
        ACCEL_AXES[((scalar >> 3) & 3) as usize],
        ACCEL_AXES[((scalar >> 6) & 3) as usize],
    ];
    // chip-to-body, axes only
    bus.write_mem(addrs::FCFG_1, &gyro_regs)?;
    bus.write_mem(addrs::FCFG_2, &accel_regs)?;

    let mut gyro_sign = GYRO_SIGN;
    let mut accel_sign = ACCEL_SIGN;
    if scalar & 4 != 0 {
        gyro_sign[0] |= 1;
        accel_sign[0] |= 1;
    }
    if scalar & 0x20 != 0 {
        gyro_sign[1] |= 1;
        accel_sign[1] |= 1;
    }
    if scalar & 0x100 != 0 {
        gyro_sign[2] |= 1;
        accel_sign[2] |= 1;
    }
    // chip-to-body, signs only
    bus.write_mem(addrs::FCFG_3, &gyro_sign)?;
    bus.write_mem(addrs::FCFG_7, &accel_sign)?;
    Ok(())
}

/// Toggle the DMP's internal gyro bias tracker.
pub fn enable_gyro_cal<B: Bus>(bus: &mut B, enable: bool) -> Result<()> {
    let stanza: [u8; 9] = if enable {
        [0xb8, 0xaa, 0xb3, 0x8d, 0xb4, 0x98, 0x0d, 0x35, 0x5d]
    } else {
        [0xb8, 0xaa, 0xaa, 0xaa, 0xb0, 0x88, 0xc3, 0xc5, 0xc7]
    };
    bus.write_mem(addrs::CFG_MOTION_BIAS, &stanza)
}

/// Toggle gyro-only quaternion output. Unused in this driver but kept so
/// the feature mask stays symmetric with the six-axis variant.
pub fn enable_lp_quat<B: Bus>(bus: &mut B, enable: bool) -> Result<()> {
    let stanza: [u8; 4] = if enable {
        [0xb0, 0xb2, 0xb4, 0xb6]
    } else {
        [0x8b; 4]
    };
    bus.write_mem(addrs::CFG_LP_QUAT, &stanza)
}

/// Toggle the six-axis (accel + gyro) low-power quaternion.
pub fn enable_6x_lp_quat<B: Bus>(bus: &mut B, enable: bool) -> Result<()> {
    let stanza: [u8; 4] = if enable {
        [0x20, 0x28, 0x30, 0x38]
    } else {
        [0xa3; 4]
    };
    bus.write_mem(addrs::CFG_8, &stanza)
}

/// DMP interrupt cadence: every sample, or only on gestures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMode {
    Continuous,
    Gesture,
}

pub fn set_interrupt_mode<B: Bus>(bus: &mut B, mode: InterruptMode) -> Result<()> {
    const CONTINUOUS: [u8; 11] = [
        0xd8, 0xb1, 0xb9, 0xf3, 0x8b, 0xa3, 0x91, 0xb6, 0x09, 0xb4, 0xd9,
    ];
    const GESTURE: [u8; 11] = [
        0xda, 0xb1, 0xb9, 0xf3, 0x8b, 0xa3, 0x91, 0xb6, 0xda, 0xb4, 0xda,
    ];
    match mode {
        InterruptMode::Continuous => bus.write_mem(addrs::CFG_FIFO_ON_EVENT, &CONTINUOUS),
        InterruptMode::Gesture => bus.write_mem(addrs::CFG_FIFO_ON_EVENT, &GESTURE),
    }
}

/// Enable or disable the DMP data-ready interrupt, leaving raw-sample FIFO
/// capture off either way.
pub fn set_int_enable<B: Bus>(bus: &mut B, enable: bool) -> Result<()> {
    let bits = if enable {
        flags::INT_ENABLE::DMP_INT_EN.bits()
    } else {
        0
    };
    bus.write_byte(regs::INT_ENABLE, bits)?;
    bus.write_byte(regs::FIFO_EN, 0)
}

/// Stop, drain, and restart the FIFO and DMP.
///
/// Used once during bring-up and again whenever the packet stream
/// desynchronizes. Enabling DMP_EN without FIFO_EN yields out-of-bounds
/// quaternions, so both come back together.
pub fn reset_fifo<B: Bus>(bus: &mut B) -> Result<()> {
    bus.write_byte(regs::INT_ENABLE, 0)?;
    bus.write_byte(regs::FIFO_EN, 0)?;
    bus.write_byte(regs::USER_CTRL, 0)?;

    bus.write_byte(
        regs::USER_CTRL,
        (flags::USER_CTRL::FIFO_RST | flags::USER_CTRL::DMP_RST).bits(),
    )?;
    sleep(Duration::from_millis(50));

    bus.write_byte(
        regs::USER_CTRL,
        (flags::USER_CTRL::DMP_EN | flags::USER_CTRL::FIFO_EN).bits(),
    )?;
    bus.write_byte(regs::INT_ENABLE, flags::INT_ENABLE::DMP_INT_EN.bits())?;
    bus.write_byte(regs::FIFO_EN, 0)?;
    Ok(())
}

/// Turn the DMP interrupt path on or off, resetting the FIFO either way.
pub fn set_dmp_state<B: Bus>(bus: &mut B, addr: u16, enable: bool) -> Result<()> {
    if enable {
        set_int_enable(bus, false)?;
        crate::chip::set_bypass(bus, addr, true, true)?;
        bus.write_byte(regs::FIFO_EN, 0)?;
        set_int_enable(bus, true)?;
        reset_fifo(bus)?;
    } else {
        set_int_enable(bus, false)?;
        bus.write_byte(regs::FIFO_EN, 0)?;
        reset_fifo(bus)?;
    }
    Ok(())
}

/// Set the tap threshold for the selected axes, in mg/ms.
///
/// The threshold is normalized by the DMP sample rate and scaled by the
/// accelerometer sensitivity; a secondary threshold at 0.75x feeds the
/// firmware's two-stage detector.
pub fn set_tap_thresh<B: Bus>(bus: &mut B, axes: u8, thresh: u16, fsr: AccelFsr) -> Result<()> {
    if axes & TAP_XYZ == 0 || thresh > 1600 {
        return Err(Error::Config("tap threshold must be <= 1600 mg/ms"));
    }
    let scaled = thresh as f32 / dmp::SAMPLE_RATE as f32;
    let lsb = fsr.lsb_per_g() as f32;
    let dmp_thresh = (scaled * lsb) as u16;
    let dmp_thresh_2 = (scaled * lsb * 0.75) as u16;
    let t1 = dmp_thresh.to_be_bytes();
    let t2 = dmp_thresh_2.to_be_bytes();

    if axes & TAP_X != 0 {
        bus.write_mem(addrs::TAP_THX, &t1)?;
        bus.write_mem(addrs::D_1_36, &t2)?;
    }
    if axes & TAP_Y != 0 {
        bus.write_mem(addrs::TAP_THY, &t1)?;
        bus.write_mem(addrs::D_1_40, &t2)?;
    }
    if axes & TAP_Z != 0 {
        bus.write_mem(addrs::TAP_THZ, &t1)?;
        bus.write_mem(addrs::D_1_44, &t2)?;
    }
    Ok(())
}

/// Select which axes register taps.
pub fn set_tap_axes<B: Bus>(bus: &mut B, axes: u8) -> Result<()> {
    let mut bits = 0u8;
    if axes & TAP_X != 0 {
        bits |= 0x30;
    }
    if axes & TAP_Y != 0 {
        bits |= 0x0c;
    }
    if axes & TAP_Z != 0 {
        bits |= 0x03;
    }
    bus.write_mem(addrs::D_1_72, &[bits])
}

/// Minimum consecutive taps (1-4) before an interrupt fires.
pub fn set_tap_count<B: Bus>(bus: &mut B, min_taps: u8) -> Result<()> {
    let taps = min_taps.max(1).min(4) - 1;
    bus.write_mem(addrs::D_1_79, &[taps])
}

/// Milliseconds between valid taps.
pub fn set_tap_time<B: Bus>(bus: &mut B, time_ms: u16) -> Result<()> {
    let dmp_time = time_ms / (1000 / dmp::SAMPLE_RATE);
    bus.write_mem(addrs::TAPW_MIN, &dmp_time.to_be_bytes())
}

/// Maximum milliseconds between taps of a multi-tap.
pub fn set_tap_time_multi<B: Bus>(bus: &mut B, time_ms: u16) -> Result<()> {
    let dmp_time = time_ms / (1000 / dmp::SAMPLE_RATE);
    bus.write_mem(addrs::D_1_218, &dmp_time.to_be_bytes())
}

/// Gyro rate above which taps are rejected as shaking, in dps.
pub fn set_shake_reject_thresh<B: Bus>(bus: &mut B, sf: i64, thresh_dps: u16) -> Result<()> {
    let scaled = (sf / 1000 * thresh_dps as i64) as i32;
    bus.write_mem(addrs::D_1_92, &scaled.to_be_bytes())
}

/// How long the gyro must exceed the shake threshold before taps are
/// rejected. The firmware adds a fixed 60 ms on top.
pub fn set_shake_reject_time<B: Bus>(bus: &mut B, time_ms: u16) -> Result<()> {
    let t = time_ms / (1000 / dmp::SAMPLE_RATE);
    bus.write_mem(addrs::D_1_90, &t.to_be_bytes())
}

/// How long the gyro must stay back under the threshold before taps are
/// accepted again. The firmware adds a fixed 60 ms on top.
pub fn set_shake_reject_timeout<B: Bus>(bus: &mut B, time_ms: u16) -> Result<()> {
    let t = time_ms / (1000 / dmp::SAMPLE_RATE);
    bus.write_mem(addrs::D_1_88, &t.to_be_bytes())
}

/// Enable DMP features per the mask and return the resulting FIFO packet
/// length: 16 quaternion bytes, optional 6-byte accel and gyro blocks, and
/// the 4-byte gesture tail.
pub fn enable_features<B: Bus>(bus: &mut B, mask: u16, config: &Config) -> Result<usize> {
    // gyro integration scale factor first
    bus.write_mem(addrs::D_0_104, &(dmp::GYRO_SF as u32).to_be_bytes())?;

    // which sensor data lands in the FIFO
    let mut stanza = [0xa3u8; 10];
    if mask & dmp::FEATURE_SEND_RAW_ACCEL != 0 {
        stanza[1] = 0xc0;
        stanza[2] = 0xc8;
        stanza[3] = 0xc2;
    }
    if mask & dmp::FEATURE_SEND_ANY_GYRO != 0 {
        stanza[4] = 0xc4;
        stanza[5] = 0xcc;
        stanza[6] = 0xc6;
    }
    bus.write_mem(addrs::CFG_15, &stanza)?;

    // gesture data in the FIFO
    let gesture = if mask & (dmp::FEATURE_TAP | dmp::FEATURE_ANDROID_ORIENT) != 0 {
        0x20
    } else {
        0xd8
    };
    bus.write_mem(addrs::CFG_27, &[gesture])?;

    enable_gyro_cal(bus, mask & dmp::FEATURE_GYRO_CAL != 0)?;

    if mask & dmp::FEATURE_SEND_ANY_GYRO != 0 {
        let gyro_stanza: [u8; 4] = if mask & dmp::FEATURE_SEND_CAL_GYRO != 0 {
            [0xb2, 0x8b, 0xb6, 0x9b]
        } else {
            [0xc0, 0x80, 0xc2, 0x90]
        };
        bus.write_mem(addrs::CFG_GYRO_RAW_DATA, &gyro_stanza)?;
    }

    if mask & dmp::FEATURE_TAP != 0 {
        bus.write_mem(addrs::CFG_20, &[0xf8])?;
        set_tap_thresh(bus, TAP_XYZ, config.tap_threshold, config.accel_fsr)?;
        set_tap_axes(bus, TAP_XYZ)?;
        set_tap_count(bus, 1)?;
        set_tap_time(bus, 100)?;
        set_tap_time_multi(bus, 500)?;
        // shake rejection masks taps while the system moves; the stock 200
        // dps threshold trips constantly on a vehicle, so sit well above it
        set_shake_reject_thresh(bus, dmp::GYRO_SF, 600)?;
        set_shake_reject_time(bus, 40)?;
        set_shake_reject_timeout(bus, 10)?;
    } else {
        bus.write_mem(addrs::CFG_20, &[0xd8])?;
    }

    let android = if mask & dmp::FEATURE_ANDROID_ORIENT != 0 {
        0xd9
    } else {
        0xd8
    };
    bus.write_mem(addrs::CFG_ANDROID_ORIENT_INT, &[android])?;

    enable_lp_quat(bus, mask & dmp::FEATURE_LP_QUAT != 0)?;
    enable_6x_lp_quat(bus, mask & dmp::FEATURE_6X_LP_QUAT != 0)?;
    reset_fifo(bus)?;

    let mut packet_len = 0usize;
    if mask & dmp::FEATURE_SEND_RAW_ACCEL != 0 {
        packet_len += 6;
    }
    if mask & dmp::FEATURE_SEND_ANY_GYRO != 0 {
        packet_len += 6;
    }
    if mask & (dmp::FEATURE_LP_QUAT | dmp::FEATURE_6X_LP_QUAT) != 0 {
        packet_len += 16;
    }
    if mask & (dmp::FEATURE_TAP | dmp::FEATURE_ANDROID_ORIENT) != 0 {
        packet_len += 4;
    }
    Ok(packet_len)
}

/// Program the FIFO output rate: divisor = 200/rate - 1, followed by the
/// end-of-program stanza.
pub fn set_fifo_rate<B: Bus>(bus: &mut B, rate: u16) -> Result<()> {
    const REGS_END: [u8; 12] = [
        0xfe, 0xf2, 0xab, 0xc4, 0xaa, 0xf1, 0xdf, 0xdf, 0xbb, 0xaf, 0xdf, 0xdf,
    ];
    if rate > dmp::MAX_RATE || rate == 0 {
        return Err(Error::Config("DMP rate must be between 1 and 200 Hz"));
    }
    let div = dmp::MAX_RATE / rate - 1;
    bus.write_mem(addrs::D_0_22, &div.to_be_bytes())?;
    bus.write_mem(addrs::CFG_6, &REGS_END)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::{MockBus, Transfer};
    use mpu9250_regs::mpu9250::I2C_ADDRESS;

    /// Flatten a bank-paged address into the mock's linear memory.
    fn mem_index(addr: u16) -> usize {
        ((addr >> 8) as usize) * 256 + (addr & 0xff) as usize
    }

    #[test]
    fn firmware_uploads_in_chunks_and_verifies() {
        let mut bus = MockBus::new();
        load_firmware(&mut bus).unwrap();
        // image landed intact in DMP memory
        assert_eq!(&bus.mem[..dmp::CODE_SIZE], &FIRMWARE[..]);
        // every write was 16 bytes except possibly the tail
        let mem_writes: Vec<_> = bus
            .journal
            .iter()
            .filter_map(|t| match t {
                Transfer::Write { reg, data, .. } if *reg == regs::MEM_R_W => Some(data.len()),
                _ => None,
            })
            .collect();
        assert_eq!(mem_writes.len(), (dmp::CODE_SIZE + 15) / 16);
        assert!(mem_writes[..mem_writes.len() - 1].iter().all(|&l| l == 16));
        // entry point written last
        assert_eq!(
            bus.writes_to(I2C_ADDRESS, regs::PRGM_START_H),
            vec![vec![0x04, 0x00]]
        );
    }

    #[test]
    fn firmware_corruption_is_fatal() {
        let mut bus = MockBus::new();
        bus.corrupt_mem = true;
        assert!(matches!(
            load_firmware(&mut bus),
            Err(Error::FirmwareCorrupted { addr: 0 })
        ));
    }

    #[test]
    fn fifo_rate_divisor() {
        let mut bus = MockBus::new();
        set_fifo_rate(&mut bus, 100).unwrap();
        // div = 1, big endian at the rate address
        let d = mem_index(addrs::D_0_22);
        assert_eq!(&bus.mem[d..d + 2], &[0, 1]);
        // end-of-program stanza follows
        let cfg6 = mem_index(addrs::CFG_6);
        assert_eq!(bus.mem[cfg6], 0xfe);
        set_fifo_rate(&mut bus, 200).unwrap();
        assert_eq!(&bus.mem[d..d + 2], &[0, 0]);
        set_fifo_rate(&mut bus, 4).unwrap();
        assert_eq!(&bus.mem[d..d + 2], &[0, 49]);
    }

    #[test]
    fn feature_mask_packet_lengths() {
        let config = Config::default();
        let mut bus = MockBus::new();
        let quat_tap = dmp::FEATURE_6X_LP_QUAT | dmp::FEATURE_TAP;
        assert_eq!(enable_features(&mut bus, quat_tap, &config).unwrap(), 20);
        let all = quat_tap | dmp::FEATURE_SEND_RAW_ACCEL | dmp::FEATURE_SEND_ANY_GYRO;
        assert_eq!(enable_features(&mut bus, all, &config).unwrap(), 32);
    }

    #[test]
    fn tap_thresholds_scale_with_fsr() {
        let mut bus = MockBus::new();
        // 150 mg/ms at 200 Hz and +/-2g: 0.75 * 16384 = 12288, and 9216 for
        // the 0.75x secondary threshold
        set_tap_thresh(&mut bus, TAP_X, 150, AccelFsr::G2).unwrap();
        let m = mem_index(addrs::TAP_THX);
        assert_eq!(&bus.mem[m..m + 2], &12288u16.to_be_bytes());
        let m2 = mem_index(addrs::D_1_36);
        assert_eq!(&bus.mem[m2..m2 + 2], &9216u16.to_be_bytes());
        assert!(set_tap_thresh(&mut bus, TAP_X, 1700, AccelFsr::G2).is_err());
    }

    #[test]
    fn shake_reject_threshold_scaling() {
        let mut bus = MockBus::new();
        set_shake_reject_thresh(&mut bus, dmp::GYRO_SF, 600).unwrap();
        let expected = ((dmp::GYRO_SF / 1000 * 600) as i32).to_be_bytes();
        let m = mem_index(addrs::D_1_92);
        assert_eq!(&bus.mem[m..m + 4], &expected);
    }

    #[test]
    fn orientation_scalar_z_up() {
        let mut bus = MockBus::new();
        set_orientation(&mut bus, crate::config::Orientation::ZUp.scalar()).unwrap();
        // identity mount: rows select x, y, z with no sign flips
        let f1 = mem_index(addrs::FCFG_1);
        assert_eq!(&bus.mem[f1..f1 + 3], &[0x4c, 0xcd, 0x6c]);
        let f3 = mem_index(addrs::FCFG_3);
        assert_eq!(&bus.mem[f3..f3 + 3], &[0x36, 0x56, 0x76]);
    }

    #[test]
    fn orientation_scalar_z_down_flips_signs() {
        let mut bus = MockBus::new();
        set_orientation(&mut bus, crate::config::Orientation::ZDown.scalar()).unwrap();
        // 396 = x, y, z axes with sign flips on rows 0 and 2
        let f3 = mem_index(addrs::FCFG_3);
        assert_eq!(&bus.mem[f3..f3 + 3], &[0x37, 0x56, 0x77]);
    }

    #[test]
    fn reset_fifo_pulses_the_reset_bits() {
        let mut bus = MockBus::new();
        reset_fifo(&mut bus).unwrap();
        let writes = bus.writes_to(I2C_ADDRESS, regs::USER_CTRL);
        assert_eq!(writes, vec![vec![0x00], vec![0x0c], vec![0xc0]]);
        let int_writes = bus.writes_to(I2C_ADDRESS, regs::INT_ENABLE);
        assert_eq!(int_writes, vec![vec![0x00], vec![0x02]]);
    }
}
