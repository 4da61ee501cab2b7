//! Register-level bring-up of the MPU and the AK8963.

use std::thread::sleep;
use std::time::Duration;

use mpu9250_regs::ak8963;
use mpu9250_regs::mpu9250::{flags, regs, VALID_WHO_AM_I, TEMP_OFFSET_C, TEMP_SENSITIVITY};

use crate::bus::Bus;
use crate::config::{AccelDlpf, AccelFsr, Config, GyroDlpf, GyroFsr};
use crate::data::MpuData;
use crate::error::{Error, Result};

/// Gravity in m/s^2 for accel unit conversion.
pub const G_TO_MS2: f32 = 9.80665;

/// Magnetometer calibration state applied to every mag sample.
#[derive(Debug, Clone)]
pub struct MagCal {
    /// Factory sensitivity adjustment from the AK8963 fuse ROM.
    pub factory_adjust: [f32; 3],
    /// User offsets in uT, from the calibration file.
    pub offsets: [f32; 3],
    /// User scale factors, from the calibration file.
    pub scales: [f32; 3],
}

impl Default for MagCal {
    fn default() -> MagCal {
        MagCal {
            factory_adjust: [1.0; 3],
            offsets: [0.0; 3],
            scales: [1.0; 3],
        }
    }
}

/// Write a register, retrying once after 10 ms on a transport error. Used
/// on the power-management writes where the part may still be waking up.
pub fn write_byte_retry<B: Bus>(bus: &mut B, reg: u8, value: u8) -> Result<()> {
    if bus.write_byte(reg, value).is_ok() {
        return Ok(());
    }
    sleep(Duration::from_millis(10));
    bus.write_byte(reg, value)
}

/// Reset the device to power-on defaults and wait for it to come back.
pub fn reset_mpu<B: Bus>(bus: &mut B, addr: u16) -> Result<()> {
    bus.set_device_address(addr)?;
    write_byte_retry(bus, regs::PWR_MGMT_1, flags::PWR_MGMT_1::H_RESET.bits())?;
    // clear sleep and every other power management feature
    write_byte_retry(bus, regs::PWR_MGMT_1, 0)?;
    sleep(Duration::from_millis(100));
    Ok(())
}

/// Verify the chip identifies as a supported part.
pub fn check_who_am_i<B: Bus>(bus: &mut B) -> Result<u8> {
    let id = bus.read_byte(regs::WHO_AM_I)?;
    if !VALID_WHO_AM_I.contains(&id) {
        log::error!("unrecognized WHO_AM_I {:#04x}", id);
        return Err(Error::DeviceIdMismatch { found: id });
    }
    Ok(id)
}

/// Set the accelerometer full scale range and record the conversion factor.
pub fn set_accel_fsr<B: Bus>(bus: &mut B, fsr: AccelFsr, data: &mut MpuData) -> Result<()> {
    let cfg = match fsr {
        AccelFsr::G2 => flags::ACCEL_FSR_CFG_2G,
        AccelFsr::G4 => flags::ACCEL_FSR_CFG_4G,
        AccelFsr::G8 => flags::ACCEL_FSR_CFG_8G,
        AccelFsr::G16 => flags::ACCEL_FSR_CFG_16G,
    };
    data.accel_to_ms2 = G_TO_MS2 * fsr.range_g() / 32768.0;
    bus.write_byte(regs::ACCEL_CONFIG, cfg)
}

/// Set the gyro full scale range and record the conversion factor.
pub fn set_gyro_fsr<B: Bus>(bus: &mut B, fsr: GyroFsr, data: &mut MpuData) -> Result<()> {
    let cfg = match fsr {
        GyroFsr::Dps250 => flags::GYRO_FSR_CFG_250,
        GyroFsr::Dps500 => flags::GYRO_FSR_CFG_500,
        GyroFsr::Dps1000 => flags::GYRO_FSR_CFG_1000,
        GyroFsr::Dps2000 => flags::GYRO_FSR_CFG_2000,
    } | flags::FCHOICE_B_DLPF_EN;
    data.gyro_to_degs = fsr.range_dps() / 32768.0;
    bus.write_byte(regs::GYRO_CONFIG, cfg)
}

/// Set the accel DLPF. The same register selects the FIFO size; the DMP
/// needs the FIFO pinned at 1 kB because the first 3 kB of shared memory
/// hold its program.
pub fn set_accel_dlpf<B: Bus>(bus: &mut B, dlpf: AccelDlpf) -> Result<()> {
    let cfg = match dlpf {
        AccelDlpf::Off => flags::ACCEL_FCHOICE_4KHZ | flags::BIT_FIFO_SIZE_1024,
        bandwidth => {
            flags::ACCEL_FCHOICE_1KHZ
                | flags::BIT_FIFO_SIZE_1024
                | match bandwidth {
                    AccelDlpf::Off => unreachable!(),
                    AccelDlpf::Hz460 => 0,
                    AccelDlpf::Hz184 => 1,
                    AccelDlpf::Hz92 => 2,
                    AccelDlpf::Hz41 => 3,
                    AccelDlpf::Hz20 => 4,
                    AccelDlpf::Hz10 => 5,
                    AccelDlpf::Hz5 => 6,
                }
        }
    };
    bus.write_byte(regs::ACCEL_CONFIG_2, cfg)
}

/// Set the gyro DLPF. The same register selects the FIFO overflow mode,
/// which is kept at replace-oldest so stale data never wedges the stream.
pub fn set_gyro_dlpf<B: Bus>(bus: &mut B, dlpf: GyroDlpf) -> Result<()> {
    let cfg = flags::FIFO_MODE_REPLACE_OLD
        | match dlpf {
            // not actually off, 3600 Hz is the widest the part goes
            GyroDlpf::Off => 7,
            GyroDlpf::Hz250 => 0,
            GyroDlpf::Hz184 => 1,
            GyroDlpf::Hz92 => 2,
            GyroDlpf::Hz41 => 3,
            GyroDlpf::Hz20 => 4,
            GyroDlpf::Hz10 => 5,
            GyroDlpf::Hz5 => 6,
        };
    bus.write_byte(regs::CONFIG, cfg)
}

/// Program the accel/gyro sample rate divider: rate = 1000/(1 + div).
pub fn set_sample_rate<B: Bus>(bus: &mut B, rate: u16) -> Result<()> {
    if !(4..=1000).contains(&rate) {
        return Err(Error::Config("sample rate must be between 4 and 1000 Hz"));
    }
    let div = (1000 / rate - 1) as u8;
    bus.write_byte(regs::SMPLRT_DIV, div)
}

/// Toggle the I2C bypass mux and configure the interrupt pin behavior.
///
/// In bypass the host talks to the AK8963 directly; otherwise the MPU's
/// own I2C master owns the auxiliary bus. `dmp_en` keeps the FIFO enabled
/// in USER_CTRL while the DMP is driving it.
pub fn set_bypass<B: Bus>(bus: &mut B, addr: u16, bypass_on: bool, dmp_en: bool) -> Result<()> {
    bus.set_device_address(addr)?;
    let mut user_ctrl = flags::USER_CTRL::empty();
    if dmp_en {
        user_ctrl |= flags::USER_CTRL::FIFO_EN;
    }
    if !bypass_on {
        user_ctrl |= flags::USER_CTRL::I2C_MST_EN;
    }
    bus.write_byte(regs::USER_CTRL, user_ctrl.bits())?;
    sleep(Duration::from_millis(3));
    let mut pin_cfg =
        flags::INT_PIN_CFG::LATCH_INT_EN | flags::INT_PIN_CFG::INT_ANYRD_CLEAR | flags::INT_PIN_CFG::ACTL;
    if bypass_on {
        pin_cfg |= flags::INT_PIN_CFG::BYPASS_EN;
    }
    bus.write_byte(regs::INT_PIN_CFG, pin_cfg.bits())
}

/// Bring up the AK8963 for 16-bit continuous sampling at 100 Hz and read
/// the factory sensitivity adjustment out of fuse ROM.
///
/// Leaves bypass enabled and the bus addressed back at the MPU.
pub fn init_magnetometer<B: Bus>(bus: &mut B, addr: u16, dmp_en: bool) -> Result<[f32; 3]> {
    set_bypass(bus, addr, true, dmp_en)?;
    bus.set_device_address(ak8963::I2C_ADDRESS)?;
    bus.write_byte(ak8963::regs::CNTL, ak8963::flags::POWER_DOWN)?;
    sleep(Duration::from_millis(1));
    bus.write_byte(ak8963::regs::CNTL, ak8963::flags::FUSE_ROM_ACCESS)?;
    sleep(Duration::from_millis(1));
    let mut raw = [0u8; 3];
    if let Err(e) = bus.read_bytes(ak8963::regs::ASAX, &mut raw) {
        log::error!("failed to read magnetometer sensitivity adjustment");
        bus.set_device_address(addr)?;
        set_bypass(bus, addr, false, dmp_en)?;
        return Err(e);
    }
    let adjust = [
        (raw[0] as f32 - 128.0) / 256.0 + 1.0,
        (raw[1] as f32 - 128.0) / 256.0 + 1.0,
        (raw[2] as f32 - 128.0) / 256.0 + 1.0,
    ];
    bus.write_byte(ak8963::regs::CNTL, ak8963::flags::POWER_DOWN)?;
    sleep(Duration::from_micros(100));
    bus.write_byte(
        ak8963::regs::CNTL,
        ak8963::flags::SCALE_16_BIT | ak8963::flags::CONT_MES_2,
    )?;
    sleep(Duration::from_micros(100));
    bus.set_device_address(addr)?;
    Ok(adjust)
}

/// Power the AK8963 down.
pub fn power_off_magnetometer<B: Bus>(bus: &mut B, addr: u16, dmp_en: bool) -> Result<()> {
    bus.set_device_address(addr)?;
    set_bypass(bus, addr, true, dmp_en)?;
    bus.set_device_address(ak8963::I2C_ADDRESS)?;
    bus.write_byte(ak8963::regs::CNTL, ak8963::flags::POWER_DOWN)?;
    bus.set_device_address(addr)?;
    Ok(())
}

/// Read the latest accelerometer sample. The sensor self-samples at the
/// programmed rate; this fetches whatever is newest.
pub fn read_accel<B: Bus>(bus: &mut B, addr: u16, data: &mut MpuData) -> Result<()> {
    bus.set_device_address(addr)?;
    let mut raw = [0u8; 6];
    bus.read_bytes(regs::ACCEL_XOUT_H, &mut raw)?;
    for i in 0..3 {
        data.raw_accel[i] = i16::from_be_bytes([raw[2 * i], raw[2 * i + 1]]);
        data.accel[i] = data.raw_accel[i] as f32 * data.accel_to_ms2;
    }
    Ok(())
}

/// Read the latest gyroscope sample.
pub fn read_gyro<B: Bus>(bus: &mut B, addr: u16, data: &mut MpuData) -> Result<()> {
    bus.set_device_address(addr)?;
    let mut raw = [0u8; 6];
    bus.read_bytes(regs::GYRO_XOUT_H, &mut raw)?;
    for i in 0..3 {
        data.raw_gyro[i] = i16::from_be_bytes([raw[2 * i], raw[2 * i + 1]]);
        data.gyro[i] = data.raw_gyro[i] as f32 * data.gyro_to_degs;
    }
    Ok(())
}

/// Read the die temperature in degrees C.
pub fn read_temp<B: Bus>(bus: &mut B, addr: u16, data: &mut MpuData) -> Result<()> {
    bus.set_device_address(addr)?;
    let adc = bus.read_word(regs::TEMP_OUT_H)? as i16;
    data.temp = TEMP_OFFSET_C + adc as f32 / TEMP_SENSITIVITY;
    Ok(())
}

/// Read a magnetometer sample if one is ready.
///
/// The AK8963's axes are rotated relative to the accel/gyro frame, so the
/// raw axes are re-ordered `(x, y, z) <- (y, x, -z)` before the factory
/// adjustment and user calibration are applied. Requires bypass (or the
/// MPU's I2C master) to be routing the auxiliary bus.
pub fn read_mag<B: Bus>(bus: &mut B, cal: &MagCal, data: &mut MpuData) -> Result<()> {
    bus.set_device_address(ak8963::I2C_ADDRESS)?;
    let st1 = bus.read_byte(ak8963::regs::ST1)?;
    if st1 & ak8963::flags::DATA_READY == 0 {
        return Err(Error::MagNotReady);
    }
    // 6 data bytes plus ST2; touching ST2 ends the measurement cycle
    let mut raw = [0u8; 7];
    bus.read_bytes(ak8963::regs::HXL, &mut raw)?;
    if raw[6] & ak8963::flags::OVERFLOW != 0 {
        return Err(Error::MagSaturated);
    }
    let adc = [
        i16::from_le_bytes([raw[0], raw[1]]),
        i16::from_le_bytes([raw[2], raw[3]]),
        i16::from_le_bytes([raw[4], raw[5]]),
    ];
    let factory = [
        adc[1] as f32 * cal.factory_adjust[1] * ak8963::MAG_RAW_TO_UT,
        adc[0] as f32 * cal.factory_adjust[0] * ak8963::MAG_RAW_TO_UT,
        -(adc[2] as f32) * cal.factory_adjust[2] * ak8963::MAG_RAW_TO_UT,
    ];
    for i in 0..3 {
        // guard against a zero scale from a corrupt calibration file
        let scale = if cal.scales[i] == 0.0 { 1.0 } else { cal.scales[i] };
        data.mag[i] = (factory[i] - cal.offsets[i]) * scale;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;
    use mpu9250_regs::mpu9250::I2C_ADDRESS;

    #[test]
    fn reset_writes_h_reset_then_clears() {
        let mut bus = MockBus::new();
        reset_mpu(&mut bus, I2C_ADDRESS).unwrap();
        let writes = bus.writes_to(I2C_ADDRESS, regs::PWR_MGMT_1);
        assert_eq!(writes, vec![vec![0x80], vec![0x00]]);
    }

    #[test]
    fn who_am_i_accepts_the_family() {
        for id in [0x68u8, 0x69, 0x70, 0x71, 0x75] {
            let mut bus = MockBus::new();
            bus.set_reg(I2C_ADDRESS, regs::WHO_AM_I, id);
            assert_eq!(check_who_am_i(&mut bus).unwrap(), id);
        }
    }

    #[test]
    fn who_am_i_rejects_strangers() {
        let mut bus = MockBus::new();
        bus.set_reg(I2C_ADDRESS, regs::WHO_AM_I, 0x42);
        assert!(matches!(
            check_who_am_i(&mut bus),
            Err(Error::DeviceIdMismatch { found: 0x42 })
        ));
    }

    #[test]
    fn accel_fsr_sets_register_and_scale() {
        let mut bus = MockBus::new();
        let mut data = MpuData::default();
        set_accel_fsr(&mut bus, AccelFsr::G4, &mut data).unwrap();
        assert_eq!(bus.reg(I2C_ADDRESS, regs::ACCEL_CONFIG), 1 << 3);
        // raw 8192 at +/-4g is exactly 1 g
        let ms2 = 8192.0 * data.accel_to_ms2;
        assert!((ms2 - G_TO_MS2).abs() < 1e-5);
    }

    #[test]
    fn gyro_fsr_sets_register_and_scale() {
        let mut bus = MockBus::new();
        let mut data = MpuData::default();
        set_gyro_fsr(&mut bus, GyroFsr::Dps1000, &mut data).unwrap();
        assert_eq!(bus.reg(I2C_ADDRESS, regs::GYRO_CONFIG), 2 << 3);
        assert!((data.gyro_to_degs - 1000.0 / 32768.0).abs() < 1e-9);
    }

    #[test]
    fn dlpf_registers_carry_fifo_bits() {
        let mut bus = MockBus::new();
        set_accel_dlpf(&mut bus, AccelDlpf::Hz92).unwrap();
        assert_eq!(
            bus.reg(I2C_ADDRESS, regs::ACCEL_CONFIG_2),
            flags::BIT_FIFO_SIZE_1024 | 2
        );
        set_accel_dlpf(&mut bus, AccelDlpf::Off).unwrap();
        assert_eq!(
            bus.reg(I2C_ADDRESS, regs::ACCEL_CONFIG_2),
            flags::ACCEL_FCHOICE_4KHZ | flags::BIT_FIFO_SIZE_1024
        );
        set_gyro_dlpf(&mut bus, GyroDlpf::Hz41).unwrap();
        assert_eq!(bus.reg(I2C_ADDRESS, regs::CONFIG), 3);
        set_gyro_dlpf(&mut bus, GyroDlpf::Off).unwrap();
        assert_eq!(bus.reg(I2C_ADDRESS, regs::CONFIG), 7);
    }

    #[test]
    fn sample_rate_divider() {
        let mut bus = MockBus::new();
        set_sample_rate(&mut bus, 200).unwrap();
        assert_eq!(bus.reg(I2C_ADDRESS, regs::SMPLRT_DIV), 4);
        set_sample_rate(&mut bus, 1000).unwrap();
        assert_eq!(bus.reg(I2C_ADDRESS, regs::SMPLRT_DIV), 0);
        assert!(set_sample_rate(&mut bus, 2000).is_err());
    }

    #[test]
    fn bypass_configures_user_ctrl_and_int_pin() {
        let mut bus = MockBus::new();
        set_bypass(&mut bus, I2C_ADDRESS, true, true).unwrap();
        assert_eq!(bus.reg(I2C_ADDRESS, regs::USER_CTRL), 0x40);
        assert_eq!(bus.reg(I2C_ADDRESS, regs::INT_PIN_CFG), 0x80 | 0x20 | 0x10 | 0x02);
        set_bypass(&mut bus, I2C_ADDRESS, false, false).unwrap();
        assert_eq!(bus.reg(I2C_ADDRESS, regs::USER_CTRL), 0x20);
        assert_eq!(bus.reg(I2C_ADDRESS, regs::INT_PIN_CFG), 0x80 | 0x20 | 0x10);
    }

    #[test]
    fn mag_init_reads_fuse_rom_adjustment() {
        let mut bus = MockBus::new();
        bus.set_reg(ak8963::I2C_ADDRESS, ak8963::regs::ASAX, 128);
        bus.set_reg(ak8963::I2C_ADDRESS, ak8963::regs::ASAX + 1, 192);
        bus.set_reg(ak8963::I2C_ADDRESS, ak8963::regs::ASAX + 2, 64);
        let adjust = init_magnetometer(&mut bus, I2C_ADDRESS, false).unwrap();
        assert!((adjust[0] - 1.0).abs() < 1e-6);
        assert!((adjust[1] - 1.25).abs() < 1e-6);
        assert!((adjust[2] - 0.75).abs() < 1e-6);
        // final mode: 16-bit continuous 2
        assert_eq!(bus.reg(ak8963::I2C_ADDRESS, ak8963::regs::CNTL), 0x16);
    }

    #[test]
    fn mag_read_reorders_axes_and_applies_cal() {
        let mut bus = MockBus::new();
        bus.set_reg(ak8963::I2C_ADDRESS, ak8963::regs::ST1, 0x01);
        // x=100, y=-200, z=50 little endian
        let vals: [i16; 3] = [100, -200, 50];
        for (i, v) in vals.iter().enumerate() {
            let b = v.to_le_bytes();
            bus.set_reg(ak8963::I2C_ADDRESS, ak8963::regs::HXL + 2 * i as u8, b[0]);
            bus.set_reg(ak8963::I2C_ADDRESS, ak8963::regs::HXL + 2 * i as u8 + 1, b[1]);
        }
        let cal = MagCal::default();
        let mut data = MpuData::default();
        read_mag(&mut bus, &cal, &mut data).unwrap();
        let ut = ak8963::MAG_RAW_TO_UT;
        assert!((data.mag[0] - -200.0 * ut).abs() < 1e-3);
        assert!((data.mag[1] - 100.0 * ut).abs() < 1e-3);
        assert!((data.mag[2] - -50.0 * ut).abs() < 1e-3);
    }

    #[test]
    fn mag_read_skips_when_not_ready_or_saturated() {
        let mut bus = MockBus::new();
        let cal = MagCal::default();
        let mut data = MpuData::default();
        assert!(matches!(
            read_mag(&mut bus, &cal, &mut data),
            Err(Error::MagNotReady)
        ));
        bus.set_reg(ak8963::I2C_ADDRESS, ak8963::regs::ST1, 0x01);
        bus.set_reg(ak8963::I2C_ADDRESS, ak8963::regs::ST2, 0x08);
        assert!(matches!(
            read_mag(&mut bus, &cal, &mut data),
            Err(Error::MagSaturated)
        ));
    }
}
