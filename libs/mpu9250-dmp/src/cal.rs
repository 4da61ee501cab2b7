//! Calibration routines and their persistent state.
//!
//! Gyro calibration measures the steady-state bias and parks it in the
//! hardware offset registers; magnetometer calibration fits an ellipsoid to
//! a field sweep and maps it onto a sphere. Both persist to plain text
//! files so results survive reboots, and both are standalone entry points
//! meant to run from the shipped calibration programs with the sensor
//! otherwise idle.

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use imu_math::{algebra, Matrix, Vector};
use mpu9250_regs::mpu9250::{flags, regs};

use crate::bus::{Bus, I2cBus};
use crate::chip::{self, MagCal};
use crate::config::Config;
use crate::data::MpuData;
use crate::error::{Error, Result};

/// Three decimal-integer lines of raw gyro bias counts.
pub const GYRO_CAL_FILE: &str = "gyro.cal";
/// Six float lines: offsets x/y/z in uT, then scale factors x/y/z.
pub const MAG_CAL_FILE: &str = "mag.cal";

/// Per-axis standard deviation (raw counts) above which the device is
/// considered to be moving.
const GYRO_CAL_THRESH: f32 = 50.0;
/// Mean bias magnitude (raw counts) beyond which something other than
/// bias is being measured.
const GYRO_OFFSET_THRESH: i32 = 500;

const MAG_SAMPLES: usize = 200;
const MAG_SAMPLE_RATE_HZ: u32 = 15;

// ---------------------------------------------------------------------
// persistent state
// ---------------------------------------------------------------------

/// Load gyro offsets from disk. A missing file is not an error: the driver
/// warns and runs with zero offsets until a calibration is performed.
pub fn load_gyro_offsets(dir: &Path) -> [i32; 3] {
    let path = dir.join(GYRO_CAL_FILE);
    match fs::read_to_string(&path) {
        Ok(text) => {
            let mut vals = text.lines().filter_map(|l| l.trim().parse::<i32>().ok());
            match (vals.next(), vals.next(), vals.next()) {
                (Some(x), Some(y), Some(z)) => [x, y, z],
                _ => {
                    log::warn!("malformed gyro calibration file {:?}, using zeros", path);
                    [0; 3]
                }
            }
        }
        Err(_) => {
            log::warn!("no gyro calibration data found, please run the gyro calibration");
            [0; 3]
        }
    }
}

pub fn write_gyro_offsets(dir: &Path, offsets: &[i16; 3]) -> Result<()> {
    fs::create_dir_all(dir)?;
    let mut f = fs::File::create(dir.join(GYRO_CAL_FILE))?;
    writeln!(f, "{}\n{}\n{}", offsets[0], offsets[1], offsets[2])?;
    Ok(())
}

/// Load magnetometer offsets and scales. Missing data falls back to zero
/// offsets and unit scales.
pub fn load_mag_cal(dir: &Path) -> ([f32; 3], [f32; 3]) {
    let path = dir.join(MAG_CAL_FILE);
    let fallback = ([0.0; 3], [1.0; 3]);
    match fs::read_to_string(&path) {
        Ok(text) => {
            let vals: Vec<f32> = text
                .lines()
                .filter_map(|l| l.trim().parse::<f32>().ok())
                .collect();
            if vals.len() < 6 {
                log::warn!("malformed mag calibration file {:?}, using defaults", path);
                return fallback;
            }
            (
                [vals[0], vals[1], vals[2]],
                [vals[3], vals[4], vals[5]],
            )
        }
        Err(_) => {
            log::warn!("no magnetometer calibration data found, please run the mag calibration");
            fallback
        }
    }
}

pub fn write_mag_cal(dir: &Path, offsets: &[f32; 3], scales: &[f32; 3]) -> Result<()> {
    fs::create_dir_all(dir)?;
    let mut f = fs::File::create(dir.join(MAG_CAL_FILE))?;
    for v in offsets.iter().chain(scales.iter()) {
        writeln!(f, "{}", v)?;
    }
    Ok(())
}

pub fn is_gyro_calibrated(dir: &Path) -> bool {
    dir.join(GYRO_CAL_FILE).exists()
}

pub fn is_mag_calibrated(dir: &Path) -> bool {
    dir.join(MAG_CAL_FILE).exists()
}

/// Encode stored offsets for the `XG_OFFSET_H..ZG_OFFSET_L` registers.
///
/// The hardware expects the bias in a 32.9 LSB/deg/s format, a quarter of
/// the +/-250 dps sensitivity the calibration samples at, negated so the
/// steady state subtracts out.
pub fn gyro_offset_bytes(offsets: &[i32; 3]) -> [u8; 6] {
    let mut out = [0u8; 6];
    for (i, &v) in offsets.iter().enumerate() {
        let bias = -v / 4;
        out[2 * i] = ((bias >> 8) & 0xff) as u8;
        out[2 * i + 1] = (bias & 0xff) as u8;
    }
    out
}

/// Load the gyro calibration file and push it into the offset registers.
pub fn apply_gyro_offsets<B: Bus>(bus: &mut B, dir: &Path) -> Result<()> {
    let offsets = load_gyro_offsets(dir);
    bus.write_bytes(regs::XG_OFFSET_H, &gyro_offset_bytes(&offsets))
}

// ---------------------------------------------------------------------
// gyro calibration
// ---------------------------------------------------------------------

/// One 0.4 s capture of raw gyro samples through the hardware FIFO.
fn collect_gyro_samples<B: Bus>(bus: &mut B) -> Result<(Vector, Vector, Vector)> {
    bus.write_byte(regs::USER_CTRL, flags::USER_CTRL::FIFO_EN.bits())?;
    let gyro_fifo =
        flags::FIFO_EN::GYRO_X | flags::FIFO_EN::GYRO_Y | flags::FIFO_EN::GYRO_Z;
    bus.write_byte(regs::FIFO_EN, gyro_fifo.bits())?;
    // 6 bytes per sample at 200 Hz
    sleep(Duration::from_millis(400));
    bus.write_byte(regs::FIFO_EN, 0)?;

    let fifo_count = bus.read_word(regs::FIFO_COUNTH)? as usize;
    let samples = fifo_count / 6;
    let mut vx = Vector::zeros(samples.max(1));
    let mut vy = Vector::zeros(samples.max(1));
    let mut vz = Vector::zeros(samples.max(1));
    let mut raw = [0u8; 6];
    for i in 0..samples {
        bus.read_bytes(regs::FIFO_R_W, &mut raw)?;
        vx[i] = i16::from_be_bytes([raw[0], raw[1]]) as f32;
        vy[i] = i16::from_be_bytes([raw[2], raw[3]]) as f32;
        vz[i] = i16::from_be_bytes([raw[4], raw[5]]) as f32;
    }
    Ok((vx, vy, vz))
}

/// Sample the stationary gyro and return per-axis mean bias in raw counts.
///
/// Captures repeat until one comes back quiet: per-axis standard deviation
/// under 50 LSB and mean bias under 500 LSB. The first quiet capture after
/// a noisy one is discarded too, so a device that was just set down gets a
/// settling period.
pub fn measure_gyro_bias<B: Bus>(bus: &mut B, max_attempts: usize) -> Result<[i16; 3]> {
    // calibration-specific sampling: 188 Hz DLPF, 200 Hz rate, most
    // sensitive gyro range
    bus.write_byte(regs::PWR_MGMT_1, 0x01)?;
    bus.write_byte(regs::PWR_MGMT_2, 0x00)?;
    sleep(Duration::from_millis(200));
    bus.write_byte(regs::INT_ENABLE, 0x00)?;
    bus.write_byte(regs::FIFO_EN, 0x00)?;
    bus.write_byte(regs::PWR_MGMT_1, 0x00)?;
    bus.write_byte(regs::I2C_MST_CTRL, 0x00)?;
    bus.write_byte(regs::USER_CTRL, 0x00)?;
    bus.write_byte(
        regs::USER_CTRL,
        (flags::USER_CTRL::FIFO_RST | flags::USER_CTRL::DMP_RST).bits(),
    )?;
    sleep(Duration::from_millis(15));
    bus.write_byte(regs::CONFIG, 0x01)?;
    bus.write_byte(regs::SMPLRT_DIV, 0x04)?;
    bus.write_byte(regs::GYRO_CONFIG, 0x00)?;
    bus.write_byte(regs::ACCEL_CONFIG, 0x00)?;

    let mut was_last_steady = true;
    for _ in 0..max_attempts {
        let (vx, vy, vz) = collect_gyro_samples(bus)?;
        let samples = vx.len();
        if samples == 0 {
            return Err(Error::CalibrationNoisy);
        }
        if vx.std_dev() > GYRO_CAL_THRESH
            || vy.std_dev() > GYRO_CAL_THRESH
            || vz.std_dev() > GYRO_CAL_THRESH
        {
            println!("Gyro data too noisy, put me down on a solid surface!");
            println!("trying again");
            was_last_steady = false;
            continue;
        }
        // skip the first steady reading after a noisy one so the device
        // has settled after being picked up
        if !was_last_steady {
            was_last_steady = true;
            continue;
        }
        let means = [
            vx.mean().round() as i32,
            vy.mean().round() as i32,
            vz.mean().round() as i32,
        ];
        if means.iter().any(|m| m.abs() > GYRO_OFFSET_THRESH) {
            println!("Gyro data out of bounds, put me down on a solid surface!");
            println!("trying again");
            continue;
        }
        return Ok([means[0] as i16, means[1] as i16, means[2] as i16]);
    }
    Err(Error::CalibrationNoisy)
}

/// Full gyro calibration: sample the stationary device, persist the bias,
/// and load it into the offset registers.
pub fn calibrate_gyro_routine(conf: &Config) -> Result<()> {
    let mut bus = I2cBus::new(conf.i2c_bus, conf.i2c_addr)?;
    if bus.is_locked() {
        log::error!("i2c bus claimed by another process, aborting gyro calibration");
        return Err(Error::Config("i2c bus is claimed"));
    }
    bus.lock();
    let result = (|| {
        chip::reset_mpu(&mut bus, conf.i2c_addr)?;
        let offsets = measure_gyro_bias(&mut bus, 100)?;
        write_gyro_offsets(&conf.cal_dir, &offsets)?;
        let raw = [offsets[0] as i32, offsets[1] as i32, offsets[2] as i32];
        bus.write_bytes(regs::XG_OFFSET_H, &gyro_offset_bytes(&raw))?;
        Ok(())
    })();
    bus.unlock();
    result
}

// ---------------------------------------------------------------------
// magnetometer calibration
// ---------------------------------------------------------------------

/// Fit collected field samples and derive offsets and scales.
///
/// The fitted center must sit within 200 uT of zero on every axis; axis
/// lengths outside 5..200 uT only warn, matching how tolerant the fit is
/// of partial coverage. Scales map each axis onto a 70 uT sphere.
pub fn fit_mag_calibration(samples: &Matrix) -> Result<([f32; 3], [f32; 3])> {
    let (center, lengths) = algebra::fit_ellipsoid(samples).map_err(|e| {
        log::error!("failed to fit ellipsoid to magnetometer data: {}", e);
        Error::EllipsoidFitFailed
    })?;
    if (0..3).any(|i| center[i].abs() > 200.0) {
        log::error!(
            "center of fitted ellipsoid out of bounds: ({}, {}, {})",
            center[0],
            center[1],
            center[2]
        );
        return Err(Error::EllipsoidFitFailed);
    }
    if (0..3).any(|i| lengths[i] <= 5.0 || lengths[i] >= 200.0) {
        log::warn!(
            "length of fitted ellipsoid out of bounds: ({}, {}, {})",
            lengths[0],
            lengths[1],
            lengths[2]
        );
    }
    let offsets = [center[0], center[1], center[2]];
    let scales = [
        70.0 / lengths[0],
        70.0 / lengths[1],
        70.0 / lengths[2],
    ];
    Ok((offsets, scales))
}

/// Collect a user-rotated field sweep.
fn collect_mag_samples<B: Bus>(bus: &mut B, cal: &MagCal) -> Result<Matrix> {
    let mut samples = Matrix::zeros(MAG_SAMPLES, 3);
    let mut data = MpuData::default();
    let mut i = 0;
    while i < MAG_SAMPLES {
        match chip::read_mag(bus, cal, &mut data) {
            Ok(()) => {
                if data.mag == [0.0, 0.0, 0.0] {
                    log::error!("retrieved all zeros from magnetometer");
                    return Err(Error::EllipsoidFitFailed);
                }
                for k in 0..3 {
                    samples.set(i, k, data.mag[k]);
                }
                i += 1;
                // nudge the user along; a full sweep takes a while
                let period = (MAG_SAMPLE_RATE_HZ * 4) as usize;
                if i % period == period / 2 {
                    println!("keep spinning");
                } else if i % period == 0 {
                    println!("you're doing great");
                }
            }
            Err(Error::MagNotReady) | Err(Error::MagSaturated) => {}
            Err(e) => return Err(e),
        }
        sleep(Duration::from_micros(1_000_000 / MAG_SAMPLE_RATE_HZ as u64));
    }
    Ok(samples)
}

/// Full magnetometer calibration: sample while the user rotates the
/// device, fit, sanity-check, and persist. The calibration file is left
/// untouched when the fit fails.
pub fn calibrate_mag_routine(conf: &Config) -> Result<()> {
    let mut bus = I2cBus::new(conf.i2c_bus, conf.i2c_addr)?;
    if bus.is_locked() {
        log::error!("i2c bus claimed by another process, aborting mag calibration");
        return Err(Error::Config("i2c bus is claimed"));
    }
    bus.lock();
    let sampled = (|| {
        chip::reset_mpu(&mut bus, conf.i2c_addr)?;
        chip::check_who_am_i(&mut bus)?;
        let factory_adjust = chip::init_magnetometer(&mut bus, conf.i2c_addr, false)?;
        // raw sweep: offsets zero, scales unity
        let cal = MagCal {
            factory_adjust,
            ..MagCal::default()
        };
        println!("spin the device in every direction until sampling finishes");
        collect_mag_samples(&mut bus, &cal)
    })();
    // power the chip back down whatever happened
    let _ = bus.set_device_address(conf.i2c_addr);
    let _ = chip::write_byte_retry(&mut bus, regs::PWR_MGMT_1, flags::PWR_MGMT_1::H_RESET.bits());
    let _ = chip::write_byte_retry(&mut bus, regs::PWR_MGMT_1, flags::PWR_MGMT_1::SLEEP.bits());
    bus.unlock();

    let samples = sampled?;
    println!("\nOkay Stop!");
    println!("Calculating calibration constants.....");
    let (offsets, scales) = fit_mag_calibration(&samples)?;
    println!(
        "Offsets X: {:7.3} Y: {:7.3} Z: {:7.3}",
        offsets[0], offsets[1], offsets[2]
    );
    println!(
        "Scales  X: {:7.3} Y: {:7.3} Z: {:7.3}",
        scales[0], scales[1], scales[2]
    );
    write_mag_cal(&conf.cal_dir, &offsets, &scales)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;
    use mpu9250_regs::mpu9250::I2C_ADDRESS;
    use tempfile::tempdir;

    #[test]
    fn gyro_file_round_trip() {
        let dir = tempdir().unwrap();
        write_gyro_offsets(dir.path(), &[12, -34, 5]).unwrap();
        assert!(is_gyro_calibrated(dir.path()));
        assert_eq!(load_gyro_offsets(dir.path()), [12, -34, 5]);
    }

    #[test]
    fn missing_files_default_quietly() {
        let dir = tempdir().unwrap();
        assert_eq!(load_gyro_offsets(dir.path()), [0, 0, 0]);
        let (off, scale) = load_mag_cal(dir.path());
        assert_eq!(off, [0.0; 3]);
        assert_eq!(scale, [1.0; 3]);
        assert!(!is_mag_calibrated(dir.path()));
    }

    #[test]
    fn mag_file_round_trip() {
        let dir = tempdir().unwrap();
        write_mag_cal(dir.path(), &[1.5, -2.25, 3.0], &[0.9, 1.1, 1.0]).unwrap();
        let (off, scale) = load_mag_cal(dir.path());
        assert_eq!(off, [1.5, -2.25, 3.0]);
        assert_eq!(scale, [0.9, 1.1, 1.0]);
    }

    #[test]
    fn offset_register_encoding() {
        // bias format is -mean/4 split into high and low bytes
        let bytes = gyro_offset_bytes(&[100, -50, 25]);
        assert_eq!(&bytes[0..2], &(-25i16).to_be_bytes());
        assert_eq!(&bytes[2..4], &12i16.to_be_bytes());
        assert_eq!(&bytes[4..6], &(-6i16).to_be_bytes());
    }

    #[test]
    fn apply_writes_offset_registers() {
        let dir = tempdir().unwrap();
        write_gyro_offsets(dir.path(), &[100, 0, -100]).unwrap();
        let mut bus = MockBus::new();
        apply_gyro_offsets(&mut bus, dir.path()).unwrap();
        let writes = bus.writes_to(I2C_ADDRESS, regs::XG_OFFSET_H);
        assert_eq!(writes.len(), 1);
        let expected = gyro_offset_bytes(&[100, 0, -100]);
        assert_eq!(writes[0], expected.to_vec());
    }

    #[test]
    fn measure_gyro_bias_from_quiet_fifo() {
        let mut bus = MockBus::new();
        // 10 samples of a constant (100, -50, 25) bias
        bus.set_reg(I2C_ADDRESS, regs::FIFO_COUNTH, 0);
        bus.set_reg(I2C_ADDRESS, regs::FIFO_COUNTL, 60);
        for _ in 0..10 {
            let mut sample = Vec::new();
            sample.extend_from_slice(&100i16.to_be_bytes());
            sample.extend_from_slice(&(-50i16).to_be_bytes());
            sample.extend_from_slice(&25i16.to_be_bytes());
            bus.fifo_stream.push_back(sample);
        }
        let offsets = measure_gyro_bias(&mut bus, 3).unwrap();
        assert_eq!(offsets, [100, -50, 25]);
        // calibration reconfigured the chip for 200 Hz / 188 Hz / 250 dps
        assert_eq!(bus.reg(I2C_ADDRESS, regs::CONFIG), 0x01);
        assert_eq!(bus.reg(I2C_ADDRESS, regs::SMPLRT_DIV), 0x04);
        assert_eq!(bus.reg(I2C_ADDRESS, regs::GYRO_CONFIG), 0x00);
    }

    #[test]
    fn out_of_bounds_bias_is_rejected() {
        let mut bus = MockBus::new();
        bus.set_reg(I2C_ADDRESS, regs::FIFO_COUNTL, 12);
        for _ in 0..4 {
            let mut sample = Vec::new();
            sample.extend_from_slice(&2000i16.to_be_bytes());
            sample.extend_from_slice(&0i16.to_be_bytes());
            sample.extend_from_slice(&0i16.to_be_bytes());
            bus.fifo_stream.push_back(sample);
        }
        assert!(matches!(
            measure_gyro_bias(&mut bus, 2),
            Err(Error::CalibrationNoisy)
        ));
    }

    #[test]
    fn synthetic_sphere_produces_unit_scales() {
        // points on a 70 uT sphere centered at (10, -5, 3)
        let center = [10.0f32, -5.0, 3.0];
        let mut pts = Matrix::zeros(64, 3);
        for i in 0..64 {
            let theta = (i as f32 * 0.41) % std::f32::consts::PI;
            let phi = i as f32 * 0.73;
            let dir = [
                theta.sin() * phi.cos(),
                theta.sin() * phi.sin(),
                theta.cos(),
            ];
            for k in 0..3 {
                pts.set(i, k, center[k] + 70.0 * dir[k]);
            }
        }
        let (off, scale) = fit_mag_calibration(&pts).unwrap();
        for k in 0..3 {
            assert!((off[k] - center[k]).abs() < 0.5, "offset {}: {}", k, off[k]);
            assert!((scale[k] - 1.0).abs() < 0.02, "scale {}: {}", k, scale[k]);
        }
    }

    #[test]
    fn far_off_center_fails_and_writes_nothing() {
        let dir = tempdir().unwrap();
        let center = [300.0f32, 0.0, 0.0];
        let mut pts = Matrix::zeros(64, 3);
        for i in 0..64 {
            let theta = (i as f32 * 0.41) % std::f32::consts::PI;
            let phi = i as f32 * 0.73;
            let dir3 = [
                theta.sin() * phi.cos(),
                theta.sin() * phi.sin(),
                theta.cos(),
            ];
            for k in 0..3 {
                pts.set(i, k, center[k] + 50.0 * dir3[k]);
            }
        }
        let result = fit_mag_calibration(&pts);
        assert!(matches!(result, Err(Error::EllipsoidFitFailed)));
        assert!(!is_mag_calibrated(dir.path()));
    }
}
