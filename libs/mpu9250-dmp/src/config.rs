//! Driver configuration.

use std::path::PathBuf;

use mpu9250_regs::mpu9250;

/// Accelerometer full scale range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelFsr {
    G2,
    G4,
    G8,
    G16,
}

impl AccelFsr {
    /// Full scale in g.
    pub fn range_g(self) -> f32 {
        match self {
            AccelFsr::G2 => 2.0,
            AccelFsr::G4 => 4.0,
            AccelFsr::G8 => 8.0,
            AccelFsr::G16 => 16.0,
        }
    }

    /// Counts per g at this range.
    pub fn lsb_per_g(self) -> u16 {
        match self {
            AccelFsr::G2 => 16384,
            AccelFsr::G4 => 8192,
            AccelFsr::G8 => 4096,
            AccelFsr::G16 => 2048,
        }
    }
}

/// Gyroscope full scale range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GyroFsr {
    Dps250,
    Dps500,
    Dps1000,
    Dps2000,
}

impl GyroFsr {
    pub fn range_dps(self) -> f32 {
        match self {
            GyroFsr::Dps250 => 250.0,
            GyroFsr::Dps500 => 500.0,
            GyroFsr::Dps1000 => 1000.0,
            GyroFsr::Dps2000 => 2000.0,
        }
    }
}

/// Accelerometer on-chip low-pass bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelDlpf {
    Off,
    Hz460,
    Hz184,
    Hz92,
    Hz41,
    Hz20,
    Hz10,
    Hz5,
}

/// Gyroscope on-chip low-pass bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GyroDlpf {
    Off,
    Hz250,
    Hz184,
    Hz92,
    Hz41,
    Hz20,
    Hz10,
    Hz5,
}

/// Mounting orientation of the sensor relative to the body frame.
///
/// Each variant names the face or axis of the chip that points up (or
/// forward), and encodes the matching sign-permutation matrix as the 9-bit
/// scalar the DMP expects: three 3-bit row codes, axis index plus a sign
/// bit per row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Orientation {
    ZUp = 136,
    ZDown = 396,
    XUp = 14,
    XDown = 266,
    YUp = 112,
    YDown = 336,
    XForward = 133,
    XBack = 161,
}

impl Orientation {
    /// The DMP orientation scalar for this mount.
    pub fn scalar(self) -> u16 {
        self as u16
    }
}

/// Immutable driver configuration. Build one with [`Config::default`] and
/// adjust fields before handing it to an initializer.
#[derive(Debug, Clone)]
pub struct Config {
    /// GPIO line wired to the MPU's interrupt pin.
    pub gpio_interrupt_pin: u32,
    /// I2C bus number (`/dev/i2c-N`).
    pub i2c_bus: u32,
    /// MPU slave address; 0x68, or 0x69 with AD0 pulled high.
    pub i2c_addr: u16,
    /// Emit warnings for recoverable conditions (empty FIFO, missed
    /// packets, skipped magnetometer samples).
    pub show_warnings: bool,

    pub accel_fsr: AccelFsr,
    pub gyro_fsr: GyroFsr,
    pub accel_dlpf: AccelDlpf,
    pub gyro_dlpf: GyroDlpf,
    /// Bring up the AK8963 and enable yaw fusion.
    pub enable_magnetometer: bool,

    /// DMP output rate in Hz; must divide 200 evenly.
    pub dmp_sample_rate: u16,
    /// Include raw accel/gyro in every FIFO packet.
    pub dmp_fetch_accel_gyro: bool,
    /// Let the DMP's internal bias tracker trim the gyro while running.
    pub dmp_auto_calibrate_gyro: bool,
    pub orientation: Orientation,
    /// Crossover time constant in seconds for the yaw complementary
    /// filter; must exceed 0.1.
    pub compass_time_constant: f32,
    /// `SCHED_FIFO` priority for the interrupt thread.
    pub dmp_interrupt_priority: i32,
    /// Read the magnetometer after the user callback returns (lower
    /// callback latency; the mag update lands on the next tick) instead of
    /// before it (fresher mag data in the callback).
    pub read_mag_after_callback: bool,
    /// Read the magnetometer every Nth DMP interrupt.
    pub mag_sample_rate_div: u32,
    /// Tap detection impulse threshold in mg/ms.
    pub tap_threshold: u16,

    /// Directory holding `gyro.cal` and `mag.cal`.
    pub cal_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Config {
        let max_pri = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
        Config {
            gpio_interrupt_pin: 117,
            i2c_bus: 2,
            i2c_addr: mpu9250::I2C_ADDRESS,
            show_warnings: false,
            accel_fsr: AccelFsr::G2,
            gyro_fsr: GyroFsr::Dps2000,
            accel_dlpf: AccelDlpf::Hz184,
            gyro_dlpf: GyroDlpf::Hz184,
            enable_magnetometer: false,
            dmp_sample_rate: 100,
            dmp_fetch_accel_gyro: false,
            dmp_auto_calibrate_gyro: false,
            orientation: Orientation::ZUp,
            compass_time_constant: 20.0,
            dmp_interrupt_priority: max_pri - 1,
            read_mag_after_callback: true,
            mag_sample_rate_div: 4,
            tap_threshold: 150,
            cal_dir: PathBuf::from("/var/lib/imu-cal"),
        }
    }
}
