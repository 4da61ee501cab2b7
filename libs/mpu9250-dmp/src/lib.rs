//! DMP-accelerated driver for the InvenSense MPU-9250 family on Linux.
//!
//! Supports the MPU-9250/9255 and the register-compatible MPU-6050/6500/
//! 9150 over I2C, with the data-ready interrupt wired to a GPIO line.
//!
//! Two modes:
//!
//! - **Random read** ([`Mpu::initialize`]): the sensors self-sample and
//!   [`Mpu::read_accel`], [`Mpu::read_gyro`], [`Mpu::read_mag`], and
//!   [`Mpu::read_temp`] fetch the latest values at any time.
//! - **DMP** ([`Mpu::initialize_dmp`]): the on-chip Digital Motion
//!   Processor samples internally, fuses a quaternion, and streams packets
//!   through the FIFO. A dedicated real-time thread drains the FIFO on
//!   every interrupt, optionally fuses magnetometer yaw, and hands the
//!   result to a registered callback or to [`Mpu::block_until_new_data`].
//!
//! Callbacks run on the interrupt thread while the driver's internal
//! mutexes are held: keep them short and never call back into the driver
//! from inside one.
//!
//! An instance moves through configured -> running -> powered off;
//! [`Mpu::power_off`] resets and sleeps the chip and joins the interrupt
//! thread (bounded at one second). Calibration lives in [`cal`] as
//! standalone routines that persist to text files loaded at startup.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mpu9250_regs::dmp as dmp_regs;
use mpu9250_regs::mpu9250::{flags, regs};

pub mod bus;
pub mod cal;
pub mod chip;
pub mod config;
pub mod data;
pub mod dmp;
pub mod error;
pub mod fifo;
pub mod fusion;
pub mod gpio;
mod interrupt;

pub use bus::{Bus, I2cBus};
pub use config::{AccelDlpf, AccelFsr, Config, GyroDlpf, GyroFsr, Orientation};
pub use data::MpuData;
pub use error::{Error, Result};

use chip::MagCal;
use gpio::InterruptPin;

/// Output record plus a sequence number advanced on every announced tick,
/// so blocking waiters are immune to spurious condvar wakeups.
pub(crate) struct DataCell {
    pub data: MpuData,
    pub seq: u64,
}

pub(crate) struct TapCell {
    pub seq: u64,
    pub direction: u8,
}

#[derive(Default)]
pub(crate) struct Callbacks {
    pub on_data: Option<Box<dyn FnMut() + Send>>,
    pub on_tap: Option<Box<dyn FnMut(u8) + Send>>,
}

/// State shared between the user context and the interrupt thread.
pub(crate) struct Shared<B: Bus> {
    pub config: Config,
    pub packet_len: usize,
    pub mag_cal: MagCal,
    pub bus: Mutex<B>,
    pub data_cell: Mutex<DataCell>,
    pub data_cond: Condvar,
    pub tap_cell: Mutex<TapCell>,
    pub tap_cond: Condvar,
    pub callbacks: Mutex<Callbacks>,
    pub shutdown: AtomicBool,
    pub thread_running: AtomicBool,
    pub last_interrupt_ns: AtomicU64,
    pub last_tap_ns: AtomicU64,
    pub last_read_ok: AtomicBool,
}

impl<B: Bus> Shared<B> {
    pub(crate) fn bus(&self) -> MutexGuard<'_, B> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn data(&self) -> MutexGuard<'_, DataCell> {
        self.data_cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn tap(&self) -> MutexGuard<'_, TapCell> {
        self.tap_cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn callbacks(&self) -> MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An MPU-9250 instance.
///
/// Generic over the bus so the configuration paths can run against a mock;
/// real use goes through [`Mpu::initialize`] or [`Mpu::initialize_dmp`].
pub struct Mpu<B: Bus = I2cBus> {
    shared: Arc<Shared<B>>,
    thread: Option<JoinHandle<()>>,
}

/// Range-check and normalize a DMP configuration in place.
///
/// The DMP only scales correctly at 2000 dps and 2 g, and its 200 Hz
/// internal rate caps the usable DLPF bandwidth at 184 Hz, so offending
/// settings are downgraded with a warning rather than rejected.
fn validate_dmp_config(config: &mut Config) -> Result<()> {
    if config.dmp_sample_rate > dmp_regs::MAX_RATE || config.dmp_sample_rate < dmp_regs::MIN_RATE {
        return Err(Error::Config("dmp_sample_rate must be between 4 and 200"));
    }
    if dmp_regs::MAX_RATE % config.dmp_sample_rate != 0 {
        return Err(Error::Config(
            "dmp_sample_rate must divide 200 evenly: 200,100,50,40,25,20,10,8,5,4",
        ));
    }
    if config.enable_magnetometer && config.compass_time_constant <= 0.1 {
        return Err(Error::Config("compass_time_constant must exceed 0.1 s"));
    }
    if config.mag_sample_rate_div < 1 {
        return Err(Error::Config("mag_sample_rate_div must be at least 1"));
    }
    let max_pri = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
    let min_pri = unsafe { libc::sched_get_priority_min(libc::SCHED_FIFO) };
    if config.dmp_interrupt_priority > max_pri || config.dmp_interrupt_priority < min_pri {
        return Err(Error::Config("dmp_interrupt_priority outside SCHED_FIFO range"));
    }
    if matches!(config.gyro_dlpf, GyroDlpf::Off | GyroDlpf::Hz250) {
        log::warn!("gyro dlpf bandwidth must be <= 184 Hz in DMP mode, using 184 Hz");
        config.gyro_dlpf = GyroDlpf::Hz184;
    }
    if matches!(config.accel_dlpf, AccelDlpf::Off | AccelDlpf::Hz460) {
        log::warn!("accel dlpf bandwidth must be <= 184 Hz in DMP mode, using 184 Hz");
        config.accel_dlpf = AccelDlpf::Hz184;
    }
    if config.gyro_fsr != GyroFsr::Dps2000 {
        log::warn!("gyro FSR must be 2000 dps in DMP mode, overriding");
        config.gyro_fsr = GyroFsr::Dps2000;
    }
    if config.accel_fsr != AccelFsr::G2 {
        log::warn!("accel FSR must be 2 g in DMP mode, overriding");
        config.accel_fsr = AccelFsr::G2;
    }
    Ok(())
}

/// Run the full DMP bring-up against an already-open bus.
///
/// Returns the FIFO packet length and the magnetometer calibration in use.
fn configure_dmp<B: Bus>(
    bus: &mut B,
    config: &Config,
    data: &mut MpuData,
) -> Result<(usize, MagCal)> {
    chip::reset_mpu(bus, config.i2c_addr)?;
    chip::check_who_am_i(bus)?;

    // FIFO size must be set before the DMP image goes in; the first 3 kB
    // of shared memory belong to the program
    bus.write_byte(
        regs::ACCEL_CONFIG_2,
        flags::BIT_FIFO_SIZE_1024 | flags::ACCEL_FCHOICE_4KHZ,
    )?;

    cal::apply_gyro_offsets(bus, &config.cal_dir)?;

    chip::set_gyro_fsr(bus, config.gyro_fsr, data)?;
    chip::set_accel_fsr(bus, config.accel_fsr, data)?;
    chip::set_gyro_dlpf(bus, config.gyro_dlpf)?;
    chip::set_accel_dlpf(bus, config.accel_dlpf)?;

    // the accel/gyro always sample at 200 Hz in DMP mode; the FIFO rate
    // divisor below is the user-visible knob
    chip::set_sample_rate(bus, dmp_regs::SAMPLE_RATE)?;
    chip::set_bypass(bus, config.i2c_addr, true, true)?;

    let mut mag_cal = MagCal::default();
    if config.enable_magnetometer {
        mag_cal.factory_adjust = chip::init_magnetometer(bus, config.i2c_addr, true)?;
        let (offsets, scales) = cal::load_mag_cal(&config.cal_dir);
        mag_cal.offsets = offsets;
        mag_cal.scales = scales;
    } else {
        chip::power_off_magnetometer(bus, config.i2c_addr, true)?;
    }

    dmp::load_firmware(bus)?;
    dmp::set_orientation(bus, config.orientation.scalar())?;

    // the tap feature stays on even when unused: without it the DMP
    // cannot produce interrupts slower than 200 Hz
    let mut mask = dmp_regs::FEATURE_6X_LP_QUAT | dmp_regs::FEATURE_TAP;
    if config.dmp_auto_calibrate_gyro {
        mask |= dmp_regs::FEATURE_GYRO_CAL;
    }
    if config.dmp_fetch_accel_gyro {
        mask |= dmp_regs::FEATURE_SEND_RAW_ACCEL | dmp_regs::FEATURE_SEND_ANY_GYRO;
    }
    let packet_len = dmp::enable_features(bus, mask, config)?;

    dmp::set_fifo_rate(bus, config.dmp_sample_rate)?;
    dmp::set_dmp_state(bus, config.i2c_addr, true)?;
    dmp::set_interrupt_mode(bus, dmp::InterruptMode::Continuous)?;

    Ok((packet_len, mag_cal))
}

impl Mpu<I2cBus> {
    /// Bring the IMU up for random-read sampling.
    pub fn initialize(config: Config) -> Result<Mpu<I2cBus>> {
        let mut bus = I2cBus::new(config.i2c_bus, config.i2c_addr)?;
        if bus.is_locked() {
            log::warn!("i2c bus claimed by another process, continuing with initialization anyway");
        }
        bus.lock();
        let mut data = MpuData::default();
        let mut mag_cal = MagCal::default();
        let setup = (|| -> Result<()> {
            chip::reset_mpu(&mut bus, config.i2c_addr)?;
            chip::check_who_am_i(&mut bus)?;
            cal::apply_gyro_offsets(&mut bus, &config.cal_dir)?;
            // 1 kHz internal sampling
            bus.write_byte(regs::SMPLRT_DIV, 0x00)?;
            chip::set_gyro_fsr(&mut bus, config.gyro_fsr, &mut data)?;
            chip::set_accel_fsr(&mut bus, config.accel_fsr, &mut data)?;
            chip::set_gyro_dlpf(&mut bus, config.gyro_dlpf)?;
            chip::set_accel_dlpf(&mut bus, config.accel_dlpf)?;
            if config.enable_magnetometer {
                mag_cal.factory_adjust = chip::init_magnetometer(&mut bus, config.i2c_addr, false)?;
                let (offsets, scales) = cal::load_mag_cal(&config.cal_dir);
                mag_cal.offsets = offsets;
                mag_cal.scales = scales;
            } else {
                chip::power_off_magnetometer(&mut bus, config.i2c_addr, false)?;
            }
            Ok(())
        })();
        bus.unlock();
        setup?;
        Ok(Mpu::from_parts(config, bus, data, mag_cal, 0))
    }

    /// Bring the IMU up in DMP mode and start the interrupt thread.
    pub fn initialize_dmp(mut config: Config) -> Result<Mpu<I2cBus>> {
        validate_dmp_config(&mut config)?;

        let mut bus = I2cBus::new(config.i2c_bus, config.i2c_addr)?;
        let pin = InterruptPin::new(config.gpio_interrupt_pin)?;

        bus.lock();
        let mut data = MpuData::default();
        let configured = configure_dmp(&mut bus, &config, &mut data);
        bus.unlock();
        let (packet_len, mag_cal) = configured?;

        let mut imu = Mpu::from_parts(config, bus, data, mag_cal, packet_len);
        imu.spawn_interrupt_thread(pin)?;
        Ok(imu)
    }
}

impl<B: Bus + 'static> Mpu<B> {
    fn from_parts(
        config: Config,
        bus: B,
        data: MpuData,
        mag_cal: MagCal,
        packet_len: usize,
    ) -> Mpu<B> {
        Mpu {
            shared: Arc::new(Shared {
                config,
                packet_len,
                mag_cal,
                bus: Mutex::new(bus),
                data_cell: Mutex::new(DataCell { data, seq: 0 }),
                data_cond: Condvar::new(),
                tap_cell: Mutex::new(TapCell { seq: 0, direction: 0 }),
                tap_cond: Condvar::new(),
                callbacks: Mutex::new(Callbacks::default()),
                shutdown: AtomicBool::new(false),
                thread_running: AtomicBool::new(false),
                last_interrupt_ns: AtomicU64::new(0),
                last_tap_ns: AtomicU64::new(0),
                last_read_ok: AtomicBool::new(false),
            }),
            thread: None,
        }
    }

    fn spawn_interrupt_thread(&mut self, pin: InterruptPin) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        shared.thread_running.store(true, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("mpu-interrupt".into())
            .spawn(move || interrupt::run(shared, pin));
        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                // give the thread a moment so startup is predictable
                thread::sleep(Duration::from_millis(1));
                Ok(())
            }
            Err(e) => {
                self.shared.thread_running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// The configuration in effect (after DMP-mode normalization).
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Snapshot of the output record.
    pub fn data(&self) -> MpuData {
        self.shared.data().data.clone()
    }

    /// Register the data-ready callback, replacing any previous one.
    pub fn set_dmp_callback<F: FnMut() + Send + 'static>(&self, func: F) {
        self.shared.callbacks().on_data = Some(Box::new(func));
    }

    /// Register the tap callback, replacing any previous one. Receives the
    /// tap direction code 1-6 for +X -X +Y -Y +Z -Z.
    pub fn set_tap_callback<F: FnMut(u8) + Send + 'static>(&self, func: F) {
        self.shared.callbacks().on_tap = Some(Box::new(func));
    }

    /// Block until the interrupt thread publishes a fresh output record
    /// and return a snapshot of it.
    ///
    /// Fails with [`Error::Uninitialized`] when the DMP handler is not
    /// running, including when the wait is cut short by shutdown.
    pub fn block_until_new_data(&self) -> Result<MpuData> {
        self.check_handler_running()?;
        let mut cell = self.shared.data();
        let start = cell.seq;
        loop {
            cell = self
                .shared
                .data_cond
                .wait(cell)
                .unwrap_or_else(PoisonError::into_inner);
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return Err(Error::Uninitialized);
            }
            if cell.seq != start {
                return Ok(cell.data.clone());
            }
        }
    }

    /// Block until a tap is detected; returns the direction code 1-6.
    pub fn block_until_tap(&self) -> Result<u8> {
        self.check_handler_running()?;
        let mut cell = self.shared.tap();
        let start = cell.seq;
        loop {
            cell = self
                .shared
                .tap_cond
                .wait(cell)
                .unwrap_or_else(PoisonError::into_inner);
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return Err(Error::Uninitialized);
            }
            if cell.seq != start {
                return Ok(cell.direction);
            }
        }
    }

    fn check_handler_running(&self) -> Result<()> {
        if self.shared.shutdown.load(Ordering::SeqCst)
            || !self.shared.thread_running.load(Ordering::SeqCst)
        {
            return Err(Error::Uninitialized);
        }
        Ok(())
    }

    /// Whether the last interrupt tick produced valid DMP data.
    pub fn was_last_read_successful(&self) -> bool {
        self.shared.last_read_ok.load(Ordering::SeqCst)
    }

    /// Nanoseconds since the last DMP interrupt, or `None` before the
    /// first one.
    pub fn nanos_since_last_dmp_interrupt(&self) -> Option<u64> {
        match self.shared.last_interrupt_ns.load(Ordering::SeqCst) {
            0 => None,
            t => Some(interrupt::nanos_now().saturating_sub(t)),
        }
    }

    /// Nanoseconds since the last detected tap, or `None` if none yet.
    pub fn nanos_since_last_tap(&self) -> Option<u64> {
        match self.shared.last_tap_ns.load(Ordering::SeqCst) {
            0 => None,
            t => Some(interrupt::nanos_now().saturating_sub(t)),
        }
    }

    /// Latest accelerometer sample in m/s^2 (random-read mode).
    pub fn read_accel(&self) -> Result<[f32; 3]> {
        let mut bus = self.shared.bus();
        let mut cell = self.shared.data();
        chip::read_accel(&mut *bus, self.shared.config.i2c_addr, &mut cell.data)?;
        Ok(cell.data.accel)
    }

    /// Latest gyroscope sample in deg/s (random-read mode).
    pub fn read_gyro(&self) -> Result<[f32; 3]> {
        let mut bus = self.shared.bus();
        let mut cell = self.shared.data();
        chip::read_gyro(&mut *bus, self.shared.config.i2c_addr, &mut cell.data)?;
        Ok(cell.data.gyro)
    }

    /// Latest magnetometer sample in uT. The AK8963 updates at 100 Hz; a
    /// faster call returns [`Error::MagNotReady`] and leaves the record
    /// untouched.
    pub fn read_mag(&self) -> Result<[f32; 3]> {
        if !self.shared.config.enable_magnetometer {
            return Err(Error::Config(
                "magnetometer must be enabled in the config before initialization",
            ));
        }
        let mut bus = self.shared.bus();
        let mut cell = self.shared.data();
        let result = chip::read_mag(&mut *bus, &self.shared.mag_cal, &mut cell.data);
        bus.set_device_address(self.shared.config.i2c_addr)?;
        result.map(|()| cell.data.mag)
    }

    /// Die temperature in deg C.
    pub fn read_temp(&self) -> Result<f32> {
        let mut bus = self.shared.bus();
        let mut cell = self.shared.data();
        chip::read_temp(&mut *bus, self.shared.config.i2c_addr, &mut cell.data)?;
        Ok(cell.data.temp)
    }

    /// Stop the interrupt thread and put the chip to sleep.
    ///
    /// The thread join is bounded at one second; a stuck thread is logged
    /// and abandoned rather than hanging the caller.
    pub fn power_off(&mut self) -> Result<()> {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        // unblock any waiters
        {
            let _cell = self.shared.data();
            self.shared.data_cond.notify_all();
        }
        {
            let _tap = self.shared.tap();
            self.shared.tap_cond.notify_all();
        }

        {
            let mut bus = self.shared.bus();
            bus.set_device_address(self.shared.config.i2c_addr)?;
            chip::write_byte_retry(&mut *bus, regs::PWR_MGMT_1, flags::PWR_MGMT_1::H_RESET.bits())?;
            chip::write_byte_retry(&mut *bus, regs::PWR_MGMT_1, flags::PWR_MGMT_1::SLEEP.bits())?;
        }

        if let Some(handle) = self.thread.take() {
            let deadline = Instant::now() + Duration::from_secs(1);
            while self.shared.thread_running.load(Ordering::SeqCst) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if self.shared.thread_running.load(Ordering::SeqCst) {
                log::warn!("imu interrupt thread exit timeout");
            } else {
                let _ = handle.join();
            }
        }
        Ok(())
    }
}

impl<B: Bus> Drop for Mpu<B> {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shared.shutdown.store(true, Ordering::SeqCst);
            if let Some(handle) = self.thread.take() {
                let deadline = Instant::now() + Duration::from_secs(1);
                while self.shared.thread_running.load(Ordering::SeqCst)
                    && Instant::now() < deadline
                {
                    thread::sleep(Duration::from_millis(10));
                }
                if !self.shared.thread_running.load(Ordering::SeqCst) {
                    let _ = handle.join();
                }
            }
        }
    }
}
