//! Driver error types.

/// Errors surfaced by the driver.
///
/// Transient bus hiccups are retried once close to where they happen; what
/// escapes here is either fatal to the current operation or, for
/// [`Error::FifoDesync`], recovered by a FIFO reset with the current tick
/// dropped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i2c transport failure: {0}")]
    Transport(#[from] i2cdev::linux::LinuxI2CError),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("unrecognized WHO_AM_I value {found:#04x}")]
    DeviceIdMismatch { found: u8 },

    #[error("DMP memory read-back mismatch at {addr:#06x}")]
    FirmwareCorrupted { addr: u16 },

    #[error("memory transfer of {len} bytes at {addr:#06x} would cross a bank boundary")]
    BankCrossing { addr: u16, len: usize },

    #[error("FIFO desynchronized ({0})")]
    FifoDesync(&'static str),

    #[error("magnetometer saturated, sample discarded")]
    MagSaturated,

    #[error("magnetometer has no new data ready")]
    MagNotReady,

    #[error("calibration data too noisy")]
    CalibrationNoisy,

    #[error("ellipsoid fit failed sanity checks")]
    EllipsoidFitFailed,

    #[error("DMP handler is not running")]
    Uninitialized,

    #[error("invalid configuration: {0}")]
    Config(&'static str),

    #[error(transparent)]
    Math(#[from] imu_math::MathError),
}

pub type Result<T> = std::result::Result<T, Error>;
