//! DMP firmware geometry and RAM memory map
//!
//! The Digital Motion Processor executes a firmware image out of on-chip
//! RAM that the host loads over I2C through the bank-paged window. The
//! addresses below index into that RAM and come from the InvenSense motion
//! driver's memory map; they are only meaningful to the stock firmware
//! image.

/// Size of the compiled firmware image in bytes.
pub const CODE_SIZE: usize = 3062;
/// Program entry point written to `PRGM_START_H/L` after upload.
pub const START_ADDR: u16 = 0x0400;
/// Firmware is uploaded and verified in chunks of this size; it divides the
/// bank size evenly so chunks never straddle a bank.
pub const LOAD_CHUNK: usize = 16;
/// DMP RAM bank size; a single bank-paged transfer must stay inside one.
pub const BANK_SIZE: usize = 256;

/// Rate the DMP runs its internal filter at, in Hz. Output rates are this
/// divided by the FIFO rate divisor.
pub const SAMPLE_RATE: u16 = 200;
pub const MAX_RATE: u16 = 200;
pub const MIN_RATE: u16 = 4;

/// Gyro integration scale factor for the stock firmware at 200 Hz.
pub const GYRO_SF: i64 = 46_850_825;

/// Feature mask bits understood by [`CFG` stanza writes](self).
pub const FEATURE_TAP: u16 = 0x001;
pub const FEATURE_ANDROID_ORIENT: u16 = 0x002;
pub const FEATURE_LP_QUAT: u16 = 0x004;
pub const FEATURE_PEDOMETER: u16 = 0x008;
pub const FEATURE_6X_LP_QUAT: u16 = 0x010;
pub const FEATURE_GYRO_CAL: u16 = 0x020;
pub const FEATURE_SEND_RAW_ACCEL: u16 = 0x040;
pub const FEATURE_SEND_RAW_GYRO: u16 = 0x080;
pub const FEATURE_SEND_CAL_GYRO: u16 = 0x100;
pub const FEATURE_SEND_ANY_GYRO: u16 = FEATURE_SEND_RAW_GYRO | FEATURE_SEND_CAL_GYRO;

/// RAM addresses (bank << 8 | offset) used by the driver.
pub mod addrs {
    /// FIFO rate divisor.
    pub const D_0_22: u16 = 512 + 22;
    /// Gyro integration scale factor.
    pub const D_0_104: u16 = 104;

    /// Secondary (0.75x) tap thresholds per axis.
    pub const D_1_36: u16 = 256 + 36;
    pub const D_1_40: u16 = 256 + 40;
    pub const D_1_44: u16 = 256 + 44;
    /// Tap axis enable.
    pub const D_1_72: u16 = 256 + 72;
    /// Minimum consecutive taps.
    pub const D_1_79: u16 = 256 + 79;
    /// Shake rejection timeout.
    pub const D_1_88: u16 = 256 + 88;
    /// Shake rejection time.
    pub const D_1_90: u16 = 256 + 90;
    /// Shake rejection threshold.
    pub const D_1_92: u16 = 256 + 92;
    /// Multi-tap window.
    pub const D_1_218: u16 = 256 + 218;

    /// Primary tap thresholds per axis.
    pub const TAP_THX: u16 = 468;
    pub const TAP_THY: u16 = 472;
    pub const TAP_THZ: u16 = 476;
    /// Tap window minimum.
    pub const TAPW_MIN: u16 = 478;

    /// Orientation: gyro and accel axis rows, then sign rows.
    pub const FCFG_1: u16 = 1062;
    pub const FCFG_2: u16 = 1066;
    pub const FCFG_7: u16 = 1073;
    pub const FCFG_3: u16 = 1088;

    /// Gyro auto-calibration stanza.
    pub const CFG_MOTION_BIAS: u16 = 1208;
    /// Android-orientation gesture interrupt.
    pub const CFG_ANDROID_ORIENT_INT: u16 = 1853;
    /// Tap gesture enable.
    pub const CFG_20: u16 = 2224;
    /// Interrupt-on-event vs continuous stanza.
    pub const CFG_FIFO_ON_EVENT: u16 = 2690;
    /// Gyro-only quaternion stanza.
    pub const CFG_LP_QUAT: u16 = 2712;
    /// Six-axis quaternion stanza.
    pub const CFG_8: u16 = 2718;
    /// Raw vs calibrated gyro output selection.
    pub const CFG_GYRO_RAW_DATA: u16 = 2722;
    /// Sensor-output-to-FIFO stanza.
    pub const CFG_15: u16 = 2727;
    /// Gesture-data-to-FIFO stanza.
    pub const CFG_27: u16 = 2742;
    /// FIFO rate divisor end-of-program stanza.
    pub const CFG_6: u16 = 2753;
}
