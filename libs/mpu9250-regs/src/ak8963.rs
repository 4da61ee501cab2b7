//! AK8963 magnetometer registers and flags
//!
//! The magnetometer is a separate die with its own I2C address, reachable
//! from the host only while the MPU's bypass mux is enabled (or through the
//! MPU's own I2C master).

/// The AK8963's fixed I2C address.
pub const I2C_ADDRESS: u16 = 0x0C;

/// Expected `WIA` (who-am-I) value.
pub const WHO_AM_I: u8 = 0x48;

/// Register addresses
pub mod regs {
    pub const WIA: u8 = 0x00;
    /// Status 1: data-ready in bit 0.
    pub const ST1: u8 = 0x02;
    /// Measurements, little endian, X low byte first.
    pub const HXL: u8 = 0x03;
    /// Status 2: magnetic overflow in bit 3; reading it ends the sample.
    pub const ST2: u8 = 0x09;
    pub const CNTL: u8 = 0x0A;
    pub const CNTL2: u8 = 0x0B;
    /// Factory sensitivity adjustment, three bytes from fuse ROM.
    pub const ASAX: u8 = 0x10;
}

/// Flag values
pub mod flags {
    /// ST1: new data is ready.
    pub const DATA_READY: u8 = 0x01;
    /// ST2: measurement overflowed; the sample is invalid.
    pub const OVERFLOW: u8 = 0x08;

    /// CNTL mode field values.
    pub const POWER_DOWN: u8 = 0x00;
    /// Continuous measurement mode 2, 100 Hz.
    pub const CONT_MES_2: u8 = 0x06;
    pub const FUSE_ROM_ACCESS: u8 = 0x0F;
    /// CNTL output-width bit: 16-bit resolution.
    pub const SCALE_16_BIT: u8 = 0x10;

    /// CNTL2: soft reset.
    pub const SRST: u8 = 0x01;
}

/// Scale from raw 16-bit counts to microtesla: 4912 uT full range over
/// 32760 counts.
pub const MAG_RAW_TO_UT: f32 = 4912.0 / 32760.0;
