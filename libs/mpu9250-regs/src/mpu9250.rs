//! MPU-9250 registers and flags

#![allow(non_camel_case_types)] // conformance to the data sheet

/// Default I2C address; pull AD0 high for 0x69.
pub const I2C_ADDRESS: u16 = 0x68;

/// `WHO_AM_I` values across the register-compatible family:
/// 0x68/0x69 MPU-6050/9150, 0x70 MPU-6500, 0x71 MPU-9250, 0x75 MPU-9255.
pub const VALID_WHO_AM_I: &[u8] = &[0x68, 0x69, 0x70, 0x71, 0x75];

/// Register addresses
pub mod regs {
    pub const XG_OFFSET_H: u8 = 0x13;
    pub const XG_OFFSET_L: u8 = 0x14;
    pub const YG_OFFSET_H: u8 = 0x15;
    pub const YG_OFFSET_L: u8 = 0x16;
    pub const ZG_OFFSET_H: u8 = 0x17;
    pub const ZG_OFFSET_L: u8 = 0x18;

    pub const SMPLRT_DIV: u8 = 0x19;
    pub const CONFIG: u8 = 0x1A;
    pub const GYRO_CONFIG: u8 = 0x1B;
    pub const ACCEL_CONFIG: u8 = 0x1C;
    pub const ACCEL_CONFIG_2: u8 = 0x1D;

    pub const FIFO_EN: u8 = 0x23;
    pub const I2C_MST_CTRL: u8 = 0x24;

    pub const INT_PIN_CFG: u8 = 0x37;
    pub const INT_ENABLE: u8 = 0x38;
    pub const INT_STATUS: u8 = 0x3A;

    pub const ACCEL_XOUT_H: u8 = 0x3B;
    pub const TEMP_OUT_H: u8 = 0x41;
    pub const GYRO_XOUT_H: u8 = 0x43;

    pub const USER_CTRL: u8 = 0x6A;
    pub const PWR_MGMT_1: u8 = 0x6B;
    pub const PWR_MGMT_2: u8 = 0x6C;

    /// DMP RAM access: bank select, start address within the bank, and the
    /// read/write window. Single transfers must not cross a bank.
    pub const BANK_SEL: u8 = 0x6D;
    pub const MEM_START_ADDR: u8 = 0x6E;
    pub const MEM_R_W: u8 = 0x6F;
    pub const PRGM_START_H: u8 = 0x70;
    pub const PRGM_START_L: u8 = 0x71;

    pub const FIFO_COUNTH: u8 = 0x72;
    pub const FIFO_COUNTL: u8 = 0x73;
    pub const FIFO_R_W: u8 = 0x74;

    pub const WHO_AM_I: u8 = 0x75;
}

/// Flag values and bit patterns
pub mod flags {
    use bitflags::bitflags;

    bitflags! {
        /// Power management 1
        pub struct PWR_MGMT_1: u8 {
            /// Reset internal registers to defaults; auto-clears.
            const H_RESET = 1 << 7;
            const SLEEP   = 1 << 6;
        }
    }

    bitflags! {
        /// User control
        pub struct USER_CTRL: u8 {
            const DMP_EN     = 1 << 7;
            const FIFO_EN    = 1 << 6;
            const I2C_MST_EN = 1 << 5;
            /// Reset the DMP; auto-clears.
            const DMP_RST    = 1 << 3;
            /// Reset the FIFO; auto-clears.
            const FIFO_RST   = 1 << 2;
        }
    }

    bitflags! {
        /// INT pin / bypass configuration
        pub struct INT_PIN_CFG: u8 {
            /// Interrupt line is active low.
            const ACTL            = 1 << 7;
            /// Hold the INT level until the status register is cleared.
            const LATCH_INT_EN    = 1 << 5;
            /// Any read clears the interrupt status.
            const INT_ANYRD_CLEAR = 1 << 4;
            /// Route the auxiliary I2C pins straight to the host bus.
            const BYPASS_EN       = 1 << 1;
        }
    }

    bitflags! {
        /// Interrupt enable
        pub struct INT_ENABLE: u8 {
            /// DMP data-ready interrupt.
            const DMP_INT_EN = 1 << 1;
            const RAW_RDY_EN = 1 << 0;
        }
    }

    bitflags! {
        /// FIFO enable (raw sensor capture, not the DMP path)
        pub struct FIFO_EN: u8 {
            const TEMP_OUT  = 1 << 7;
            const GYRO_X    = 1 << 6;
            const GYRO_Y    = 1 << 5;
            const GYRO_Z    = 1 << 4;
            const ACCEL     = 1 << 3;
        }
    }

    /// Gyro FSR field values for GYRO_CONFIG bits [4:3].
    pub const GYRO_FSR_CFG_250: u8 = 0 << 3;
    pub const GYRO_FSR_CFG_500: u8 = 1 << 3;
    pub const GYRO_FSR_CFG_1000: u8 = 2 << 3;
    pub const GYRO_FSR_CFG_2000: u8 = 3 << 3;
    /// GYRO_CONFIG FCHOICE_B field value that leaves the DLPF enabled.
    pub const FCHOICE_B_DLPF_EN: u8 = 0x00;

    /// Accel FSR field values for ACCEL_CONFIG bits [4:3].
    pub const ACCEL_FSR_CFG_2G: u8 = 0 << 3;
    pub const ACCEL_FSR_CFG_4G: u8 = 1 << 3;
    pub const ACCEL_FSR_CFG_8G: u8 = 2 << 3;
    pub const ACCEL_FSR_CFG_16G: u8 = 3 << 3;

    /// ACCEL_CONFIG_2 fchoice field: 0 keeps the 1 kHz DLPF path, setting
    /// the bit bypasses it for 4 kHz sampling.
    pub const ACCEL_FCHOICE_1KHZ: u8 = 0x00;
    pub const ACCEL_FCHOICE_4KHZ: u8 = 1 << 3;
    /// ACCEL_CONFIG_2 also carries the FIFO size selection. The 6500-class
    /// parts share 4 kB between DMP program memory and the FIFO; the first
    /// 3 kB belong to the DMP so the FIFO gets the last 1 kB.
    pub const BIT_FIFO_SIZE_1024: u8 = 0x40;

    /// CONFIG register FIFO_MODE value: overwrite the oldest data on
    /// overflow rather than blocking new writes.
    pub const FIFO_MODE_REPLACE_OLD: u8 = 0x00;
}

/// Temperature sensor LSB per degree C; offset is 21 C at zero.
pub const TEMP_SENSITIVITY: f32 = 333.87;
pub const TEMP_OFFSET_C: f32 = 21.0;
