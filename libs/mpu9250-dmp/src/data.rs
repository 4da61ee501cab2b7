//! The output record filled on every DMP tick.

/// Sensor data in raw counts and real units, plus the DMP and fused
/// orientation estimates.
///
/// Tait-Bryan triples are `[pitch_x, roll_y, yaw_z]` radians in the 321
/// convention; quaternions are `[w, x, y, z]`, unit norm.
#[derive(Debug, Clone, Default)]
pub struct MpuData {
    /// Accelerometer in m/s^2.
    pub accel: [f32; 3],
    /// Gyroscope in deg/s.
    pub gyro: [f32; 3],
    /// Magnetometer in uT, factory-adjusted and user-calibrated.
    pub mag: [f32; 3],
    /// Die temperature in deg C.
    pub temp: f32,

    /// Raw 16-bit ADC readings.
    pub raw_gyro: [i16; 3],
    pub raw_accel: [i16; 3],
    /// Conversion factor from raw accel counts to m/s^2 for the configured
    /// full scale range.
    pub accel_to_ms2: f32,
    /// Conversion factor from raw gyro counts to deg/s.
    pub gyro_to_degs: f32,

    /// Orientation straight from the DMP (accel + gyro only).
    pub dmp_quat: [f32; 4],
    pub dmp_tait_bryan: [f32; 3],

    /// A tap was detected on the last sample period.
    pub tap_detected: bool,
    /// Direction of the last tap, 1-6 for +X -X +Y -Y +Z -Z.
    pub last_tap_direction: u8,

    /// Orientation with magnetometer-corrected yaw. Only populated when the
    /// magnetometer is enabled.
    pub fused_quat: [f32; 4],
    pub fused_tait_bryan: [f32; 3],
    /// Filtered compass heading; identical to the fused yaw.
    pub compass_heading: f32,
    /// Unfiltered heading straight from the tilt-compensated magnetometer.
    pub compass_heading_raw: f32,
}
