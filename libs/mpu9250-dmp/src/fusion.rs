//! Magnetometer/DMP yaw fusion.
//!
//! The DMP's yaw drifts (it integrates gyro only); the magnetometer is
//! noisy but absolute. A complementary filter pair at one crossover keeps
//! the magnetometer's low-frequency accuracy and the DMP's high-frequency
//! response. Both yaw signals live on a circle, so spins are counted and
//! unwrapped before filtering; otherwise the filters would see 2 pi jumps
//! at every wraparound.

use std::f32::consts::PI;

use imu_math::{quaternion, Filter};

use crate::config::{Config, Orientation};
use crate::data::MpuData;

const TWO_PI: f32 = 2.0 * PI;

/// Rotate a calibrated magnetometer sample into the DMP's body frame for
/// the configured mount.
fn remap_mag(orientation: Orientation, m: &[f32; 3]) -> [f32; 3] {
    match orientation {
        Orientation::ZUp => [m[0], m[1], m[2]],
        Orientation::ZDown => [-m[0], m[1], -m[2]],
        Orientation::XUp => [m[2], m[1], m[0]],
        Orientation::XDown => [-m[2], m[1], -m[0]],
        Orientation::YUp => [m[0], -m[2], m[1]],
        Orientation::YDown => [m[0], m[2], -m[1]],
        Orientation::XForward => [m[1], -m[0], m[2]],
        Orientation::XBack => [-m[1], m[0], m[2]],
    }
}

/// State of the yaw complementary filter.
///
/// Built lazily on the first magnetometer-enabled tick so the filters can
/// be prefilled with the first samples; that way the fused yaw starts at
/// the compass heading with no rise transient.
pub struct FusionFilter {
    low_pass: Option<Filter>,
    high_pass: Option<Filter>,
    new_mag_yaw: f32,
    new_dmp_yaw: f32,
    mag_spin_counter: i32,
    dmp_spin_counter: i32,
}

impl FusionFilter {
    pub fn new() -> FusionFilter {
        FusionFilter {
            low_pass: None,
            high_pass: None,
            new_mag_yaw: 0.0,
            new_dmp_yaw: 0.0,
            mag_spin_counter: 0,
            dmp_spin_counter: 0,
        }
    }

    /// Fuse the current magnetometer sample with the DMP orientation,
    /// filling the fused fields of `data`. A degenerate magnetometer
    /// heading leaves the previous fused values in place.
    pub fn step(&mut self, config: &Config, data: &mut MpuData) {
        // tilt-only rotation from the DMP roll/pitch; yaw is what we are
        // solving for
        let tilt_tb = [data.dmp_tait_bryan[0], data.dmp_tait_bryan[1], 0.0];
        let tilt_q = quaternion::tb_to_quaternion(&tilt_tb);

        // align the field vector with the DMP frame, then level it so Z
        // points vertically and the horizontal components carry the heading
        let mut mag_vec = remap_mag(config.orientation, &data.mag);
        quaternion::rotate_vector(&mut mag_vec, &tilt_q);

        let last_mag_yaw = self.new_mag_yaw;
        let mag_yaw = -f32::atan2(mag_vec[1], mag_vec[0]);
        if mag_yaw.is_nan() {
            log::warn!("magnetometer heading degenerate, skipping fusion step");
            return;
        }
        self.new_mag_yaw = mag_yaw;
        data.compass_heading_raw = mag_yaw;

        let last_dmp_yaw = self.new_dmp_yaw;
        self.new_dmp_yaw = data.dmp_tait_bryan[2];

        // both yaws live in (-pi, pi]; count wraparounds so the filters see
        // continuous signals
        if self.new_mag_yaw - last_mag_yaw < -PI {
            self.mag_spin_counter += 1;
        } else if self.new_mag_yaw - last_mag_yaw > PI {
            self.mag_spin_counter -= 1;
        }
        if self.new_dmp_yaw - last_dmp_yaw < -PI {
            self.dmp_spin_counter += 1;
        } else if self.new_dmp_yaw - last_dmp_yaw > PI {
            self.dmp_spin_counter -= 1;
        }

        if self.low_pass.is_none() {
            let dt = 1.0 / config.dmp_sample_rate as f32;
            let tc = config.compass_time_constant;
            match (
                Filter::first_order_lowpass(dt, tc),
                Filter::first_order_highpass(dt, tc),
            ) {
                (Ok(mut low_pass), Ok(mut high_pass)) => {
                    low_pass.prefill_inputs(self.new_mag_yaw);
                    low_pass.prefill_outputs(self.new_mag_yaw);
                    high_pass.prefill_inputs(self.new_dmp_yaw);
                    high_pass.prefill_outputs(0.0);
                    self.low_pass = Some(low_pass);
                    self.high_pass = Some(high_pass);
                    self.mag_spin_counter = 0;
                    self.dmp_spin_counter = 0;
                }
                _ => {
                    log::error!("failed to build yaw complementary filters");
                    return;
                }
            }
        }

        let (low_pass, high_pass) = match (self.low_pass.as_mut(), self.high_pass.as_mut()) {
            (Some(low_pass), Some(high_pass)) => (low_pass, high_pass),
            _ => return,
        };
        let mut yaw = low_pass.march(self.new_mag_yaw + TWO_PI * self.mag_spin_counter as f32)
            + high_pass.march(self.new_dmp_yaw + TWO_PI * self.dmp_spin_counter as f32);

        // remove the spins and bound to (-pi, pi]
        yaw %= TWO_PI;
        if yaw > PI {
            yaw -= TWO_PI;
        } else if yaw < -PI {
            yaw += TWO_PI;
        }

        data.compass_heading = yaw;
        data.fused_tait_bryan = [
            data.dmp_tait_bryan[0],
            data.dmp_tait_bryan[1],
            yaw,
        ];
        data.fused_quat = quaternion::tb_to_quaternion(&data.fused_tait_bryan);
    }
}

impl Default for FusionFilter {
    fn default() -> Self {
        FusionFilter::new()
    }
}
