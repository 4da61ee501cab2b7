//! Discrete SISO filters described by rational transfer functions.
//!
//! A filter is `H(z) = gain * num(z)/den(z)` with coefficients stored
//! highest power first and `len(den) >= len(num)` (proper or semi-proper).
//! State lives in two ring buffers so marching is allocation-free.

use crate::polynomial;
use crate::ring_buffer::RingBuffer;
use crate::MathError;

/// A discrete-time SISO filter with saturation and soft-start support.
#[derive(Debug, Clone)]
pub struct Filter {
    order: usize,
    dt: f32,
    gain: f32,
    num: Vec<f32>,
    den: Vec<f32>,
    sat_en: bool,
    sat_min: f32,
    sat_max: f32,
    sat_flag: bool,
    ss_en: bool,
    ss_steps: f32,
    in_buf: RingBuffer,
    out_buf: RingBuffer,
    newest_input: f32,
    newest_output: f32,
    step: u64,
}

impl Filter {
    /// Build a filter from transfer-function coefficients, highest power
    /// first. `dt` is the timestep the caller promises to march at.
    pub fn new(num: &[f32], den: &[f32], dt: f32) -> Result<Filter, MathError> {
        if dt <= 0.0 {
            return Err(MathError::InvalidArgument("filter dt must be positive"));
        }
        if num.is_empty() || den.is_empty() {
            return Err(MathError::InvalidArgument("empty coefficient array"));
        }
        if num.len() > den.len() {
            return Err(MathError::InvalidArgument(
                "improper transfer function, num longer than den",
            ));
        }
        if den[0] == 0.0 {
            return Err(MathError::InvalidArgument("den leading coefficient is zero"));
        }
        let order = den.len() - 1;
        Ok(Filter {
            order,
            dt,
            gain: 1.0,
            num: num.to_vec(),
            den: den.to_vec(),
            sat_en: false,
            sat_min: 0.0,
            sat_max: 0.0,
            sat_flag: false,
            ss_en: false,
            ss_steps: 0.0,
            in_buf: RingBuffer::new(order + 1),
            out_buf: RingBuffer::new(order + 1),
            newest_input: 0.0,
            newest_output: 0.0,
            step: 0,
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    /// March one step with a new input, returning the new output.
    pub fn march(&mut self, input: f32) -> f32 {
        self.in_buf.insert(input);
        self.newest_input = input;
        // difference equation; relative degree shifts the input taps when the
        // numerator is shorter than the denominator
        let rel_deg = self.order - (self.num.len() - 1);
        let mut out = 0.0f32;
        for (i, n) in self.num.iter().enumerate() {
            out += self.gain * n * self.in_buf.get(i + rel_deg);
        }
        for i in 1..=self.order {
            out -= self.den[i] * self.out_buf.get(i - 1);
        }
        out /= self.den[0];
        // soft start bounds the output with a ramp that opens linearly from
        // zero; the saturation flag stays clear while it is engaged
        if self.ss_en && (self.step as f32) < self.ss_steps {
            let frac = self.step as f32 / self.ss_steps;
            let hi = self.sat_max * frac;
            let lo = self.sat_min * frac;
            if out > hi {
                out = hi;
            } else if out < lo {
                out = lo;
            }
        } else if self.sat_en {
            if out > self.sat_max {
                out = self.sat_max;
                self.sat_flag = true;
            } else if out < self.sat_min {
                out = self.sat_min;
                self.sat_flag = true;
            } else {
                self.sat_flag = false;
            }
        }
        self.newest_output = out;
        self.out_buf.insert(out);
        self.step += 1;
        out
    }

    /// Zero all state and restart the step counter. Soft start, if enabled,
    /// engages again after a reset.
    pub fn reset(&mut self) {
        self.in_buf.reset();
        self.out_buf.reset();
        self.newest_input = 0.0;
        self.newest_output = 0.0;
        self.sat_flag = false;
        self.step = 0;
    }

    pub fn enable_saturation(&mut self, min: f32, max: f32) -> Result<(), MathError> {
        if min >= max {
            return Err(MathError::InvalidArgument("saturation min must be below max"));
        }
        self.sat_en = true;
        self.sat_min = min;
        self.sat_max = max;
        Ok(())
    }

    pub fn did_saturate(&self) -> bool {
        self.sat_flag
    }

    /// Open the saturation bound linearly from zero over `seconds` after
    /// each reset. Saturation must already be enabled.
    pub fn enable_soft_start(&mut self, seconds: f32) -> Result<(), MathError> {
        if !self.sat_en {
            return Err(MathError::InvalidArgument(
                "soft start requires saturation to be enabled",
            ));
        }
        if seconds <= 0.0 {
            return Err(MathError::InvalidArgument("soft start time must be positive"));
        }
        self.ss_en = true;
        self.ss_steps = (seconds / self.dt).ceil();
        Ok(())
    }

    /// Fill input history as if every past input had been `value`. Useful
    /// when starting a high-pass filter on a non-zero signal.
    pub fn prefill_inputs(&mut self, value: f32) {
        self.in_buf.fill(value);
        self.newest_input = value;
    }

    /// Fill output history as if every past output had been `value`. Useful
    /// when starting a low-pass filter without a settling transient.
    pub fn prefill_outputs(&mut self, value: f32) {
        self.out_buf.fill(value);
        self.newest_output = value;
    }

    /// Input `steps` marches ago; 0 is the most recent.
    pub fn previous_input(&self, steps: usize) -> Result<f32, MathError> {
        if steps > self.order {
            return Err(MathError::InvalidArgument("input history only spans the order"));
        }
        Ok(self.in_buf.get(steps))
    }

    /// Output `steps` marches ago; 0 is the most recent.
    pub fn previous_output(&self, steps: usize) -> Result<f32, MathError> {
        if steps > self.order {
            return Err(MathError::InvalidArgument("output history only spans the order"));
        }
        Ok(self.out_buf.get(steps))
    }

    pub fn newest_input(&self) -> f32 {
        self.newest_input
    }

    pub fn newest_output(&self) -> f32 {
        self.newest_output
    }

    // ------------------------------------------------------------------
    // factory constructors
    // ------------------------------------------------------------------

    /// First-order low-pass with time constant `tc` seconds, discretized by
    /// matching the continuous pole: `c = exp(-dt/tc)`.
    ///
    /// Pairs with [`Filter::first_order_highpass`] at the same crossover to
    /// form a complementary filter: their outputs sum to the input exactly.
    pub fn first_order_lowpass(dt: f32, tc: f32) -> Result<Filter, MathError> {
        if tc <= 0.0 {
            return Err(MathError::InvalidArgument("time constant must be positive"));
        }
        let c = (-dt / tc).exp();
        Filter::new(&[1.0 - c, 0.0], &[1.0, -c], dt)
    }

    /// First-order high-pass with time constant `tc` seconds, matched-pole
    /// discretization. Complement of [`Filter::first_order_lowpass`].
    pub fn first_order_highpass(dt: f32, tc: f32) -> Result<Filter, MathError> {
        if tc <= 0.0 {
            return Err(MathError::InvalidArgument("time constant must be positive"));
        }
        let c = (-dt / tc).exp();
        Filter::new(&[c, -c], &[1.0, -c], dt)
    }

    /// Butterworth low-pass of any order with cutoff `wc` rad/s, discretized
    /// by Tustin's method with prewarping at the cutoff.
    pub fn butterworth_lowpass(order: usize, dt: f32, wc: f32) -> Result<Filter, MathError> {
        if order < 1 {
            return Err(MathError::InvalidArgument("butterworth order must be >= 1"));
        }
        let den = polynomial::butterworth(order, wc as f64);
        let num = [(wc as f64).powi(order as i32)];
        Filter::c2d_tustin(&num, &den, dt, wc)
    }

    /// Butterworth high-pass of any order with cutoff `wc` rad/s.
    pub fn butterworth_highpass(order: usize, dt: f32, wc: f32) -> Result<Filter, MathError> {
        if order < 1 {
            return Err(MathError::InvalidArgument("butterworth order must be >= 1"));
        }
        let den = polynomial::butterworth(order, wc as f64);
        let mut num = vec![0.0f64; order + 1];
        num[0] = 1.0;
        Filter::c2d_tustin(&num, &den, dt, wc)
    }

    /// FIR moving average over `samples` inputs. `dt` is in seconds.
    pub fn moving_average(samples: usize, dt: f32) -> Result<Filter, MathError> {
        if samples < 2 {
            return Err(MathError::InvalidArgument(
                "moving average needs at least 2 samples",
            ));
        }
        let num = vec![1.0 / samples as f32; samples];
        let mut den = vec![0.0f32; samples];
        den[0] = 1.0;
        Filter::new(&num, &den, dt)
    }

    /// First-order integrator (forward accumulation of `input * dt`).
    pub fn integrator(dt: f32) -> Result<Filter, MathError> {
        Filter::new(&[dt], &[1.0, -1.0], dt)
    }

    /// Second-order double integrator.
    pub fn double_integrator(dt: f32) -> Result<Filter, MathError> {
        Filter::new(&[dt * dt], &[1.0, -2.0, 1.0], dt)
    }

    /// Parallel PID with first-order rolloff on the derivative.
    ///
    /// A pure differentiator has no discrete realization, so the derivative
    /// path rolls off with time constant `tf`, which must exceed `dt/2` for
    /// stability.
    pub fn pid(kp: f32, ki: f32, kd: f32, tf: f32, dt: f32) -> Result<Filter, MathError> {
        if tf <= dt / 2.0 {
            return Err(MathError::InvalidArgument("pid rolloff tf must exceed dt/2"));
        }
        if ki == 0.0 && kd == 0.0 {
            return Filter::new(&[kp], &[1.0], dt);
        }
        // C(s) = ((kd + kp*tf) s^2 + (kp + ki*tf) s + ki) / (tf s^2 + s)
        let num = [
            (kd + kp * tf) as f64,
            (kp + ki * tf) as f64,
            ki as f64,
        ];
        let den = [tf as f64, 1.0, 0.0];
        Filter::c2d_tustin(&num, &den, dt, 0.0)
    }

    /// Discretize a continuous transfer function with Tustin's method.
    ///
    /// `w` is the prewarp frequency in rad/s; pass 0 for the plain bilinear
    /// transform. Coefficients are highest power first.
    pub fn c2d_tustin(num: &[f64], den: &[f64], dt: f32, w: f32) -> Result<Filter, MathError> {
        if dt <= 0.0 {
            return Err(MathError::InvalidArgument("filter dt must be positive"));
        }
        if num.is_empty() || den.is_empty() || num.len() > den.len() {
            return Err(MathError::InvalidArgument("improper continuous transfer function"));
        }
        let dt64 = dt as f64;
        let c = if w > 0.0 {
            let w = w as f64;
            w / (w * dt64 / 2.0).tan()
        } else {
            2.0 / dt64
        };
        let n = den.len() - 1;
        let m = num.len() - 1;
        // substitute s = c (z-1)/(z+1) and clear (z+1)^n from both sides
        let mut num_d = vec![0.0f64; n + 1];
        let mut den_d = vec![0.0f64; n + 1];
        for (i, &coef) in num.iter().enumerate() {
            let p = m - i;
            let term = polynomial::multiply(
                &polynomial::power(&[1.0, -1.0], p),
                &polynomial::power(&[1.0, 1.0], n - p),
            );
            for (k, t) in term.iter().enumerate() {
                num_d[k] += coef * c.powi(p as i32) * t;
            }
        }
        for (j, &coef) in den.iter().enumerate() {
            let p = n - j;
            let term = polynomial::multiply(
                &polynomial::power(&[1.0, -1.0], p),
                &polynomial::power(&[1.0, 1.0], n - p),
            );
            for (k, t) in term.iter().enumerate() {
                den_d[k] += coef * c.powi(p as i32) * t;
            }
        }
        let lead = den_d[0];
        if lead == 0.0 {
            return Err(MathError::NotFullRank);
        }
        let num_f: Vec<f32> = num_d.iter().map(|v| (v / lead) as f32).collect();
        let den_f: Vec<f32> = den_d.iter().map(|v| (v / lead) as f32).collect();
        Filter::new(&num_f, &den_f, dt)
    }
}

#[cfg(test)]
mod tests {
    use super::Filter;

    #[test]
    fn moving_average_converges_within_window() {
        let mut f = Filter::moving_average(8, 0.01).unwrap();
        let mut out = 0.0;
        for _ in 0..8 {
            out = f.march(3.5);
        }
        assert!((out - 3.5).abs() < 1e-6);
    }

    #[test]
    fn lowpass_step_response_hits_63_percent_at_tc() {
        let dt = 0.01;
        let tc = 0.5;
        let mut f = Filter::first_order_lowpass(dt, tc).unwrap();
        let steps = (tc / dt) as usize;
        let mut out = 0.0;
        for _ in 0..steps {
            out = f.march(1.0);
        }
        assert!((out - (1.0 - (-1.0f32).exp())).abs() < 0.01, "out = {}", out);
    }

    #[test]
    fn complementary_pair_sums_to_input() {
        let dt = 0.005;
        let tc = 2.0;
        let mut lp = Filter::first_order_lowpass(dt, tc).unwrap();
        let mut hp = Filter::first_order_highpass(dt, tc).unwrap();
        for k in 0..500 {
            let u = (k as f32 * 0.07).sin() + 0.3;
            let sum = lp.march(u) + hp.march(u);
            assert!((sum - u).abs() < 1e-4, "step {}: {} vs {}", k, sum, u);
        }
    }

    #[test]
    fn saturation_bounds_output_and_sets_flag() {
        let mut f = Filter::integrator(0.1).unwrap();
        f.enable_saturation(-1.0, 1.0).unwrap();
        for _ in 0..100 {
            let out = f.march(5.0);
            assert!(out >= -1.0 && out <= 1.0);
        }
        assert!(f.did_saturate());
    }

    #[test]
    fn soft_start_ramps_the_bound() {
        let dt = 0.1;
        let mut f = Filter::new(&[1.0], &[1.0], dt).unwrap();
        f.enable_saturation(-10.0, 10.0).unwrap();
        f.enable_soft_start(1.0).unwrap(); // 10 steps
        for k in 0..10u32 {
            let out = f.march(100.0);
            let allowed = 10.0 * k as f32 / 10.0;
            assert!(out <= allowed + 1e-6, "step {}: {} > {}", k, out, allowed);
            assert!(!f.did_saturate());
        }
        // ramp finished, normal saturation takes over
        assert!((f.march(100.0) - 10.0).abs() < 1e-6);
        assert!(f.did_saturate());
        // reset re-engages the ramp
        f.reset();
        assert_eq!(f.march(100.0), 0.0);
    }

    #[test]
    fn integrator_accumulates() {
        let dt = 0.02;
        let mut f = Filter::integrator(dt).unwrap();
        let mut out = 0.0;
        for _ in 0..50 {
            out = f.march(2.0);
        }
        // one-step delay means 49 contributions of 2*dt
        assert!((out - 49.0 * 2.0 * dt).abs() < 1e-4, "out = {}", out);
    }

    #[test]
    fn butterworth_lowpass_has_unity_dc_gain() {
        let mut f = Filter::butterworth_lowpass(2, 0.01, 30.0).unwrap();
        let mut out = 0.0;
        for _ in 0..2000 {
            out = f.march(2.0);
        }
        assert!((out - 2.0).abs() < 1e-3, "out = {}", out);
    }

    #[test]
    fn butterworth_highpass_rejects_dc() {
        let mut f = Filter::butterworth_highpass(2, 0.01, 30.0).unwrap();
        let mut out = 1.0;
        for _ in 0..2000 {
            out = f.march(2.0);
        }
        assert!(out.abs() < 1e-3, "out = {}", out);
    }

    #[test]
    fn proportional_only_pid_is_a_gain() {
        let mut f = Filter::pid(3.0, 0.0, 0.0, 0.1, 0.01).unwrap();
        assert!((f.march(2.0) - 6.0).abs() < 1e-6);
    }

    #[test]
    fn pid_rejects_fast_rolloff() {
        assert!(Filter::pid(1.0, 1.0, 0.1, 0.004, 0.01).is_err());
    }

    #[test]
    fn prefill_suppresses_startup_transient() {
        let dt = 0.01;
        let mut lp = Filter::first_order_lowpass(dt, 1.0).unwrap();
        lp.prefill_inputs(5.0);
        lp.prefill_outputs(5.0);
        let out = lp.march(5.0);
        assert!((out - 5.0).abs() < 1e-5);
    }
}
