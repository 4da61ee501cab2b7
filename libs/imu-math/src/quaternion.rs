//! Quaternion math and 321 Tait-Bryan conversions.
//!
//! Quaternions are stored `[w, x, y, z]`. Tait-Bryan triples are stored
//! `[pitch_x, roll_y, yaw_z]` in radians using the 321 (ZYX) rotation
//! order: yaw about Z applied first, then pitch about Y, then roll about X.
//!
//! Near `pitch = +/- pi/2` the Tait-Bryan representation is ill-conditioned
//! and the quaternion/angle round trip is only defined up to sign. Use
//! quaternions for interpolation and storage; convert to angles at the edge.

use crate::matrix::Matrix;

/// 2-norm of a quaternion.
pub fn norm(q: &[f32; 4]) -> f32 {
    (q.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>()).sqrt() as f32
}

/// Normalize in place to unit length. A zero quaternion is left unchanged.
pub fn normalize(q: &mut [f32; 4]) {
    let len = norm(q) as f64;
    if len == 0.0 {
        return;
    }
    for v in q.iter_mut() {
        *v = ((*v as f64) / len) as f32;
    }
}

/// Conjugate: imaginary parts negated.
pub fn conjugate(q: &[f32; 4]) -> [f32; 4] {
    [q[0], -q[1], -q[2], -q[3]]
}

/// Hamilton product `a * b`.
pub fn multiply(a: &[f32; 4], b: &[f32; 4]) -> [f32; 4] {
    [
        a[0] * b[0] - a[1] * b[1] - a[2] * b[2] - a[3] * b[3],
        a[0] * b[1] + a[1] * b[0] + a[2] * b[3] - a[3] * b[2],
        a[0] * b[2] - a[1] * b[3] + a[2] * b[0] + a[3] * b[1],
        a[0] * b[3] + a[1] * b[2] - a[2] * b[1] + a[3] * b[0],
    ]
}

/// Rotate quaternion `p` by `q`: `p' = q p q*`.
pub fn rotate(p: &[f32; 4], q: &[f32; 4]) -> [f32; 4] {
    multiply(&multiply(q, p), &conjugate(q))
}

/// Rotate a 3-vector about the origin by unit quaternion `q`.
pub fn rotate_vector(v: &mut [f32; 3], q: &[f32; 4]) {
    let p = [0.0, v[0], v[1], v[2]];
    let rotated = rotate(&p, q);
    v.copy_from_slice(&rotated[1..4]);
}

/// Tait-Bryan angles `[pitch_x, roll_y, yaw_z]` from a unit quaternion.
pub fn quaternion_to_tb(q: &[f32; 4]) -> [f32; 3] {
    let (w, x, y, z) = (q[0] as f64, q[1] as f64, q[2] as f64, q[3] as f64);
    // clamp guards asin against rounding just past +/- 1
    let s = (2.0 * (w * y - x * z)).max(-1.0).min(1.0);
    [
        (2.0 * (y * z + w * x)).atan2(1.0 - 2.0 * (x * x + y * y)) as f32,
        s.asin() as f32,
        (2.0 * (x * y + w * z)).atan2(1.0 - 2.0 * (y * y + z * z)) as f32,
    ]
}

/// Unit quaternion from Tait-Bryan angles `[pitch_x, roll_y, yaw_z]`.
pub fn tb_to_quaternion(tb: &[f32; 3]) -> [f32; 4] {
    let (cx, sx) = ((tb[0] as f64 / 2.0).cos(), (tb[0] as f64 / 2.0).sin());
    let (cy, sy) = ((tb[1] as f64 / 2.0).cos(), (tb[1] as f64 / 2.0).sin());
    let (cz, sz) = ((tb[2] as f64 / 2.0).cos(), (tb[2] as f64 / 2.0).sin());
    [
        (cx * cy * cz + sx * sy * sz) as f32,
        (sx * cy * cz - cx * sy * sz) as f32,
        (cx * sy * cz + sx * cy * sz) as f32,
        (cx * cy * sz - sx * sy * cz) as f32,
    ]
}

/// 3x3 rotation matrix for a unit quaternion, acting on column vectors.
pub fn to_rotation_matrix(q: &[f32; 4]) -> Matrix {
    let (w, x, y, z) = (q[0], q[1], q[2], q[3]);
    Matrix::from_rows(&[
        &[
            1.0 - 2.0 * (y * y + z * z),
            2.0 * (x * y - w * z),
            2.0 * (x * z + w * y),
        ],
        &[
            2.0 * (x * y + w * z),
            1.0 - 2.0 * (x * x + z * z),
            2.0 * (y * z - w * x),
        ],
        &[
            2.0 * (x * z - w * y),
            2.0 * (y * z + w * x),
            1.0 - 2.0 * (x * x + y * y),
        ],
    ])
}
