//! Decompositions and solvers built on [`Matrix`] and [`Vector`].

use crate::matrix::{mult_accumulate, Matrix};
use crate::vector::Vector;
use crate::{MathError, DEFAULT_ZERO_TOLERANCE};

/// LUP decomposition with partial pivoting: `P * A = L * U`.
pub fn lup_decomp(a: &Matrix) -> Result<(Matrix, Matrix, Matrix), MathError> {
    if a.rows() != a.cols() {
        return Err(MathError::DimensionMismatch("LUP of nonsquare matrix"));
    }
    let m = a.rows();
    let mut adup = a.clone();
    let mut l = Matrix::identity(m);
    let mut u = Matrix::zeros(m, m);
    let mut p = Matrix::zeros(m, m);

    // track row positions instead of swapping a full permutation matrix
    let mut perm: Vec<usize> = (0..m).collect();
    for i in 0..m.saturating_sub(1) {
        let mut index = i;
        for j in i..m {
            if adup.get(j, i).abs() >= adup.get(index, i).abs() {
                index = j;
            }
        }
        if index != i {
            perm.swap(index, i);
            for k in 0..m {
                let tmp = adup.get(index, k);
                adup.set(index, k, adup.get(i, k));
                adup.set(i, k, tmp);
            }
        }
    }
    for (i, &pi) in perm.iter().enumerate() {
        p.set(i, pi, 1.0);
    }
    // Doolittle factorization of the permuted matrix
    for i in 0..m {
        for j in 0..m {
            let mut s1 = 0.0;
            let mut s2 = 0.0;
            for k in 0..i {
                s1 += u.get(k, j) * l.get(i, k);
            }
            for k in 0..j {
                s2 += u.get(k, j) * l.get(i, k);
            }
            if j >= i {
                u.set(i, j, adup.get(i, j) - s1);
            }
            if i >= j {
                l.set(i, j, (adup.get(i, j) - s2) / u.get(j, j));
            }
        }
    }
    Ok((l, u, p))
}

/// QR decomposition by Householder reflections: `A = Q * R`.
///
/// `Q` comes back `m x m` orthogonal and `R` is `m x n` upper triangular.
pub fn qr_decomp(a: &Matrix) -> (Matrix, Matrix) {
    let m = a.rows();
    let n = a.cols();
    let mut r = a.clone();
    let mut q = Matrix::identity(m);
    // number of reflections needed for square/tall/wide shapes
    let steps = if m == n {
        n - 1
    } else if m > n {
        n
    } else {
        m - 1
    };
    let mut v = vec![0.0f32; m];
    let mut w = vec![0.0f32; n.max(m)];
    for k in 0..steps {
        let len = m - k;
        for i in 0..len {
            v[i] = r.get(k + i, k);
        }
        let norm = mult_accumulate(&v[..len], &v[..len]).sqrt();
        if norm == 0.0 {
            continue;
        }
        // pick the sign opposite the pivot to avoid loss of significance
        let alpha = if v[0] >= 0.0 { -norm } else { norm };
        v[0] -= alpha;
        let vtv = mult_accumulate(&v[..len], &v[..len]);
        if vtv == 0.0 {
            continue;
        }
        let beta = 2.0 / vtv;
        // R <- H * R on the lower-right minor; first column is known
        for j in k + 1..n {
            let mut acc = 0.0;
            for l in 0..len {
                acc += v[l] * r.get(k + l, j);
            }
            w[j] = acc;
        }
        r.set(k, k, alpha);
        for i in 1..len {
            r.set(k + i, k, 0.0);
        }
        for j in k + 1..n {
            for l in 0..len {
                let val = r.get(k + l, j) - beta * v[l] * w[j];
                r.set(k + l, j, val);
            }
        }
        // Q <- Q * H, touching only columns k..m
        for i in 0..m {
            let mut acc = 0.0;
            for l in 0..len {
                acc += q.get(i, k + l) * v[l];
            }
            for l in 0..len {
                let val = q.get(i, k + l) - beta * acc * v[l];
                q.set(i, k + l, val);
            }
        }
    }
    (q, r)
}

/// Matrix inverse via the LUP decomposition.
pub fn invert_matrix(a: &Matrix) -> Result<Matrix, MathError> {
    invert_matrix_with_tolerance(a, DEFAULT_ZERO_TOLERANCE)
}

pub fn invert_matrix_with_tolerance(a: &Matrix, tol: f32) -> Result<Matrix, MathError> {
    if a.rows() != a.cols() {
        return Err(MathError::DimensionMismatch("inverse of nonsquare matrix"));
    }
    if a.determinant()?.abs() < tol {
        return Err(MathError::NotFullRank);
    }
    let n = a.cols();
    let (l, u, p) = lup_decomp(a)?;
    let mut d = Matrix::identity(n);
    let mut tmp = Matrix::zeros(n, n);
    for j in 0..n {
        // forward substitution through L
        for i in 0..n {
            let mut acc = d.get(i, j);
            for k in 0..i {
                acc -= l.get(i, k) * d.get(k, j);
            }
            d.set(i, j, acc);
        }
        // back substitution through U
        for i in (0..n).rev() {
            let mut acc = d.get(i, j);
            for k in i + 1..n {
                acc -= u.get(i, k) * tmp.get(k, j);
            }
            tmp.set(i, j, acc / u.get(i, i));
        }
    }
    tmp.multiply(&p)
}

/// Solve `A * x = b` by Gaussian elimination with partial pivoting.
///
/// Fails with [`MathError::NotFullRank`] when a pivot magnitude drops below
/// the zero tolerance.
pub fn lin_system_solve(a: &Matrix, b: &Vector) -> Result<Vector, MathError> {
    lin_system_solve_with_tolerance(a, b, DEFAULT_ZERO_TOLERANCE)
}

pub fn lin_system_solve_with_tolerance(
    a: &Matrix,
    b: &Vector,
    tol: f32,
) -> Result<Vector, MathError> {
    if a.cols() != b.len() {
        return Err(MathError::DimensionMismatch("solve dimension mismatch"));
    }
    let n = a.cols();
    let mut at = a.clone();
    let mut bt = b.clone();
    let mut x = Vector::zeros(n);
    for k in 0..n.saturating_sub(1) {
        // find the row with the largest leading element
        let mut max_elem = at.get(k, k).abs();
        let mut m = k;
        for i in k + 1..n {
            if at.get(i, k).abs() > max_elem {
                max_elem = at.get(i, k).abs();
                m = i;
            }
        }
        if m != k {
            for i in k..n {
                let acc = at.get(k, i);
                at.set(k, i, at.get(m, i));
                at.set(m, i, acc);
            }
            let acc = bt[k];
            bt[k] = bt[m];
            bt[m] = acc;
        }
        if at.get(k, k).abs() < tol {
            return Err(MathError::NotFullRank);
        }
        for j in k + 1..n {
            let acc = -at.get(j, k) / at.get(k, k);
            for i in k..n {
                let v = at.get(j, i) + acc * at.get(k, i);
                at.set(j, i, v);
            }
            bt[j] += acc * bt[k];
        }
    }
    for k in (0..n).rev() {
        let mut v = bt[k];
        for i in k + 1..n {
            v -= at.get(k, i) * x[i];
        }
        x[k] = v / at.get(k, k);
    }
    Ok(x)
}

/// Least-squares solution of `A * x = b` via QR.
///
/// `Rx = Q'b`; the right-hand side is formed as `(b'Q)'` to avoid
/// materializing a transpose of `Q`.
pub fn lin_system_solve_qr(a: &Matrix, b: &Vector) -> Result<Vector, MathError> {
    if a.rows() != b.len() {
        return Err(MathError::DimensionMismatch("QR solve dimension mismatch"));
    }
    let (q, r) = qr_decomp(a);
    let temp = q.row_vec_times_matrix(b)?;
    let n = r.cols();
    let mut x = Vector::zeros(n);
    for k in (0..n).rev() {
        let mut v = temp[k];
        for i in k + 1..n {
            v -= r.get(k, i) * x[i];
        }
        x[k] = v / r.get(k, k);
    }
    Ok(x)
}

/// Least-squares ellipsoid fit to a set of 3D points.
///
/// `points` must be `p x 3` with `p >= 6`. Solves `A f = 1` for the
/// 6-coefficient quadric `[x^2 x y^2 y z^2 z]`, then recovers the center and
/// the axis half-lengths. Returns `(center, lengths)`.
pub fn fit_ellipsoid(points: &Matrix) -> Result<(Vector, Vector), MathError> {
    if points.cols() != 3 {
        return Err(MathError::DimensionMismatch("ellipsoid points must be p x 3"));
    }
    let p = points.rows();
    if p < 6 {
        return Err(MathError::InvalidArgument("ellipsoid fit needs at least 6 points"));
    }
    let b = Vector::ones(p);
    let mut a = Matrix::zeros(p, 6);
    for i in 0..p {
        let (x, y, z) = (points.get(i, 0), points.get(i, 1), points.get(i, 2));
        a.set(i, 0, x * x);
        a.set(i, 1, x);
        a.set(i, 2, y * y);
        a.set(i, 3, y);
        a.set(i, 4, z * z);
        a.set(i, 5, z);
    }
    let f = lin_system_solve_qr(&a, &b)?;

    let mut center = Vector::zeros(3);
    center[0] = -f[1] / (2.0 * f[0]);
    center[1] = -f[3] / (2.0 * f[2]);
    center[2] = -f[5] / (2.0 * f[4]);

    // second small solve recovers the axis half-lengths
    let mut a2 = Matrix::zeros(3, 3);
    a2.set(0, 0, f[0] * center[0] * center[0] + 1.0);
    a2.set(0, 1, f[0] * center[1] * center[1]);
    a2.set(0, 2, f[0] * center[2] * center[2]);
    a2.set(1, 0, f[2] * center[0] * center[0]);
    a2.set(1, 1, f[2] * center[1] * center[1] + 1.0);
    a2.set(1, 2, f[2] * center[2] * center[2]);
    a2.set(2, 0, f[4] * center[0] * center[0]);
    a2.set(2, 1, f[4] * center[1] * center[1]);
    a2.set(2, 2, f[4] * center[2] * center[2] + 1.0);
    let b2 = Vector::from_slice(&[f[0], f[2], f[4]]);
    let mut lengths = lin_system_solve(&a2, &b2)?;
    lengths[0] = 1.0 / lengths[0].sqrt();
    lengths[1] = 1.0 / lengths[1].sqrt();
    lengths[2] = 1.0 / lengths[2].sqrt();
    Ok((center, lengths))
}

#[cfg(test)]
mod tests {
    use super::*;

    // small deterministic generator so tests don't need an RNG crate
    struct Lcg(u64);
    impl Lcg {
        /// Uniform-ish value in [-1, 1).
        fn next_f32(&mut self) -> f32 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((self.0 >> 32) as u32 as f32 / (1u64 << 31) as f32) - 1.0
        }
    }

    fn random_matrix(n: usize, seed: u64) -> Matrix {
        let mut lcg = Lcg(seed);
        let mut m = Matrix::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                m.set(i, j, lcg.next_f32() * 4.0);
            }
        }
        m
    }

    fn assert_close(a: &Matrix, b: &Matrix, tol: f32) {
        assert_eq!(a.rows(), b.rows());
        assert_eq!(a.cols(), b.cols());
        for i in 0..a.rows() {
            for j in 0..a.cols() {
                assert!(
                    (a.get(i, j) - b.get(i, j)).abs() < tol,
                    "entry ({}, {}): {} vs {}",
                    i,
                    j,
                    a.get(i, j),
                    b.get(i, j)
                );
            }
        }
    }

    #[test]
    fn lup_reconstructs() {
        for seed in 1..5u64 {
            let a = random_matrix(5, seed);
            let (l, u, p) = lup_decomp(&a).unwrap();
            let pa = p.multiply(&a).unwrap();
            let lu = l.multiply(&u).unwrap();
            assert_close(&pa, &lu, 1e-5 * a.max_abs().max(1.0));
        }
    }

    #[test]
    fn qr_reconstructs_and_q_is_orthogonal() {
        let a = random_matrix(6, 42);
        let (q, r) = qr_decomp(&a);
        let qr = q.multiply(&r).unwrap();
        assert_close(&qr, &a, 1e-4);
        let qtq = q.transpose().multiply(&q).unwrap();
        assert_close(&qtq, &Matrix::identity(6), 1e-4);
    }

    #[test]
    fn inverse_times_original_is_identity() {
        let a = random_matrix(4, 7);
        let inv = invert_matrix(&a).unwrap();
        let prod = a.multiply(&inv).unwrap();
        assert_close(&prod, &Matrix::identity(4), 1e-3);
    }

    #[test]
    fn solve_satisfies_system() {
        let a = random_matrix(6, 11);
        let mut lcg = Lcg(99);
        let mut b = Vector::zeros(6);
        for i in 0..6 {
            b[i] = lcg.next_f32() * 3.0;
        }
        let x = lin_system_solve(&a, &b).unwrap();
        let ax = a.times_col_vec(&x).unwrap();
        let mut err = 0.0f32;
        for i in 0..6 {
            err += (ax[i] - b[i]) * (ax[i] - b[i]);
        }
        assert!(err.sqrt() < 1e-4, "residual {}", err.sqrt());
    }

    #[test]
    fn solve_rejects_rank_deficient() {
        let a = Matrix::from_rows(&[&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0], &[1.0, 0.0, 1.0]]);
        let b = Vector::ones(3);
        assert!(matches!(
            lin_system_solve(&a, &b),
            Err(MathError::NotFullRank)
        ));
    }

    #[test]
    fn qr_least_squares_on_overdetermined_system() {
        // 10 rows, exact solution [2, -1, 0.5]
        let truth = [2.0f32, -1.0, 0.5];
        let mut lcg = Lcg(5);
        let mut a = Matrix::zeros(10, 3);
        let mut b = Vector::zeros(10);
        for i in 0..10 {
            let mut acc = 0.0;
            for j in 0..3 {
                let v = lcg.next_f32() * 2.0;
                a.set(i, j, v);
                acc += v * truth[j];
            }
            b[i] = acc;
        }
        let x = lin_system_solve_qr(&a, &b).unwrap();
        for j in 0..3 {
            assert!((x[j] - truth[j]).abs() < 1e-3);
        }
    }

    #[test]
    fn ellipsoid_fit_recovers_center_and_lengths() {
        // 200 noisy points on an ellipsoid centered at (10, -5, 3) with
        // half-lengths (40, 45, 50); noise bounded by 1 unit
        let center = [10.0f32, -5.0, 3.0];
        let lengths = [40.0f32, 45.0, 50.0];
        let mut lcg = Lcg(1234);
        let mut pts = Matrix::zeros(200, 3);
        for i in 0..200 {
            let theta = (lcg.next_f32() + 1.0) * std::f32::consts::PI / 2.0;
            let phi = lcg.next_f32() * std::f32::consts::PI;
            let dir = [
                theta.sin() * phi.cos(),
                theta.sin() * phi.sin(),
                theta.cos(),
            ];
            for j in 0..3 {
                pts.set(i, j, center[j] + lengths[j] * dir[j] + 0.5 * lcg.next_f32());
            }
        }
        let (c, l) = fit_ellipsoid(&pts).unwrap();
        for j in 0..3 {
            assert!((c[j] - center[j]).abs() < 1.0, "center {}: {}", j, c[j]);
            assert!((l[j] - lengths[j]).abs() < 2.0, "length {}: {}", j, l[j]);
        }
    }
}
