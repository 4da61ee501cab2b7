//! Numerical support for IMU processing.
//!
//! The crate provides runtime-sized vectors and matrices with the
//! decompositions needed for sensor calibration (LUP, Householder QR,
//! least-squares ellipsoid fitting), quaternion math with 321 Tait-Bryan
//! conversions, and discrete SISO filters described by rational transfer
//! functions with ring-buffer state.

pub mod algebra;
pub mod filter;
pub mod matrix;
pub mod polynomial;
pub mod quaternion;
pub mod ring_buffer;
pub mod vector;

pub use filter::Filter;
pub use matrix::Matrix;
pub use ring_buffer::RingBuffer;
pub use vector::Vector;

/// Values with magnitude below this are treated as zero in rank tests.
///
/// Routines that gate on rank also come in `_with_tolerance` variants for
/// callers that need a different epsilon.
pub const DEFAULT_ZERO_TOLERANCE: f32 = 1e-8;

/// Errors from the numerical routines.
#[derive(Debug, thiserror::Error)]
pub enum MathError {
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(&'static str),
    #[error("matrix is singular or not full rank")]
    NotFullRank,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}
