//! Small dense linear algebra helpers.

mod dmat3;
mod linear;

pub use dmat3::DMat3;
pub(crate) use linear::solve_linear_system;
