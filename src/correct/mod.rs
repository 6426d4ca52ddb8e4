//! Reporter-channel signal correction.

pub mod impurity;

pub use impurity::{correct_impurities, CorrectedMatrix, ImpurityMatrix};
