mod common;
pub mod mask;
pub mod tensor;

pub use mask::*;
pub use tensor::*;
