//! Affine transforms and letterbox geometry for fixed-size model inputs.

mod common;

pub use hw::*;
pub mod hw;

pub use transform::*;
pub mod transform;

pub use letterbox::*;
pub mod letterbox;
