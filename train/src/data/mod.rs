//! Sample storage, preprocessing and batching.

mod dataset;
mod loader;
mod prompt;
mod sampler;
mod store;
mod tokenizer;

pub use dataset::*;
pub use loader::*;
pub use prompt::*;
pub use sampler::*;
pub use store::*;
pub use tokenizer::*;
