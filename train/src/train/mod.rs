//! Training, evaluation and inference drivers.

mod eval;
mod inference;
mod orchestrator;
mod step;
mod worker;

pub use eval::*;
pub use inference::*;
pub use orchestrator::*;
pub use step::*;
pub use worker::*;
