pub use anyhow::{ensure, format_err, Result};
pub use num_traits::{Float, Num, NumCast, ToPrimitive};
pub use serde::{Deserialize, Serialize};
pub use std::ops::Mul;
