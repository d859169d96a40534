//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use chrono::{DateTime, Local};
pub use futures::future::FutureExt;
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools};
pub use letterbox::{AffineTransform, Letterbox, HW};
pub use noisy_float::prelude::*;
pub use once_cell::sync::OnceCell;
pub use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use serde::{
    de::Error as DeserializeError, Deserialize, Deserializer, Serialize, Serializer,
};
pub use std::{
    borrow::Borrow,
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};
pub use tch::{nn, Device, Kind, Reduction, Tensor};
pub use tch_goodies::{batch_mask_iou, mask_iou, Interpolation, TensorExt};
pub use tfrecord::{EventWriter, EventWriterInit};
pub use tokio::sync::broadcast;
pub use tracing::{debug, info, warn};

pub type Fallible<T> = Result<T, Error>;
