use serde::{Deserialize, Serialize};

use crate::error::{PlaneError, Result};

/// Contiguous range of dataset items handed to one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSlice {
    pub offset: u64,
    pub len: u64,
}

/// Splits `items` across `workers` slices of `ceil(items / workers)`; the
/// last slice takes whatever remains.
pub fn partition(items: u64, workers: u32) -> Result<Vec<DataSlice>> {
    if workers == 0 {
        return Err(PlaneError::Validation(
            "cannot partition a dataset across zero workers".into(),
        ));
    }
    let workers = u64::from(workers);
    let chunk = items.div_ceil(workers);
    let mut slices = Vec::with_capacity(workers as usize);
    let mut offset = 0;
    for _ in 0..workers {
        let len = chunk.min(items - offset);
        slices.push(DataSlice { offset, len });
        offset += len;
    }
    Ok(slices)
}
