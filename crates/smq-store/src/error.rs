use thiserror::Error;

use crate::layout::Location;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("record of {size} bytes exceeds the limit of {max}")]
    TooLarge { size: usize, max: usize },
    #[error("stale handle at {0:?}")]
    StaleHandle(Location),
    #[error("store corrupt: {0}")]
    Corrupt(String),
}
