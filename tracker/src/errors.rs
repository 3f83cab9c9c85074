use thiserror::Error;

use crate::{bridge::ChangeFeedError, records::RecordsError};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("records error: {0}")]
    Records(#[from] RecordsError),
    #[error("change feed error: {0}")]
    ChangeFeed(#[from] ChangeFeedError),
    #[error("block {0} not found")]
    BlockNotFound(u64),
}
