use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to map persistent region")]
    Map(#[from] io::Error),

    #[error("region too small: need {needed} bytes, have {available}")]
    RegionTooSmall { needed: usize, available: usize },

    #[error("table schema with zero capacity or zero tuple size")]
    EmptySchema,
}
