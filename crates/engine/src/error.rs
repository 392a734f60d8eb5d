use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] pmtx_pmem::Error),

    #[error(transparent)]
    Log(#[from] pmtx_wal::Error),
}
