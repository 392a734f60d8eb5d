use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// One transaction's records (including the commit record) do not fit in
    /// an empty page. This is a configuration fault: the page size must be
    /// raised, no amount of retrying helps.
    #[error("transaction needs {required} log bytes but a page holds {page_size}")]
    TxTooLarge { required: usize, page_size: usize },

    #[error("log span of {len} bytes cannot hold a single {page_size} byte page plus bitmap")]
    SpanTooSmall { len: usize, page_size: usize },
}
