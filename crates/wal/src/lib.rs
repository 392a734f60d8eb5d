//! Write-ahead log manager.
//!
//! A caller-provided NVM span is divided into a cache-line-aligned allocation
//! bitmap followed by an array of fixed-size pages. A page is owned by one
//! thread at a time; threads append typed records ([`Record`]) and flush the
//! appended range before relying on the trailing commit record. Pages are
//! released once every payload they describe is durable at its target
//! address; until then the bitmap bit stays set and recovery will scan the
//! page.

pub mod error;
mod pages;
mod reader;
mod record;

pub use crate::{
    error::Error,
    pages::{LogManager, LogPage, PageCursor},
    reader::PageScanner,
    record::{insert_len, update_len, Record, COMMIT_LEN, DELETE_LEN, START_LEN},
};
