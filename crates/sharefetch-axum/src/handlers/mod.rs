//! HTTP request handlers.
//!
//! Handlers are thin wrappers around [`ShareDownloader`].
//!
//! [`ShareDownloader`]: sharefetch_download::ShareDownloader

pub mod share;
pub mod status;
