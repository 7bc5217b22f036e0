#![forbid(unsafe_code)]

pub mod api;
pub mod compressor;
pub mod config;
pub mod downloader;
pub mod logging;
pub mod scraper;
pub mod security;

#[cfg(all(test, unix))]
pub(crate) mod test_support;
