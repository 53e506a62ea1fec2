pub mod common;
pub mod config;
pub mod control;
pub mod downloader;
