#![forbid(unsafe_code)]

//! Library half of tubefetch: URL recognition, metadata shaping, thumbnail
//! passthrough and scoped server-side downloads. The HTTP surface lives in
//! the `backend` binary.

pub mod config;
pub mod download;
pub mod error;
pub mod extractor;
pub mod metadata;
pub mod pages;
pub mod security;
pub mod thumbnail;
pub mod video_url;
