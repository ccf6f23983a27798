#![forbid(unsafe_code)]

//! Library half of vidfetch: a tiny HTTP front end over `yt-dlp`.
//!
//! The backend binary only wires configuration, logging and the listener
//! together; everything a request touches lives in these modules so it can be
//! tested without a network or a real `yt-dlp` install.

pub mod api;
pub mod config;
pub mod error;
pub mod extractor;
pub mod metadata;
pub mod storage;
