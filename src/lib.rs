#![forbid(unsafe_code)]

//! Building blocks of the ytmp3 conversion service: the conversion workflow,
//! its yt-dlp and SQLite collaborators, and the shared config/security
//! helpers used by the `backend` binary.

pub mod config;
pub mod conversion;
pub mod error;
pub mod library;
pub mod security;
pub mod slug;
pub mod storage;
pub mod ytdlp;
