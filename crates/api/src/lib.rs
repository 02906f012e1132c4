pub mod client;
pub mod error;

pub use client::{ChatApi, HttpChatApi};
pub use error::ApiError;
