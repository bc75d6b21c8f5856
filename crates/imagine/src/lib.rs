//! Client for the URL-addressed image synthesis endpoint.
//!
//! The endpoint is stateless: the image is fully determined by the request URL,
//! so "generating" an image is building its URL. Bytes are only fetched when a
//! caller wants to keep a local copy.

mod client;
mod endpoint;
mod error;

pub use client::ImageClient;
pub use endpoint::{
    DEFAULT_ENDPOINT, DEFAULT_IMAGE_SIZE, ImageEndpoint, PLACEHOLDER_IMAGE_URL, download_file_name,
};
pub use error::{ImagineError, ImagineResult};
