//! Upload pipeline: multipart decoding and image storage

mod images;
mod multipart;

pub use images::{cleanup_images, persist_images, save_uploads};
pub use multipart::{boundary_from_content_type, parse_multipart, UploadedFile};
