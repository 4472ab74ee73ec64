//! Utility functions for timestamps and private file handling.

mod fs;
pub mod timestamps;

pub use fs::{create_private_dir, remove_file_if_exists, write_private_file};
pub use timestamps::{from_unix_millis, iso_timestamp, now_utc, parse_timestamp, Timestamp};
