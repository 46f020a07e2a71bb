//! On-disk layout of the data root.
//!
//! Every image occupies its own folder keyed by `(userId, checksum)`,
//! which keeps concurrent worker writes disjoint:
//!
//! ```text
//! {dataFolder}/{userId}/{checksum}/{fileName}                the image
//! {dataFolder}/{userId}/{checksum}/{fileName}.{alg}sum       the sidecar
//! {dataFolder}/{userId}/{checksum}/.temp/{part}              during pull
//! ```

use std::path::{Path, PathBuf};

use crate::store::{ChecksumAlgorithm, Image};

/// Folder holding an image's files, relative to the data root.
pub fn relative_folder(user_id: i64, checksum: &str) -> String {
    format!("{user_id}/{checksum}")
}

/// Relative path of the image file itself.
pub fn image_relative_path(user_id: i64, checksum: &str, file_name: &str) -> String {
    format!("{}/{file_name}", relative_folder(user_id, checksum))
}

/// Relative path of the checksum sidecar.
pub fn checksum_relative_path(
    user_id: i64,
    checksum: &str,
    file_name: &str,
    algorithm: ChecksumAlgorithm,
) -> String {
    format!(
        "{}/{file_name}.{}sum",
        relative_folder(user_id, checksum),
        algorithm.as_str()
    )
}

/// Absolute folder an image's files live in.
pub fn local_image_folder(data_folder: &Path, image: &Image) -> PathBuf {
    data_folder.join(relative_folder(image.user_id, &image.checksum))
}
