//! File operation utilities
//!
//! Temp-file creation, existing-file inspection and the final move into the
//! target directory. Every download task writes its own uniquely-named temp
//! file next to the target so that the final step is a same-filesystem rename.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use tokio::fs;
use tracing::{debug, warn};

use crate::downloader::core::{DownloadError, FileOperation, Result};

/// Prefix of every temp file this crate creates
pub const TEMP_FILE_PREFIX: &str = ".artifact-fetch-";
pub const TEMP_FILE_SUFFIX: &str = ".tmp";

/// Create a fresh temp file inside `dir`
pub fn create_temp_file(dir: &Path) -> Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(TEMP_FILE_PREFIX)
        .suffix(TEMP_FILE_SUFFIX)
        .tempfile_in(dir)
        .map_err(|source| DownloadError::FileSystem {
            path: dir.to_path_buf(),
            operation: FileOperation::Create,
            source,
        })
}

pub fn is_temp_file_name(name: &str) -> bool {
    name.starts_with(TEMP_FILE_PREFIX) && name.ends_with(TEMP_FILE_SUFFIX)
}

/// Length of a regular file at `path`, or `None` when nothing is there
pub async fn existing_file_len(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
        Ok(_) => Ok(None),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(DownloadError::FileSystem {
            path: path.to_path_buf(),
            operation: FileOperation::Metadata,
            source,
        }),
    }
}

/// Candidate name number `index` for `file_name`: `name.ext`, `name_1.ext`, ...
pub fn derived_name(file_name: &str, index: usize) -> String {
    if index == 0 {
        return file_name.to_string();
    }

    // A leading dot marks a hidden file, not an extension.
    match file_name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &file_name[..dot], index, &file_name[dot..]),
        _ => format!("{}_{}", file_name, index),
    }
}

/// Final location of every file name of a batch, in input order
///
/// The first artifact with a given name gets the plain name, later ones get
/// `stem_1.ext`, `stem_2.ext`, ... skipping names already handed out. The
/// result depends only on the names, so a re-run of the same batch maps each
/// artifact to the file it produced last time.
pub fn assign_file_names<'a, I>(dir: &Path, file_names: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut claimed: HashSet<PathBuf> = HashSet::new();
    file_names
        .into_iter()
        .map(|file_name| {
            let mut index = 0;
            loop {
                let candidate = dir.join(derived_name(file_name, index));
                if claimed.insert(candidate.clone()) {
                    if index > 0 {
                        debug!("Name {} is taken, using {}", file_name, candidate.display());
                    }
                    return candidate;
                }
                index += 1;
            }
        })
        .collect()
}

/// Move a finished temp file to its final destination
pub fn persist(temp: TempPath, dest: &Path) -> Result<()> {
    temp.persist(dest).map_err(|error| DownloadError::FileSystem {
        path: dest.to_path_buf(),
        operation: FileOperation::Move,
        source: error.error,
    })?;
    debug!("Moved download into {}", dest.display());
    Ok(())
}

/// Delete a temp file, logging instead of failing
pub fn discard(temp: TempPath) {
    let path = temp.to_path_buf();
    if let Err(error) = temp.close() {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove temp file {}: {}", path.display(), error);
        }
    }
}

/// Remove a file this batch already moved into place
pub async fn remove_quietly(path: &Path) {
    if let Err(error) = fs::remove_file(path).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), error);
        }
    }
}
