//! Utility functions for path validation, file discovery, text cleanup and
//! pixel decoding.

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dicom::object::DefaultDicomObject;
use dicom_pixeldata::{DecodedPixelData, PixelDecoder};
use indicatif::{ProgressBar, ProgressStyle};
use walkdir::WalkDir;

/// Symbols that are replaced with an underscore by [`clean_text`].
pub const FORBIDDEN_SYMBOLS: [char; 12] = ['*', '.', ',', '"', '\\', '/', '|', '[', ']', ':', ';', ' '];

/// Validate that the input folder exists and is a directory.
pub fn validate_input_folder(input: &Path) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("Input folder does not exist: {input:?}");
    }
    if !input.is_dir() {
        anyhow::bail!("Input path is not a directory: {input:?}");
    }
    Ok(())
}

/// Decode the pixel data of `obj`. Some codecs panic on truncated or corrupt
/// fragments; such a panic is returned as an error instead of unwinding
/// through the batch loop.
pub fn decode_pixels(obj: &DefaultDicomObject) -> Result<DecodedPixelData<'_>> {
    match panic::catch_unwind(AssertUnwindSafe(|| obj.decode_pixel_data())) {
        Ok(decoded) => decoded.context("Failed to decode pixel data"),
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown cause".to_string());
            anyhow::bail!("Pixel decoder panicked: {reason}")
        }
    }
}

/// Clean and standardize a free-text header value for use as a folder name.
///
/// Every forbidden symbol becomes an underscore and the result is lowercased,
/// so the output always has the same number of characters as the input.
pub fn clean_text(text: &str) -> String {
    text.chars()
        .map(|c| if FORBIDDEN_SYMBOLS.contains(&c) { '_' } else { c })
        .flat_map(char::to_lowercase)
        .collect()
}

/// Whether `path` is a file whose extension matches `ext`, ignoring case.
pub fn has_extension(path: &Path, ext: &str) -> bool {
    path.is_file()
        && path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// List the files directly inside `dir` with the given extension, sorted by path.
pub fn files_with_extension(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory: {dir:?}"))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| has_extension(path, ext))
        .collect();
    files.sort();
    Ok(files)
}

/// Recursively list every file below `root` with the given extension.
///
/// Unreadable directory entries are skipped. The walk is sorted by file name
/// so repeated runs visit files in the same order.
pub fn walk_files_with_extension(root: &Path, ext: &str) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| has_extension(path, ext))
        .collect()
}

/// Create `path` and its parents. Returns `true` when the directory was new.
pub fn ensure_dir(path: &Path) -> Result<bool> {
    if path.is_dir() {
        return Ok(false);
    }
    fs::create_dir_all(path).with_context(|| format!("Failed to create folder: {path:?}"))?;
    Ok(true)
}

/// Progress bar for per-file loops. Hidden when `quiet` is set.
pub fn progress_bar(len: usize, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

// =============================================================================
// Unit Tests for utils module
// =============================================================================
