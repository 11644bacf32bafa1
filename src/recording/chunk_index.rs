//! Crash-safe chunk numbering.
//!
//! The next index for a camera/day is always re-derived from the files already
//! on disk, so a restarted process continues the sequence instead of reusing
//! or skipping numbers.

use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone};

use crate::error::RecorderError;

const DAY_FORMAT: &str = "%Y%m%d";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone)]
pub struct ChunkIndexStore {
    root: PathBuf,
}

impl ChunkIndexStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn day_dir(&self, day: NaiveDate) -> PathBuf {
        self.root.join(day.format(DAY_FORMAT).to_string())
    }

    /// One past the highest index found for `camera` on `day`, or 0.
    pub fn next_index(&self, camera: &str, day: NaiveDate) -> Result<u32, RecorderError> {
        let dir = self.day_dir(day);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(RecorderError::Index { path: dir, source }),
        };

        let mut next = 0;
        for entry in entries {
            let entry = entry.map_err(|source| RecorderError::Index {
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(index) = parse_chunk_index(camera, name) {
                next = next.max(index.saturating_add(1));
            }
        }
        Ok(next)
    }

    /// Canonical path for a chunk: `{root}/{YYYYMMDD}/{camera}_{YYYYMMDD_HHMMSS}_{index}.{ext}`
    pub fn chunk_path<Tz: TimeZone>(
        &self,
        camera: &str,
        created_at: &DateTime<Tz>,
        index: u32,
        extension: &str,
    ) -> PathBuf
    where
        Tz::Offset: std::fmt::Display,
    {
        self.day_dir(created_at.date_naive())
            .join(chunk_file_name(camera, created_at, index, extension))
    }
}

pub fn chunk_file_name<Tz: TimeZone>(
    camera: &str,
    created_at: &DateTime<Tz>,
    index: u32,
    extension: &str,
) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}_{}_{}.{}",
        camera,
        created_at.format(STAMP_FORMAT),
        index,
        extension
    )
}

/// Extract the index from `{camera}_{YYYYMMDD_HHMMSS}_{index}.{ext}`.
///
/// The timestamp must parse, which keeps camera `side` from claiming the files
/// of camera `side_door`.
pub fn parse_chunk_index(camera: &str, file_name: &str) -> Option<u32> {
    let rest = file_name.strip_prefix(camera)?.strip_prefix('_')?;
    let (stem, ext) = rest.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    let (stamp, index) = stem.rsplit_once('_')?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    index.parse().ok()
}
