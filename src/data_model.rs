use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name prefix shared by every per-user cache bucket.
pub const CACHE_BUCKET_PREFIX: &str = "downloadable-";

/// Root under which every group's files live in the source bucket.
pub const GROUPS_ROOT: &str = "groups";

pub const ARCHIVE_EXTENSION: &str = ".zip";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Name of the archive this job publishes into the user's cache bucket.
    pub fn archive_name(&self) -> String {
        format!("{}{}", self.0, ARCHIVE_EXTENSION)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Completed,
    Failed { error: String },
}

impl JobStatus {
    /// Finished jobs are reaped by the first poll that observes them.
    pub fn is_finished(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSpecifier {
    /// A single object, addressed by its suffix.
    Exact(String),
    /// Everything below a directory, requested with a trailing `/`.
    Directory(String),
}

impl FileSpecifier {
    pub fn parse(raw: &str) -> Self {
        if raw.ends_with('/') {
            FileSpecifier::Directory(raw.to_string())
        } else {
            FileSpecifier::Exact(raw.to_string())
        }
    }

    pub fn suffix(&self) -> &str {
        match self {
            FileSpecifier::Exact(s) | FileSpecifier::Directory(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ZipRequest {
    pub user_id: String,
    pub files: Vec<FileSpecifier>,
    pub group_name: String,
    pub path_prefix: Option<String>,
}

pub fn cache_bucket_name(user_id: &str) -> String {
    format!("{}{}", CACHE_BUCKET_PREFIX, user_id)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_job_ids_are_unique() {
        let ids: HashSet<JobId> = (0..1000).map(|_| JobId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_archive_name() {
        let id = JobId::new();
        assert_eq!(id.archive_name(), format!("{}.zip", id));
    }

    #[test]
    fn test_file_specifier_parse() {
        assert_eq!(
            FileSpecifier::parse("dir/"),
            FileSpecifier::Directory("dir/".to_string())
        );
        assert_eq!(
            FileSpecifier::parse("a.txt"),
            FileSpecifier::Exact("a.txt".to_string())
        );
    }

    #[test]
    fn test_cache_bucket_name() {
        assert_eq!(cache_bucket_name("u1"), "downloadable-u1");
    }
}
