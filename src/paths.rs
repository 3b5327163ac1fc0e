use crate::data_model::{FileSpecifier, ObjectKey, GROUPS_ROOT};

/// A specifier resolved against a group and optional prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Key(ObjectKey),
    /// Directory prefix, always ending with `/`.
    Prefix(String),
}

fn trimmed(segment: &str) -> Option<&str> {
    let segment = segment.trim_matches('/');
    (!segment.is_empty()).then_some(segment)
}

/// Joins the non-empty segments `groups`, `group`, `prefix` and `suffix` with
/// a single `/`.
pub fn full_path(group: &str, prefix: Option<&str>, suffix: &str) -> String {
    [Some(GROUPS_ROOT), trimmed(group), prefix.and_then(trimmed), trimmed(suffix)]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join("/")
}

pub fn resolve(specifier: &FileSpecifier, group: &str, prefix: Option<&str>) -> Resolved {
    let path = full_path(group, prefix, specifier.suffix());
    match specifier {
        FileSpecifier::Exact(_) => Resolved::Key(ObjectKey::new(path)),
        FileSpecifier::Directory(_) => Resolved::Prefix(format!("{}/", path)),
    }
}
