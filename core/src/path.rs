//! Maps a record type to the REST path segment under `<host>/<namespace>`.

use crate::model::ModelMeta;

/// Something the adapter can build a URL for.
#[derive(Debug, Clone, Copy)]
pub enum PathTarget<'a> {
    Model(&'a ModelMeta),
    /// The session-login pseudo-type.
    Login,
    PasswordReset,
}

/// Resolve the path segment for `target`.
///
/// User-kind models live at `users`, the login pseudo-type at `login`, and
/// everything else at `<classes_path>/<ClassName>`.
pub fn resolve_path(target: PathTarget<'_>, classes_path: &str) -> String {
    match target {
        PathTarget::Model(meta) if meta.is_user() => "users".to_string(),
        PathTarget::Login => "login".to_string(),
        PathTarget::PasswordReset => "requestPasswordReset".to_string(),
        PathTarget::Model(meta) => format!("{classes_path}/{}", meta.parse_class_name()),
    }
}
