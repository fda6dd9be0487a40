/// Re-roots a browser path before it is sent to endpoints that expect
/// account-relative paths.
///
/// The admin account sees every home directory, so only the first segment is
/// dropped. Other accounts see `<share>/<user>/...` and lose the first two
/// segments when a third one exists.
pub fn strip_account_prefix(path: &str, is_admin: bool) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    let skip = match parts.len() {
        0 | 1 => 0,
        2 => 1,
        _ if is_admin => 1,
        _ => 2,
    };
    parts[skip..].join("/")
}
