//! String-URI helpers. The engine is agnostic to the store's scheme beyond
//! telling local paths apart from remote objects.

/// URI prefixes that designate a remote object rather than a local path.
pub const REMOTE_PREFIXES: [&str; 4] = ["http://", "https://", "s3://", "gs://"];

/// Marker splitting a nested-instance URI into its enclosing tar and member.
const TAR_MARKER: &str = ".tar://";

pub fn is_remote(uri: &str) -> bool {
    REMOTE_PREFIXES.iter().any(|p| uri.starts_with(p))
}

/// Splits `<outer>.tar://<member>` into `(<outer>.tar, <member>)`.
pub fn split_tar_uri(uri: &str) -> Option<(&str, &str)> {
    let at = uri.find(TAR_MARKER)?;
    let outer_end = at + ".tar".len();
    Some((&uri[..outer_end], &uri[at + TAR_MARKER.len()..]))
}

pub fn is_nested(uri: &str) -> bool {
    split_tar_uri(uri).is_some()
}

/// Joins URI segments with single slashes, preserving the scheme separator.
pub fn join(base: &str, segments: &[&str]) -> String {
    let mut out = base.trim_end_matches('/').to_string();
    for segment in segments {
        out.push('/');
        out.push_str(segment.trim_matches('/'));
    }
    out
}
