//! Pulls a video identifier out of whatever the user pasted.

use std::borrow::Cow;

use url::Url;

/// Returns the identifier contained in `raw`.
///
/// Absolute URLs yield their `v` query parameter, or the last path segment
/// when there is none (`https://youtu.be/<id>`). Anything else goes through a
/// couple of string heuristics. The function never fails; unrecognised input
/// comes back unchanged, and blank input comes back empty.
pub fn extract_video_id(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(id) = id_from_url(raw) {
        return id;
    }

    let mut value = raw;
    if let Some((_, after)) = value.rsplit_once("v=") {
        value = after;
    }
    if let Some((_, after)) = value.rsplit_once('/') {
        value = after;
    }
    value.to_string()
}

fn id_from_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    // `mailto:`-style URLs have no path segments; leave them to the heuristics.
    if url.cannot_be_a_base() {
        return None;
    }

    if let Some((_, id)) = url
        .query_pairs()
        .find(|(key, value)| key == "v" && !value.is_empty())
    {
        return Some(id.into_owned());
    }

    let path = urlencoding::decode(url.path()).unwrap_or(Cow::Borrowed(url.path()));
    let last = path.rsplit('/').next().unwrap_or("");
    Some(last.to_string())
}
