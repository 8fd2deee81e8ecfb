//! Object key layout and content types.
//!
//! Renditions live under `videos/{id}/{format}/{file}`; uploaded sources
//! under `uploads/{id}/{id}{ext}`.

use vod_models::{StreamFormat, VideoId};

/// Longest filename accepted on the read path.
const MAX_FILENAME_LEN: usize = 255;

/// Prefix holding every rendition file of one format.
pub fn rendition_prefix(video_id: &VideoId, format: StreamFormat) -> String {
    format!("videos/{}/{}", video_id, format.as_str())
}

/// Key of one rendition file (playlist, segment or manifest).
pub fn rendition_key(video_id: &VideoId, format: StreamFormat, filename: &str) -> String {
    format!("{}/{}", rendition_prefix(video_id, format), filename)
}

/// Key of the top-level manifest for `format`.
pub fn master_manifest_key(video_id: &VideoId, format: StreamFormat) -> String {
    rendition_key(video_id, format, format.master_manifest_name())
}

/// Key for an uploaded source, keeping the client's extension.
pub fn upload_key(video_id: &VideoId, original_filename: &str) -> String {
    let ext = original_filename
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default();
    format!("uploads/{}/{}{}", video_id, video_id, ext)
}

/// Stream cache key for an object, namespaced by format.
pub fn cache_key(format: StreamFormat, object_key: &str) -> String {
    format!("{}:{}", format.as_str(), object_key)
}

/// Response content type derived from a file extension.
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "m3u8" => "application/x-mpegURL",
        "ts" => "video/MP2T",
        "mp4" | "m4s" => "video/mp4",
        "mpd" => "application/dash+xml",
        _ => "application/octet-stream",
    }
}

/// Whether `name` is a single safe path component.
pub fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FILENAME_LEN
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
