use std::path::PathBuf;

use url::Url;

/// Output file name derived from the playlist URL: the last path segment
/// with its extension replaced by `.ts`.
pub fn default_output(url: &str) -> PathBuf {
    let stem = Url::parse(url)
        .ok()
        .and_then(|url| {
            url.path_segments()?
                .rev()
                .find(|segment| !segment.is_empty())
                .map(|name| name.rsplit_once('.').map_or(name, |(stem, _)| stem).to_string())
        })
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "download".to_string());

    let sanitized: String = stem
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    PathBuf::from(format!("{sanitized}.ts"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_follows_playlist_name() {
        assert_eq!(
            default_output("https://cdn.example.com/live/stream_720.m3u8?token=abc"),
            PathBuf::from("stream_720.ts")
        );
        assert_eq!(
            default_output("https://cdn.example.com/vod/show/"),
            PathBuf::from("show.ts")
        );
    }

    #[test]
    fn unusable_urls_fall_back_to_download() {
        assert_eq!(
            default_output("https://cdn.example.com/"),
            PathBuf::from("download.ts")
        );
        assert_eq!(default_output("not a url"), PathBuf::from("download.ts"));
        assert_eq!(
            default_output("https://cdn.example.com/.m3u8"),
            PathBuf::from("download.ts")
        );
    }
}
