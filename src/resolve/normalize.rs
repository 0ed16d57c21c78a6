//! Share-link normalization.
//!
//! Share links from drive-style and dropbox-style hosts point at an HTML
//! preview page. These helpers rewrite them to the form that serves the raw
//! file. Anything unrecognized is returned untouched.

use url::Url;

pub const DRIVE_HOSTS: &[&str] = &["drive.google.com", "docs.google.com"];
const DROPBOX_HOSTS: &[&str] = &["dropbox.com", "www.dropbox.com"];

/// Rewrite a share link to its direct-content form. Idempotent.
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut url = match Url::parse(trimmed) {
        Ok(u) => u,
        Err(_) => return trimmed.to_string(),
    };

    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();

    if DRIVE_HOSTS.contains(&host.as_str()) {
        if let Some(id) = drive_path_id(&url) {
            return format!("https://drive.google.com/uc?export=download&id={}", id);
        }
        return trimmed.to_string();
    }

    if DROPBOX_HOSTS.contains(&host.as_str()) {
        let has_dl0 = url.query_pairs().any(|(k, v)| k == "dl" && v == "0");
        if has_dl0 {
            let pairs: Vec<(String, String)> = url
                .query_pairs()
                .map(|(k, v)| {
                    if k == "dl" {
                        (k.into_owned(), "1".to_string())
                    } else {
                        (k.into_owned(), v.into_owned())
                    }
                })
                .collect();
            url.query_pairs_mut().clear().extend_pairs(pairs);
            return url.to_string();
        }
    }

    trimmed.to_string()
}

/// Whether the URL belongs to one of `hosts`, the hosts that serve an
/// interstitial page instead of raw bytes even in their direct form.
pub fn is_interstitial_host(url: &Url, hosts: &[String]) -> bool {
    url.host_str()
        .map(|h| hosts.iter().any(|known| known.eq_ignore_ascii_case(h)))
        .unwrap_or(false)
}

/// Extract the file id from a drive-style URL, either from a `/d/<id>/`
/// path segment or an `id=` query parameter.
pub fn drive_file_id(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    if let Some(id) = drive_path_id(&url) {
        return Some(id);
    }
    url.query_pairs()
        .find(|(k, _)| k == "id")
        .map(|(_, v)| v.into_owned())
        .filter(|id| is_valid_id(id))
}

fn drive_path_id(url: &Url) -> Option<String> {
    let segments: Vec<&str> = url.path_segments()?.collect();
    segments
        .windows(2)
        .find(|w| w[0] == "d")
        .map(|w| w[1].to_string())
        .filter(|id| is_valid_id(id))
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
