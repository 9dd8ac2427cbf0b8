//! Image URL normalization.
//!
//! CDN and object-storage hosts serve the same asset under per-request
//! signed query strings. Stripping the query for recognized hosts gives a
//! stable dedup key; other hosts keep their query untouched since it may
//! select a distinct asset.

use url::Url;

use docsink_shared::config::ImagesConfig;

/// Host-recognition rules for query stripping.
#[derive(Debug, Clone, Default)]
pub struct HostRules {
    /// Host suffixes (`amazonaws.com`, `supabase.co`, ...).
    pub suffixes: Vec<String>,
    /// Host first-label prefixes (`cdn.`, `static.`, ...).
    pub prefixes: Vec<String>,
}

impl From<&ImagesConfig> for HostRules {
    fn from(config: &ImagesConfig) -> Self {
        Self {
            suffixes: config.strip_query_suffixes.clone(),
            prefixes: config.strip_query_prefixes.clone(),
        }
    }
}

impl HostRules {
    /// Whether `host` is a recognized CDN/object-storage host.
    fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.suffixes
            .iter()
            .any(|s| host == *s || host.ends_with(&format!(".{s}")))
            || self.prefixes.iter().any(|p| host.starts_with(p.as_str()))
    }
}

/// Produce the stable dedup key for an image URL.
///
/// Fragments are always dropped; the query string is dropped only for
/// recognized hosts.
pub fn normalize_image_url(url: &Url, rules: &HostRules) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    let strip = normalized
        .host_str()
        .map(|host| rules.matches(host))
        .unwrap_or(false);
    if strip {
        normalized.set_query(None);
    }

    normalized.to_string()
}

/// Lowercase file extension from the URL path, if any.
pub fn extension_of(url: &Url) -> Option<String> {
    let path = url.path();
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> HostRules {
        HostRules::from(&ImagesConfig::default())
    }

    #[test]
    fn strips_query_for_cdn_hosts() {
        let a = Url::parse("https://cdn.example.com/a.png?sig=abc123").unwrap();
        let b = Url::parse("https://cdn.example.com/a.png?sig=xyz999").unwrap();
        let key_a = normalize_image_url(&a, &rules());
        let key_b = normalize_image_url(&b, &rules());
        assert_eq!(key_a, key_b);
        assert_eq!(key_a, "https://cdn.example.com/a.png");
    }

    #[test]
    fn strips_query_for_storage_suffixes() {
        let url =
            Url::parse("https://bucket.s3.amazonaws.com/img.jpg?X-Amz-Signature=deadbeef").unwrap();
        assert_eq!(
            normalize_image_url(&url, &rules()),
            "https://bucket.s3.amazonaws.com/img.jpg"
        );
    }

    #[test]
    fn leaves_other_hosts_untouched() {
        let url = Url::parse("https://docs.example.com/image?id=42").unwrap();
        assert_eq!(
            normalize_image_url(&url, &rules()),
            "https://docs.example.com/image?id=42"
        );
    }

    #[test]
    fn always_drops_fragments() {
        let url = Url::parse("https://docs.example.com/a.png#frag").unwrap();
        assert_eq!(
            normalize_image_url(&url, &rules()),
            "https://docs.example.com/a.png"
        );
    }

    #[test]
    fn extension_extraction() {
        let url = Url::parse("https://cdn.example.com/path/logo.SVG?x=1").unwrap();
        assert_eq!(extension_of(&url).as_deref(), Some("svg"));

        let none = Url::parse("https://cdn.example.com/path/noext").unwrap();
        assert_eq!(extension_of(&none), None);
    }
}
