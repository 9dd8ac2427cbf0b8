//! DOM extraction: title, plain-text content, image references, and
//! same-host page links.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::Extraction;

/// Content-container selectors tried in order before falling back to a
/// whole-document extraction.
const CONTENT_SELECTORS: &[&str] = &["main", "article", r#"[role="main"]"#, ".content"];

/// `url(...)` values inside inline `background-image` styles.
static BACKGROUND_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"background(?:-image)?\s*:[^;]*url\(\s*['"]?([^'")]+)['"]?\s*\)"#)
        .expect("background-image regex")
});

/// Detect a login wall: a password input, or a configured marker phrase
/// anywhere in the page text.
pub fn is_login_wall(doc: &Html, markers: &[String]) -> bool {
    let password_sel = Selector::parse(r#"input[type="password"]"#).unwrap();
    if doc.select(&password_sel).next().is_some() {
        return true;
    }

    let text = doc.root_element().text().collect::<String>().to_lowercase();
    markers
        .iter()
        .any(|marker| text.contains(&marker.to_lowercase()))
}

/// Extract everything docsink needs from a parsed page.
pub fn extract_document(doc: &Html, final_url: &Url, max_content_len: usize) -> Extraction {
    Extraction {
        final_url: final_url.clone(),
        title: extract_title(doc, final_url),
        content: extract_content(doc, max_content_len),
        image_refs: extract_image_refs(doc, final_url),
        page_links: extract_page_links(doc, final_url),
    }
}

/// Title from the first `<h1>`, then `<title>`, then the URL path.
fn extract_title(doc: &Html, url: &Url) -> String {
    for sel_str in ["h1", "title"] {
        let sel = Selector::parse(sel_str).unwrap();
        if let Some(el) = doc.select(&sel).next() {
            let text = collapse_whitespace(&el.text().collect::<String>());
            if !text.is_empty() {
                return text;
            }
        }
    }

    url.path_segments()
        .and_then(|mut segments| segments.next_back().map(str::to_string))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| url.host_str().unwrap_or("untitled").to_string())
}

/// Plain-text content. Prefers a primary content container; falls back to
/// the whole document with chrome stripped, truncated to `max_content_len`.
fn extract_content(doc: &Html, max_content_len: usize) -> Option<String> {
    for sel_str in CONTENT_SELECTORS {
        let sel = Selector::parse(sel_str).unwrap();
        if let Some(el) = doc.select(&sel).next() {
            let text = collapse_whitespace(&el.text().collect::<String>());
            if !text.is_empty() {
                return Some(text);
            }
        }
    }

    // Whole-document fallback: strip nav/header/footer/script/style/aside
    // and bound the length.
    let body_sel = Selector::parse("body").unwrap();
    let body = doc.select(&body_sel).next()?;
    let stripped = strip_chrome(&body.inner_html());
    let fragment = Html::parse_fragment(&stripped);
    let text = collapse_whitespace(&fragment.root_element().text().collect::<String>());
    if text.is_empty() {
        None
    } else {
        Some(truncate_chars(&text, max_content_len))
    }
}

/// Remove navigation/chrome elements from an HTML fragment.
fn strip_chrome(html: &str) -> String {
    let doc = Html::parse_fragment(html);
    let chrome_sel =
        Selector::parse("nav, header, footer, aside, script, style, .sidebar, .nav").unwrap();

    let mut result = html.to_string();
    for el in doc.select(&chrome_sel) {
        let outer = el.html();
        result = result.replace(&outer, "");
    }
    result
}

/// Image references: `<img src>` plus inline `background-image` URLs,
/// resolved absolute against the page URL.
fn extract_image_refs(doc: &Html, base_url: &Url) -> Vec<Url> {
    let mut refs = Vec::new();
    let mut seen = HashSet::new();

    let img_sel = Selector::parse("img[src]").unwrap();
    for el in doc.select(&img_sel) {
        if let Some(src) = el.value().attr("src") {
            push_resolved(src, base_url, &mut refs, &mut seen);
        }
    }

    let style_sel = Selector::parse(r#"[style*="background"]"#).unwrap();
    for el in doc.select(&style_sel) {
        let Some(style) = el.value().attr("style") else {
            continue;
        };
        for capture in BACKGROUND_URL_RE.captures_iter(style) {
            push_resolved(&capture[1], base_url, &mut refs, &mut seen);
        }
    }

    refs
}

fn push_resolved(raw: &str, base_url: &Url, out: &mut Vec<Url>, seen: &mut HashSet<String>) {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with("data:") {
        return;
    }
    if let Ok(resolved) = base_url.join(trimmed) {
        if matches!(resolved.scheme(), "http" | "https") && seen.insert(resolved.to_string()) {
            out.push(resolved);
        }
    }
}

/// Same-host page links with fragments stripped. Anchor-only, mailto,
/// tel, and javascript links are excluded.
fn extract_page_links(doc: &Html, base_url: &Url) -> Vec<Url> {
    let link_sel = Selector::parse("a[href]").unwrap();
    let mut links = Vec::new();
    let mut seen = HashSet::new();

    for el in doc.select(&link_sel) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let lower = href.trim().to_ascii_lowercase();
        if lower.is_empty()
            || lower.starts_with('#')
            || lower.starts_with("javascript:")
            || lower.starts_with("mailto:")
            || lower.starts_with("tel:")
        {
            continue;
        }

        let Ok(mut resolved) = base_url.join(href) else {
            continue;
        };
        resolved.set_fragment(None);

        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        if resolved.host_str() != base_url.host_str() {
            continue;
        }
        if seen.insert(resolved.to_string()) {
            links.push(resolved);
        }
    }

    links
}

/// Collapse runs of whitespace into single spaces and trim.
fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to at most `max` characters, respecting char boundaries.
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(html: &str) -> Html {
        Html::parse_document(html)
    }

    #[test]
    fn title_prefers_h1() {
        let doc = parse("<html><head><title>Doc Title</title></head><body><h1>Heading</h1></body></html>");
        let url = Url::parse("https://docs.example.com/guide").unwrap();
        assert_eq!(extract_title(&doc, &url), "Heading");
    }

    #[test]
    fn title_falls_back_to_title_tag_then_path() {
        let doc = parse("<html><head><title>Doc Title</title></head><body></body></html>");
        let url = Url::parse("https://docs.example.com/guide/intro").unwrap();
        assert_eq!(extract_title(&doc, &url), "Doc Title");

        let bare = parse("<html><body></body></html>");
        assert_eq!(extract_title(&bare, &url), "intro");
    }

    #[test]
    fn content_prefers_main_container() {
        let doc = parse(
            "<html><body><nav>Navigation</nav><main><p>Real   content\nhere.</p></main></body></html>",
        );
        let content = extract_content(&doc, 1000).expect("content");
        assert_eq!(content, "Real content here.");
        assert!(!content.contains("Navigation"));
    }

    #[test]
    fn content_fallback_strips_chrome_and_truncates() {
        let doc = parse(
            "<html><body><nav>Menu</nav><header>Header</header><div>Body text goes here and continues</div><footer>Footer</footer></body></html>",
        );
        let content = extract_content(&doc, 14).expect("content");
        assert_eq!(content, "Body text goes");
    }

    #[test]
    fn image_refs_include_img_and_background() {
        let html = r#"<html><body>
            <img src="/images/a.png" />
            <img src="https://cdn.example.com/b.jpg?sig=xyz" />
            <div style="background-image: url('/images/hero.webp')">x</div>
            <img src="data:image/png;base64,AAAA" />
        </body></html>"#;
        let doc = parse(html);
        let base = Url::parse("https://docs.example.com/guide").unwrap();
        let refs = extract_image_refs(&doc, &base);

        let as_strings: Vec<String> = refs.iter().map(|u| u.to_string()).collect();
        assert!(as_strings.contains(&"https://docs.example.com/images/a.png".to_string()));
        assert!(as_strings.contains(&"https://cdn.example.com/b.jpg?sig=xyz".to_string()));
        assert!(as_strings.contains(&"https://docs.example.com/images/hero.webp".to_string()));
        assert_eq!(refs.len(), 3, "data: URI must be excluded");
    }

    #[test]
    fn page_links_same_host_only() {
        let html = r##"<html><body>
            <a href="/guide/intro">Intro</a>
            <a href="/guide/intro#section">Intro anchor</a>
            <a href="https://other.example.com/page">External</a>
            <a href="#top">Top</a>
            <a href="mailto:docs@example.com">Mail</a>
            <a href="tel:+15551234">Call</a>
        </body></html>"##;
        let doc = parse(html);
        let base = Url::parse("https://docs.example.com/guide").unwrap();
        let links = extract_page_links(&doc, &base);

        assert_eq!(links.len(), 1);
        assert_eq!(links[0].as_str(), "https://docs.example.com/guide/intro");
    }

    #[test]
    fn login_wall_detection() {
        let markers = vec!["log in to continue".to_string()];

        let wall = parse(r#"<html><body><form><input type="password" /></form></body></html>"#);
        assert!(is_login_wall(&wall, &markers));

        let marker_wall = parse("<html><body><p>Please Log In To Continue reading.</p></body></html>");
        assert!(is_login_wall(&marker_wall, &markers));

        let normal = parse("<html><body><main>Just documentation.</main></body></html>");
        assert!(!is_login_wall(&normal, &markers));
    }
}
