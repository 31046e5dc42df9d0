// HTML -> markdown transform via spider_transformations Readability.

use spider_transformations::transformation::content::{
    transform_content_input, ReturnFormat, TransformConfig, TransformInput,
};

/// Convert raw HTML bytes into clean markdown using Readability extraction.
pub fn html_to_markdown(html: &[u8], url: Option<&str>) -> String {
    let parsed_url = url.and_then(|u| url::Url::parse(u).ok());
    let config = TransformConfig {
        readability: true,
        main_content: true,
        return_format: ReturnFormat::Markdown,
        filter_images: true,
        filter_svg: true,
        clean_html: true,
    };
    let input = TransformInput {
        url: parsed_url.as_ref(),
        content: html,
        screenshot_bytes: None,
        encoding: None,
        selector_config: None,
        ignore_tags: None,
    };

    transform_content_input(input, &config)
}

/// Produce cleaned markdown for a fetched body, if its content type has a
/// useful text rendition. HTML goes through Readability; plain text passes
/// through; binary formats yield None and are archived raw-only.
pub fn extract_markdown(bytes: &[u8], content_type: Option<&str>, url: &str) -> Option<String> {
    let ct = content_type.unwrap_or("").to_lowercase();
    if ct.contains("text/html") || ct.contains("application/xhtml") || looks_like_html(bytes) {
        return Some(html_to_markdown(bytes, Some(url)));
    }
    if ct.starts_with("text/") {
        return Some(String::from_utf8_lossy(bytes).into_owned());
    }
    None
}

fn looks_like_html(bytes: &[u8]) -> bool {
    let preview = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_lowercase();
    preview.contains("<html") || preview.contains("<!doctype html")
}
