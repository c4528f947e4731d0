//! Rich-text body cleanup.
//!
//! Inline images in rich text reference org content as `sfdc://<id>`. Those
//! ids are meaningless in the target org, so each image tag is either
//! rewritten to the migrated content id or dropped.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Matches a whole image tag including an optional closing tag.
fn image_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<img\b[^>]*>(?:\s*</img>)?").unwrap())
}

/// Captures the content id of an `sfdc://` source attribute.
fn sfdc_source() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)src\s*=\s*["']sfdc://([A-Za-z0-9]{15,18})["']"#).unwrap()
    })
}

fn any_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").unwrap())
}

/// Result of rewriting one body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineRewrite {
    pub body: String,
    /// Source content id of the first image that was kept.
    pub first_mapped: Option<String>,
    /// Images removed because their content was not migrated.
    pub removed: usize,
}

/// Content ids referenced by inline images, in order of appearance.
pub fn referenced_content(body: &str) -> Vec<String> {
    image_tag()
        .find_iter(body)
        .filter_map(|tag| {
            sfdc_source()
                .captures(tag.as_str())
                .map(|c| c[1].to_string())
        })
        .collect()
}

/// Rewrite `sfdc://` image references through `content_ids` (source id to
/// target id). Unmapped images are removed; images pointing elsewhere are
/// left alone.
pub fn rewrite_inline_images(body: &str, content_ids: &HashMap<String, String>) -> InlineRewrite {
    let mut first_mapped = None;
    let mut removed = 0usize;

    let rewritten = image_tag().replace_all(body, |tag: &Captures| {
        let tag = &tag[0];
        let Some(source) = sfdc_source().captures(tag) else {
            return tag.to_string();
        };
        let source_id = &source[1];
        match content_ids.get(source_id) {
            Some(target_id) => {
                if first_mapped.is_none() {
                    first_mapped = Some(source_id.to_string());
                }
                tag.replacen(source_id, target_id, 1)
            }
            None => {
                removed += 1;
                String::new()
            }
        }
    });

    InlineRewrite {
        body: rewritten.into_owned(),
        first_mapped,
        removed,
    }
}

/// Reduce markup to plain text for fields that are not rich text.
pub fn strip_tags(body: &str) -> String {
    let text = any_tag().replace_all(body, "");
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}
