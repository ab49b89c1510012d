//! Built-in markup engine for html/css/js previews.
//!
//! Tokenizes the html fragment just enough to check its structure and to
//! rewrite resource-loading attributes. Clean markup passes through
//! byte-for-byte; nothing is executed.

use std::borrow::Cow;

use super::{MarkupEngine, RenderContext, RenderedMarkup, UrlVerdict};
use crate::artifact::NO_HTML_SNIPPET;
use crate::error::RenderError;
use crate::request::PreviewRequest;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

/// Elements whose content is not markup; it runs until the matching end tag.
const RAW_TEXT_ELEMENTS: &[&str] = &[
    "script", "style", "textarea", "title", "xmp", "iframe", "noembed", "noframes",
];

/// Attributes holding a single URL the browser may fetch or navigate to.
const URL_ATTRIBUTES: &[&str] = &[
    "src", "href", "xlink:href", "action", "formaction", "poster", "data", "background",
];

/// Attributes holding a comma-separated candidate list.
const SRCSET_ATTRIBUTES: &[&str] = &["srcset", "imagesrcset"];

/// The default engine: structural check + URL policy + document assembly.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlEngine;

impl MarkupEngine for HtmlEngine {
    fn render(
        &self,
        request: &PreviewRequest,
        ctx: &mut RenderContext,
    ) -> Result<RenderedMarkup, RenderError> {
        if let Some(css) = request.css() {
            if contains_ignore_ascii_case(css, "</style") {
                return Err(RenderError::failed("css contains a closing </style> tag"));
            }
        }
        if let Some(js) = request.js() {
            if contains_ignore_ascii_case(js, "</script") {
                return Err(RenderError::failed("js contains a closing </script> tag"));
            }
        }

        let snippet = match request.html() {
            Some(html) => rewrite_fragment(html, ctx)?,
            None => {
                let mut snippet = String::new();
                ctx.emit(&mut snippet, NO_HTML_SNIPPET)?;
                snippet
            }
        };
        let document = build_document(&snippet, request.css(), request.js(), ctx)?;

        Ok(RenderedMarkup { snippet, document })
    }
}

struct Attr<'a> {
    name: String,
    value: Option<&'a str>,
    raw: &'a str,
}

struct StartTag<'a> {
    name: String,
    raw_name: &'a str,
    attrs: Vec<Attr<'a>>,
    self_closing: bool,
    end: usize,
}

fn rewrite_fragment(html: &str, ctx: &mut RenderContext) -> Result<String, RenderError> {
    let mut out = String::new();
    let mut stack: Vec<String> = Vec::new();
    let mut pos = 0;

    while pos < html.len() {
        ctx.checkpoint()?;

        let Some(rel) = html[pos..].find('<') else {
            ctx.emit(&mut out, &html[pos..])?;
            break;
        };
        let lt = pos + rel;
        if lt > pos {
            ctx.emit(&mut out, &html[pos..lt])?;
        }

        let rest = html[lt..].as_bytes();
        pos = match rest.get(1).copied() {
            Some(b'!') if html[lt..].starts_with("<!--") => {
                let end = find_from(html, lt + 4, "-->")
                    .ok_or_else(|| RenderError::failed("unterminated comment"))?
                    + 3;
                ctx.emit(&mut out, &html[lt..end])?;
                end
            }
            Some(b'!' | b'?') => {
                let end = find_from(html, lt, ">")
                    .ok_or_else(|| RenderError::failed("unterminated markup declaration"))?
                    + 1;
                ctx.emit(&mut out, &html[lt..end])?;
                end
            }
            Some(b'/') if rest.get(2).is_some_and(u8::is_ascii_alphabetic) => {
                let (name, end) = parse_end_tag(html, lt)?;
                close_element(&mut stack, &name, ctx)?;
                ctx.emit(&mut out, &html[lt..end])?;
                end
            }
            Some(c) if c.is_ascii_alphabetic() => {
                let tag = parse_start_tag(html, lt)?;
                let rendered = rewrite_start_tag(&html[lt..tag.end], &tag, ctx);
                ctx.emit(&mut out, &rendered)?;

                let mut next = tag.end;
                if !tag.self_closing && !VOID_ELEMENTS.contains(&tag.name.as_str()) {
                    ctx.reserve(tag.name.len())?;
                    stack.push(tag.name.clone());
                    ctx.check_depth(stack.len())?;

                    if RAW_TEXT_ELEMENTS.contains(&tag.name.as_str()) {
                        let close = find_end_tag(html, next, &tag.name).ok_or_else(|| {
                            RenderError::failed(format!("unterminated <{}> element", tag.name))
                        })?;
                        ctx.emit(&mut out, &html[next..close])?;
                        next = close;
                    }
                }
                next
            }
            // A lone '<' is text
            _ => {
                ctx.emit(&mut out, "<")?;
                lt + 1
            }
        };
    }

    if !stack.is_empty() {
        ctx.warn(format!("auto-closed unclosed element(s): {}", stack.join(", ")));
    }
    Ok(out)
}

fn close_element(
    stack: &mut Vec<String>,
    name: &str,
    ctx: &mut RenderContext,
) -> Result<(), RenderError> {
    if VOID_ELEMENTS.contains(&name) {
        return Ok(());
    }
    let idx = stack
        .iter()
        .rposition(|open| open == name)
        .ok_or_else(|| RenderError::failed(format!("stray end tag </{name}>")))?;

    let closed: Vec<String> = stack.drain(idx..).collect();
    for element in &closed {
        ctx.release(element.len());
    }
    if closed.len() > 1 {
        ctx.warn(format!("</{name}> implicitly closed {}", closed[1..].join(", ")));
    }
    Ok(())
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b':' | b'_' | b'.')
}

fn parse_end_tag(html: &str, lt: usize) -> Result<(String, usize), RenderError> {
    let bytes = html.as_bytes();
    let start = lt + 2;
    let mut i = start;
    while i < bytes.len() && is_name_byte(bytes[i]) {
        i += 1;
    }
    let name = html[start..i].to_ascii_lowercase();
    let end = find_from(html, i, ">")
        .ok_or_else(|| RenderError::failed(format!("unterminated end tag </{name}")))?;
    Ok((name, end + 1))
}

fn parse_start_tag(html: &str, lt: usize) -> Result<StartTag<'_>, RenderError> {
    let bytes = html.as_bytes();
    let len = bytes.len();
    let name_start = lt + 1;
    let mut i = name_start;
    while i < len && is_name_byte(bytes[i]) {
        i += 1;
    }
    let raw_name = &html[name_start..i];
    let name = raw_name.to_ascii_lowercase();
    let unterminated = || RenderError::failed(format!("unterminated <{}> tag", raw_name));

    let mut attrs = Vec::new();
    loop {
        while i < len && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= len {
            return Err(unterminated());
        }
        match bytes[i] {
            b'>' => {
                return Ok(StartTag {
                    name,
                    raw_name,
                    attrs,
                    self_closing: false,
                    end: i + 1,
                });
            }
            b'/' if bytes.get(i + 1) == Some(&b'>') => {
                return Ok(StartTag {
                    name,
                    raw_name,
                    attrs,
                    self_closing: true,
                    end: i + 2,
                });
            }
            b'/' => i += 1,
            _ => {
                let attr_start = i;
                while i < len
                    && !bytes[i].is_ascii_whitespace()
                    && !matches!(bytes[i], b'=' | b'>' | b'/')
                {
                    i += 1;
                }
                if i == attr_start {
                    // Leading '=' belongs to the name
                    i += 1;
                }
                let attr_name = html[attr_start..i].to_ascii_lowercase();

                let mut j = i;
                while j < len && bytes[j].is_ascii_whitespace() {
                    j += 1;
                }
                let mut value = None;
                if j < len && bytes[j] == b'=' {
                    j += 1;
                    while j < len && bytes[j].is_ascii_whitespace() {
                        j += 1;
                    }
                    if j >= len {
                        return Err(unterminated());
                    }
                    match bytes[j] {
                        quote @ (b'"' | b'\'') => {
                            let close = find_from(html, j + 1, if quote == b'"' { "\"" } else { "'" })
                                .ok_or_else(|| {
                                    RenderError::failed(format!(
                                        "unterminated value for attribute `{attr_name}`"
                                    ))
                                })?;
                            value = Some(&html[j + 1..close]);
                            i = close + 1;
                        }
                        _ => {
                            let value_start = j;
                            while j < len && !bytes[j].is_ascii_whitespace() && bytes[j] != b'>' {
                                j += 1;
                            }
                            value = Some(&html[value_start..j]);
                            i = j;
                        }
                    }
                }

                attrs.push(Attr {
                    name: attr_name,
                    value,
                    raw: &html[attr_start..i],
                });
            }
        }
    }
}

fn rewrite_start_tag<'a>(raw: &'a str, tag: &StartTag<'_>, ctx: &mut RenderContext) -> Cow<'a, str> {
    let is_meta_refresh = tag.name == "meta"
        && tag.attrs.iter().any(|a| {
            a.name == "http-equiv" && a.value.is_some_and(|v| v.trim().eq_ignore_ascii_case("refresh"))
        });

    let shared: &RenderContext = ctx;
    let verdicts: Vec<UrlVerdict> = tag
        .attrs
        .iter()
        .map(|attr| {
            if is_meta_refresh && attr.name == "content" {
                return UrlVerdict::Block("meta refresh".to_string());
            }
            judge_attr(shared, attr)
        })
        .collect();

    if verdicts.iter().all(|v| *v == UrlVerdict::Keep) {
        return Cow::Borrowed(raw);
    }

    let mut rebuilt = format!("<{}", tag.raw_name);
    for (attr, verdict) in tag.attrs.iter().zip(verdicts) {
        rebuilt.push(' ');
        match verdict {
            UrlVerdict::Keep => rebuilt.push_str(attr.raw),
            UrlVerdict::Block(reason) => {
                let value = decode_entities(attr.value.unwrap_or_default());
                ctx.warn(format!(
                    "blocked {}=\"{}\" on <{}>: {}",
                    attr.name, value, tag.name, reason
                ));
                rebuilt.push_str(&format!(
                    "data-blocked-{}=\"{}\"",
                    attr.name.replace(':', "-"),
                    escape_attr(&value)
                ));
            }
        }
    }
    rebuilt.push_str(if tag.self_closing { "/>" } else { ">" });
    Cow::Owned(rebuilt)
}

fn judge_attr(ctx: &RenderContext, attr: &Attr<'_>) -> UrlVerdict {
    let Some(value) = attr.value else {
        return UrlVerdict::Keep;
    };
    let decoded = decode_entities(value);
    let name = attr.name.as_str();

    if URL_ATTRIBUTES.contains(&name) {
        ctx.policy().check(&decoded)
    } else if SRCSET_ATTRIBUTES.contains(&name) {
        ctx.policy().check_srcset(&decoded)
    } else if name == "srcdoc" {
        // A whole document that would load outside this policy
        UrlVerdict::Block("inline frame documents are not allowed".to_string())
    } else if name == "ping" {
        decoded
            .split_whitespace()
            .map(|url| ctx.policy().check(url))
            .find(|v| *v != UrlVerdict::Keep)
            .unwrap_or(UrlVerdict::Keep)
    } else {
        UrlVerdict::Keep
    }
}

fn build_document(
    snippet: &str,
    css: Option<&str>,
    js: Option<&str>,
    ctx: &mut RenderContext,
) -> Result<String, RenderError> {
    let csp = escape_attr(&ctx.policy().content_security_policy()).into_owned();
    let mut doc = String::new();

    ctx.emit(&mut doc, "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n")?;
    ctx.emit(
        &mut doc,
        &format!("<meta http-equiv=\"Content-Security-Policy\" content=\"{csp}\">\n"),
    )?;
    if let Some(css) = css {
        ctx.emit(&mut doc, "<style>\n")?;
        ctx.emit(&mut doc, css)?;
        ctx.emit(&mut doc, "\n</style>\n")?;
    }
    ctx.emit(&mut doc, "</head>\n<body>\n")?;
    ctx.emit(&mut doc, snippet)?;
    ctx.emit(&mut doc, "\n")?;
    if let Some(js) = js {
        ctx.emit(&mut doc, "<script>\n")?;
        ctx.emit(&mut doc, js)?;
        ctx.emit(&mut doc, "\n</script>\n")?;
    }
    ctx.emit(&mut doc, "</body>\n</html>\n")?;
    Ok(doc)
}

fn find_from(haystack: &str, from: usize, needle: &str) -> Option<usize> {
    haystack[from..].find(needle).map(|i| i + from)
}

/// Find `</name` (any case) followed by whitespace, `/`, `>` or end of input.
fn find_end_tag(html: &str, from: usize, name: &str) -> Option<usize> {
    let needle = format!("</{name}");
    let hay = html.as_bytes();
    let n = needle.len();
    let mut i = from;
    while i + n <= hay.len() {
        if hay[i..i + n].eq_ignore_ascii_case(needle.as_bytes()) {
            match hay.get(i + n) {
                None | Some(b'>' | b'/') => return Some(i),
                Some(c) if c.is_ascii_whitespace() => return Some(i),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn contains_ignore_ascii_case(haystack: &str, needle: &str) -> bool {
    haystack
        .as_bytes()
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle.as_bytes()))
}

/// Decode the character references browsers resolve inside attribute values.
fn decode_entities(value: &str) -> Cow<'_, str> {
    if !value.contains('&') {
        return Cow::Borrowed(value);
    }

    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];

        if let Some(numeric) = rest.strip_prefix("&#") {
            let (radix, digits_start) = match numeric.as_bytes().first() {
                Some(b'x' | b'X') => (16, 1),
                _ => (10, 0),
            };
            let digits: &str = &numeric[digits_start..];
            let len = digits
                .bytes()
                .take_while(|b| (*b as char).is_digit(radix))
                .count();
            if len > 0 {
                let decoded = u32::from_str_radix(&digits[..len], radix)
                    .ok()
                    .and_then(char::from_u32)
                    .unwrap_or('\u{fffd}');
                out.push(decoded);
                let mut consumed = 2 + digits_start + len;
                if rest[consumed..].starts_with(';') {
                    consumed += 1;
                }
                rest = &rest[consumed..];
                continue;
            }
        } else if let Some((entity, decoded)) = NAMED_ENTITIES
            .iter()
            .find(|(entity, _)| rest[1..].starts_with(entity))
        {
            out.push_str(decoded);
            rest = &rest[1 + entity.len()..];
            continue;
        }

        out.push('&');
        rest = &rest[1..];
    }
    out.push_str(rest);
    Cow::Owned(out)
}

const NAMED_ENTITIES: &[(&str, &str)] = &[
    ("amp;", "&"),
    ("lt;", "<"),
    ("gt;", ">"),
    ("quot;", "\""),
    ("apos;", "'"),
    ("colon;", ":"),
    ("Tab;", "\t"),
    ("NewLine;", "\n"),
    ("nbsp;", "\u{a0}"),
];

fn escape_attr(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '"', '<', '>']) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResourceLimit;
    use crate::sandbox::{ResourcePolicy, SandboxConfig, TerminationHandle};
    use crate::validate::{validate, ValidationLimits};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn render_with(
        code: Value,
        config: SandboxConfig,
    ) -> (Result<RenderedMarkup, RenderError>, Vec<String>) {
        let request = validate(&json!({ "code": code }), &ValidationLimits::default()).unwrap();
        let policy = Arc::new(ResourcePolicy::new(config.allowed_origins.clone()));
        let mut ctx = RenderContext::new(&config, policy, TerminationHandle::new());
        let result = HtmlEngine.render(&request, &mut ctx);
        (result, ctx.into_diagnostics().warnings)
    }

    fn render(html: &str) -> Result<RenderedMarkup, RenderError> {
        render_with(json!({ "html": html }), SandboxConfig::default()).0
    }

    fn snippet(html: &str) -> String {
        render(html).unwrap().snippet
    }

    #[test]
    fn test_clean_markup_passes_through() {
        for html in [
            "<b>hi</b>",
            "<div class=\"a\"><img src=\"x.png\" alt=\"\"><br/></div>",
            "<!DOCTYPE html><p>x</p><!-- note -->",
            "<ul><li>a<li>b</ul>",
            "a < b and c > d",
            "<svg><circle r='1'/></svg>",
            "<a href=\"#top\" onclick=\"go()\">top</a>",
        ] {
            assert_eq!(snippet(html), html);
        }
    }

    #[test]
    fn test_missing_html_placeholder() {
        let (result, _) = render_with(json!({ "css": "p {}" }), SandboxConfig::default());
        assert_eq!(result.unwrap().snippet, "No HTML provided");
    }

    #[test]
    fn test_raw_text_elements() {
        let html = "<script>if (a < b) { x = '</div>'.length }</script><style>p>b{}</style>";
        // '</div>' inside script is not an end tag
        assert_eq!(snippet(html), html);
        assert!(matches!(render("<script>let a = 1;"), Err(RenderError::RenderFailed(_))));
    }

    #[test]
    fn test_malformed_markup_fails() {
        for html in [
            "<b>hi</i>",
            "<div class=\"a",
            "<p>ok</p><!-- never closed",
            "<img src='x.png",
            "</span>",
            "<p>x</p",
        ] {
            assert!(
                matches!(render(html), Err(RenderError::RenderFailed(_))),
                "{html} should fail"
            );
        }
    }

    #[test]
    fn test_unclosed_elements_warn() {
        let (result, warnings) = render_with(json!({ "html": "<div><p>open" }), SandboxConfig::default());
        assert_eq!(result.unwrap().snippet, "<div><p>open");
        assert_eq!(warnings, vec!["auto-closed unclosed element(s): div, p".to_string()]);
    }

    #[test]
    fn test_nesting_depth_limit() {
        let config = SandboxConfig {
            max_depth: 3,
            ..Default::default()
        };
        let (ok, _) = render_with(json!({ "html": "<a><b><i>x</i></b></a>" }), config.clone());
        assert!(ok.is_ok());

        let (err, _) = render_with(json!({ "html": "<div><div><div><div>" }), config);
        assert_eq!(
            err.unwrap_err(),
            RenderError::ResourceExceeded(ResourceLimit::NestingDepth(3))
        );
    }

    #[test]
    fn test_blocks_external_resources() {
        let (result, warnings) = render_with(
            json!({ "html": "<img src=\"https://evil.com/x.png\" alt=\"x\">" }),
            SandboxConfig::default(),
        );
        assert_eq!(
            result.unwrap().snippet,
            "<img data-blocked-src=\"https://evil.com/x.png\" alt=\"x\">"
        );
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("https://evil.com"));

        for html in [
            "<img src=\"/\\evil.com/x.png\">",
            "<img src=\"\\\\evil.com/x.png\">",
            "<img src=\"/\t/evil.com/x.png\">",
        ] {
            let (result, warnings) = render_with(json!({ "html": html }), SandboxConfig::default());
            let rendered = result.unwrap().snippet;
            assert!(rendered.starts_with("<img data-blocked-src="), "{html:?} -> {rendered}");
            assert_eq!(warnings.len(), 1, "{html:?}");
        }

        let (result, warnings) = render_with(
            json!({ "html": "<iframe srcdoc=\"<img src=https://evil.com/x.png>\"></iframe>" }),
            SandboxConfig::default(),
        );
        let rendered = result.unwrap().snippet;
        assert!(rendered.starts_with("<iframe data-blocked-srcdoc="), "{rendered}");
        assert!(!rendered.contains(" srcdoc="));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_allowed_origin_is_kept() {
        let config = SandboxConfig {
            allowed_origins: vec!["https://cdn.example.com".to_string()],
            ..Default::default()
        };
        let html = "<script src=\"https://cdn.example.com/lib.js\"></script>";
        let (result, warnings) = render_with(json!({ "html": html }), config);
        let markup = result.unwrap();
        assert_eq!(markup.snippet, html);
        assert!(warnings.is_empty());
        assert!(markup.document.contains("script-src 'unsafe-inline' https://cdn.example.com"));
    }

    #[test]
    fn test_blocks_encoded_script_urls() {
        let rendered = snippet("<a href=\"java&#115;cript&colon;alert(1)\">x</a>");
        assert_eq!(
            rendered,
            "<a data-blocked-href=\"javascript:alert(1)\">x</a>"
        );
    }

    #[test]
    fn test_blocks_srcset_and_meta_refresh() {
        let rendered = snippet("<img srcset=\"a.png 1x, http://evil.com/b.png 2x\">");
        assert!(rendered.starts_with("<img data-blocked-srcset="));

        let rendered = snippet("<meta http-equiv=\"refresh\" content=\"0;url=/x\">");
        assert_eq!(
            rendered,
            "<meta http-equiv=\"refresh\" data-blocked-content=\"0;url=/x\">"
        );
    }

    #[test]
    fn test_container_escapes_fail() {
        let (css, _) = render_with(
            json!({ "html": "<p>x</p>", "css": "p{}</STYLE><script>x()</script>" }),
            SandboxConfig::default(),
        );
        assert!(matches!(css, Err(RenderError::RenderFailed(_))));

        let (js, _) = render_with(
            json!({ "html": "<p>x</p>", "js": "let s = '</script>';" }),
            SandboxConfig::default(),
        );
        assert!(matches!(js, Err(RenderError::RenderFailed(_))));
    }

    #[test]
    fn test_document_assembly() {
        let (result, _) = render_with(
            json!({ "html": "<p>x</p>", "css": "p { color: red }", "js": "console.log(1)" }),
            SandboxConfig::default(),
        );
        let doc = result.unwrap().document;
        assert!(doc.starts_with("<!DOCTYPE html>"));
        assert!(doc.contains("default-src 'none'"));
        assert!(doc.contains("connect-src 'none'"));
        assert!(doc.contains("<style>\np { color: red }\n</style>"));
        assert!(doc.contains("<body>\n<p>x</p>\n"));
        assert!(doc.contains("<script>\nconsole.log(1)\n</script>"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let code = json!({ "html": "<div><img src=\"//x.io/a\"><p>t", "css": "a{}" });
        let first = render_with(code.clone(), SandboxConfig::default());
        let second = render_with(code, SandboxConfig::default());
        assert_eq!(first.0.unwrap(), second.0.unwrap());
        assert_eq!(first.1, second.1);
    }

    #[test]
    fn test_terminated_render_stops() {
        let request = validate(&json!({"code": {"html": "<p>x</p>"}}), &ValidationLimits::default()).unwrap();
        let termination = TerminationHandle::new();
        termination.terminate();
        let mut ctx = RenderContext::new(
            &SandboxConfig::default(),
            Arc::new(ResourcePolicy::default()),
            termination,
        );
        assert!(matches!(
            HtmlEngine.render(&request, &mut ctx),
            Err(RenderError::ResourceExceeded(ResourceLimit::Timeout(_)))
        ));
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("a&amp;b"), "a&b");
        assert_eq!(decode_entities("&#x6A;&#97"), "ja");
        assert_eq!(decode_entities("&unknown; &"), "&unknown; &");
    }
}
