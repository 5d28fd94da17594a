use std::collections::HashSet;

use regex::Regex;

use mls_types::PurgeAggressiveness;

/// Selectors the tree-shaker must never remove.
#[derive(Debug, Clone, Default)]
pub struct Safelist {
    pub exact: HashSet<String>,
    pub prefixes: Vec<String>,
}

impl Safelist {
    pub fn allows(&self, token: &str) -> bool {
        self.exact.contains(token) || self.prefixes.iter().any(|p| token.starts_with(p.as_str()))
    }
}

/// CSS tree-shaking and minification. The contract is pure text-in/text-out.
/// An unparseable rule is kept, never dropped.
pub trait CssProcessor: Send + Sync {
    fn purge(
        &self,
        css: &str,
        html_corpus: &[&str],
        safelist: &Safelist,
        aggressiveness: PurgeAggressiveness,
    ) -> String;

    fn minify(&self, css: &str) -> String;
}

pub struct BuiltinCssProcessor;

#[derive(Debug)]
enum CssItem {
    /// `selector-list { body }`
    Rule { selectors: String, body: String },
    /// `@media … { inner-items }` and friends; inner content purges recursively.
    NestedAtRule { prelude: String, inner: String },
    /// `@import ...;`, `@charset ...;` and `@font-face` blocks, kept verbatim.
    Passthrough(String),
}

fn strip_comments(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut chars = css.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '/' && chars.peek() == Some(&'*') {
            chars.next();
            while let Some(inner) = chars.next() {
                if inner == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    break;
                }
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Splits a stylesheet into top-level items by brace depth.
fn parse_items(css: &str) -> Vec<CssItem> {
    let mut items = Vec::new();
    let mut rest = css.trim_start();
    while !rest.is_empty() {
        if rest.starts_with('@') {
            // At-rule: either terminated by `;` or by a block.
            let semi = rest.find(';');
            let brace = rest.find('{');
            match (semi, brace) {
                (Some(s), Some(b)) if s < b => {
                    items.push(CssItem::Passthrough(rest[..=s].trim().to_string()));
                    rest = rest[s + 1..].trim_start();
                    continue;
                }
                (Some(s), None) => {
                    items.push(CssItem::Passthrough(rest[..=s].trim().to_string()));
                    rest = rest[s + 1..].trim_start();
                    continue;
                }
                (_, Some(b)) => {
                    let prelude = rest[..b].trim().to_string();
                    let (inner, remaining) = read_block(&rest[b..]);
                    let lowered = prelude.to_ascii_lowercase();
                    if lowered.starts_with("@media")
                        || lowered.starts_with("@supports")
                        || lowered.starts_with("@layer")
                    {
                        items.push(CssItem::NestedAtRule { prelude, inner });
                    } else {
                        items.push(CssItem::Passthrough(format!("{prelude}{{{inner}}}")));
                    }
                    rest = remaining.trim_start();
                    continue;
                }
                (None, None) => {
                    items.push(CssItem::Passthrough(rest.trim().to_string()));
                    break;
                }
            }
        }
        match rest.find('{') {
            Some(b) => {
                let selectors = rest[..b].trim().to_string();
                let (body, remaining) = read_block(&rest[b..]);
                items.push(CssItem::Rule { selectors, body });
                rest = remaining.trim_start();
            }
            None => break,
        }
    }
    items
}

/// `block` starts at `{`; returns (inner, rest-after-closing-brace).
fn read_block(block: &str) -> (String, &str) {
    let mut depth = 0usize;
    for (idx, ch) in block.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return (block[1..idx].to_string(), &block[idx + 1..]);
                }
            }
            _ => {}
        }
    }
    (block.trim_start_matches('{').to_string(), "")
}

struct UsedTokens {
    classes: HashSet<String>,
    ids: HashSet<String>,
    tags: HashSet<String>,
}

fn collect_used_tokens(html_corpus: &[&str]) -> UsedTokens {
    let class_attr = Regex::new(r#"class\s*=\s*["']([^"']*)["']"#).unwrap_or_else(|_| Regex::new("$^").unwrap());
    let id_attr = Regex::new(r#"id\s*=\s*["']([^"']*)["']"#).unwrap_or_else(|_| Regex::new("$^").unwrap());
    let tag = Regex::new(r"<([a-zA-Z][a-zA-Z0-9-]*)").unwrap_or_else(|_| Regex::new("$^").unwrap());

    let mut used = UsedTokens {
        classes: HashSet::new(),
        ids: HashSet::new(),
        tags: HashSet::new(),
    };
    for html in html_corpus {
        for caps in class_attr.captures_iter(html) {
            for class in caps[1].split_whitespace() {
                used.classes.insert(class.to_string());
            }
        }
        for caps in id_attr.captures_iter(html) {
            used.ids.insert(caps[1].trim().to_string());
        }
        for caps in tag.captures_iter(html) {
            used.tags.insert(caps[1].to_ascii_lowercase());
        }
    }
    used
}

/// Simple tokens of one compound selector: (`.class`, `#id`, `tag`).
fn selector_tokens(selector: &str) -> (Vec<String>, Vec<String>, Vec<String>) {
    let class_re = Regex::new(r"\.([A-Za-z0-9_-]+)").unwrap_or_else(|_| Regex::new("$^").unwrap());
    let id_re = Regex::new(r"#([A-Za-z0-9_-]+)").unwrap_or_else(|_| Regex::new("$^").unwrap());
    let tag_re = Regex::new(r"(?:^|[\s>+~])([a-zA-Z][a-zA-Z0-9-]*)")
        .unwrap_or_else(|_| Regex::new("$^").unwrap());
    let classes = class_re
        .captures_iter(selector)
        .map(|c| c[1].to_string())
        .collect();
    let ids = id_re
        .captures_iter(selector)
        .map(|c| c[1].to_string())
        .collect();
    let tags = tag_re
        .captures_iter(selector)
        .map(|c| c[1].to_ascii_lowercase())
        .filter(|t| t != "not" && t != "is" && t != "where")
        .collect();
    (classes, ids, tags)
}

fn selector_survives(
    selector: &str,
    used: &UsedTokens,
    safelist: &Safelist,
    aggressiveness: PurgeAggressiveness,
) -> bool {
    let (classes, ids, tags) = selector_tokens(selector);
    if classes.is_empty() && ids.is_empty() {
        // Element and universal selectors only go at the aggressive level.
        if aggressiveness == PurgeAggressiveness::Aggressive && !tags.is_empty() {
            return tags.iter().any(|t| used.tags.contains(t));
        }
        return true;
    }
    let class_known =
        |c: &String| used.classes.contains(c) || safelist.allows(c) || safelist.allows(&format!(".{c}"));
    let id_known =
        |i: &String| used.ids.contains(i) || safelist.allows(i) || safelist.allows(&format!("#{i}"));
    match aggressiveness {
        PurgeAggressiveness::Off => true,
        // Safe: survive if anything in the selector is known-used.
        PurgeAggressiveness::Safe => {
            classes.iter().any(class_known) || ids.iter().any(id_known) || classes.is_empty()
        }
        // Standard and up: every class and id must be accounted for.
        PurgeAggressiveness::Standard | PurgeAggressiveness::Aggressive => {
            classes.iter().all(class_known) && ids.iter().all(id_known)
        }
    }
}

fn purge_items(
    css: &str,
    used: &UsedTokens,
    safelist: &Safelist,
    aggressiveness: PurgeAggressiveness,
) -> String {
    let mut out = String::with_capacity(css.len());
    for item in parse_items(css) {
        match item {
            CssItem::Rule { selectors, body } => {
                let kept: Vec<&str> = selectors
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty() && selector_survives(s, used, safelist, aggressiveness))
                    .collect();
                if !kept.is_empty() {
                    out.push_str(&kept.join(","));
                    out.push('{');
                    out.push_str(body.trim());
                    out.push('}');
                }
            }
            CssItem::NestedAtRule { prelude, inner } => {
                let purged_inner = purge_items(&inner, used, safelist, aggressiveness);
                if !purged_inner.trim().is_empty() {
                    out.push_str(&prelude);
                    out.push('{');
                    out.push_str(&purged_inner);
                    out.push('}');
                }
            }
            CssItem::Passthrough(text) => {
                out.push_str(&text);
            }
        }
    }
    out
}

impl CssProcessor for BuiltinCssProcessor {
    fn purge(
        &self,
        css: &str,
        html_corpus: &[&str],
        safelist: &Safelist,
        aggressiveness: PurgeAggressiveness,
    ) -> String {
        if aggressiveness == PurgeAggressiveness::Off {
            return css.to_string();
        }
        let stripped = strip_comments(css);
        let used = collect_used_tokens(html_corpus);
        purge_items(&stripped, &used, safelist, aggressiveness)
    }

    fn minify(&self, css: &str) -> String {
        let stripped = strip_comments(css);
        let mut out = String::with_capacity(stripped.len());
        let mut last_space = false;
        let mut prev: Option<char> = None;
        for ch in stripped.chars() {
            if ch.is_whitespace() {
                last_space = true;
                continue;
            }
            if last_space {
                let needs_space = matches!(prev, Some(prev)
                    if !"{};:,>".contains(prev) && !"{};:,>".contains(ch));
                if needs_space {
                    out.push(' ');
                }
                last_space = false;
            }
            out.push(ch);
            prev = Some(ch);
        }
        out.replace(";}", "}")
    }
}
