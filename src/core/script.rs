use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

pub type ScriptKey = u32;

/// Scripts of one document, ordered by key.
pub type Scripts = BTreeMap<ScriptKey, String>;

static HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Script #(\d+)").expect("valid script header pattern"));

/// Splits `text` on `Script #<digits>` headers. Each script runs until the
/// next header or the end of the text; an annotation token right after the
/// header is dropped. Empty scripts are skipped and a repeated key keeps the
/// last occurrence.
pub fn parse_scripts(text: &str, annotation_tokens: &[String]) -> Scripts {
    let headers: Vec<(ScriptKey, usize, usize)> = HEADER
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?.as_str().parse::<ScriptKey>().ok()?;
            Some((key, whole.start(), whole.end()))
        })
        .collect();

    let mut scripts = Scripts::new();
    for (i, (key, _, body_start)) in headers.iter().enumerate() {
        let body_end = headers
            .get(i + 1)
            .map(|(_, next_start, _)| *next_start)
            .unwrap_or(text.len());
        let body = strip_annotation(&text[*body_start..body_end], annotation_tokens);
        if body.is_empty() {
            log::debug!("Script #{} has no content, skipping", key);
            continue;
        }
        if scripts.insert(*key, body.to_string()).is_some() {
            log::warn!("Script #{} appears more than once, keeping the last one", key);
        }
    }
    scripts
}

fn strip_annotation<'a>(body: &'a str, annotation_tokens: &[String]) -> &'a str {
    let body = body.trim();
    for token in annotation_tokens {
        let Some(head) = body.get(..token.len()) else {
            continue;
        };
        if !head.eq_ignore_ascii_case(token) {
            continue;
        }
        let rest = &body[token.len()..];
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            return rest.trim();
        }
    }
    body
}
