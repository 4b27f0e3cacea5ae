//! Pattern compilation for `regex_replace` and the `regex` rule
//!
//! Workflows authored in the builder often carry delimited patterns such as
//! `/^seo-\d+$/i`. Those are unwrapped and their flags turned into inline
//! flags; anything else is compiled as a plain pattern.

use once_cell::sync::Lazy;
use regex::Regex;

static BACKREF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\(\d{1,2})").expect("backreference pattern is valid"));

const DELIMITERS: &[char] = &['/', '#', '~', '!', '@', '%', '|'];

/// Compile a raw or `/delimited/flags` pattern.
pub fn compile(raw: &str) -> Result<Regex, regex::Error> {
    match split_delimited(raw) {
        Some((body, flags)) if flags.is_empty() => Regex::new(body),
        Some((body, flags)) => Regex::new(&format!("(?{}){}", flags, body)),
        None => Regex::new(raw),
    }
}

/// Rewrite `\1` style backreferences into `${1}` for [`Regex::replace_all`].
pub fn replacement(template: &str) -> String {
    BACKREF.replace_all(template, "$${$1}").into_owned()
}

fn split_delimited(raw: &str) -> Option<(&str, String)> {
    let delimiter = raw.chars().next().filter(|c| DELIMITERS.contains(c))?;
    let end = raw.rfind(delimiter).filter(|end| *end > 0)?;
    let body = &raw[delimiter.len_utf8()..end];
    let modifiers = &raw[end + delimiter.len_utf8()..];

    let mut flags = String::new();
    for m in modifiers.chars() {
        match m {
            'i' | 'm' | 's' | 'x' => flags.push(m),
            'u' => {}
            _ => return None,
        }
    }
    Some((body, flags))
}
