//! SPF macro expansion (RFC 7208 §7).
//!
//! Templates are scanned left to right. Literal text passes through, the
//! escapes `%%`, `%_` and `%-` become `%`, a space and `%20`, and each
//! `%{letter[digits][r][delimiters]}` token is replaced by the transformed
//! value bound to its letter.
//!
//! Expansion only reads the context, so the same template and context always
//! produce the same output and one expander can serve concurrent evaluations.

use crate::context::SpfContext;
use crate::error::SpfError;
use crate::identity::IdentityResolver;
use lazy_static::lazy_static;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Longest domain name a macro-mode expansion may produce
pub const MAX_DOMAIN_LENGTH: usize = 253;

/// Largest honoured digit transformer
const MAX_TRANSFORM_DIGITS: usize = 128;

/// Characters kept verbatim by uppercase (URL-escaping) macro letters
const URL_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

lazy_static! {
    // letter, digit transformer, reverse flag, delimiters
    static ref MACRO_TOKEN: Regex =
        Regex::new(r"^([A-Za-z])([0-9]*)(r?)([.\-+,/_=]*)$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionMode {
    /// Building a DNS query name (domain-spec). `c`, `r` and `t` are rejected
    /// and the output is capped at 253 characters.
    Macro,
    /// Composing an explanation string. All letters allowed, no length cap.
    Explanation,
}

/// Expand `template` without an identity resolver; `%{p}` yields a TempError.
pub fn expand(template: &str, ctx: &SpfContext, mode: ExpansionMode) -> Result<String, SpfError> {
    MacroExpander::default().expand(template, ctx, mode)
}

#[derive(Clone, Default)]
pub struct MacroExpander {
    identity: Option<Arc<dyn IdentityResolver>>,
}

impl fmt::Debug for MacroExpander {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacroExpander")
            .field("identity", &self.identity.is_some())
            .finish()
    }
}

impl MacroExpander {
    pub fn new(identity: Option<Arc<dyn IdentityResolver>>) -> Self {
        Self { identity }
    }

    pub fn expand(
        &self,
        template: &str,
        ctx: &SpfContext,
        mode: ExpansionMode,
    ) -> Result<String, SpfError> {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(pos) = rest.find('%') {
            output.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];

            match after.chars().next() {
                Some('%') => {
                    output.push('%');
                    rest = &after[1..];
                }
                Some('_') => {
                    output.push(' ');
                    rest = &after[1..];
                }
                Some('-') => {
                    output.push_str("%20");
                    rest = &after[1..];
                }
                Some('{') => {
                    let end = after
                        .find('}')
                        .ok_or_else(|| SpfError::perm(format!("unterminated macro in '{template}'")))?;
                    let expanded = self.expand_token(&after[1..end], ctx, mode)?;
                    output.push_str(&expanded);
                    rest = &after[end + 1..];
                }
                Some(other) => {
                    return Err(SpfError::perm(format!(
                        "invalid macro escape '%{other}' in '{template}'"
                    )));
                }
                None => {
                    return Err(SpfError::perm(format!("trailing '%' in '{template}'")));
                }
            }
        }
        output.push_str(rest);

        match mode {
            ExpansionMode::Macro => truncate_domain(&output),
            ExpansionMode::Explanation => Ok(output),
        }
    }

    fn expand_token(
        &self,
        token: &str,
        ctx: &SpfContext,
        mode: ExpansionMode,
    ) -> Result<String, SpfError> {
        let caps = MACRO_TOKEN
            .captures(token)
            .ok_or_else(|| SpfError::perm(format!("malformed macro '%{{{token}}}'")))?;

        let letter = caps[1].chars().next().unwrap_or_default();
        let lower = letter.to_ascii_lowercase();

        if mode == ExpansionMode::Macro && matches!(lower, 'c' | 'r' | 't') {
            return Err(SpfError::perm(format!(
                "macro letter '{letter}' is only allowed in explanations"
            )));
        }

        let count = parse_count(&caps[2], token)?;
        let reverse = !caps[3].is_empty();
        let delimiters = if caps[4].is_empty() { "." } else { &caps[4] };

        let value = self.letter_value(lower, ctx)?;
        let transformed = transform(&value, delimiters, reverse, count);

        if letter.is_ascii_uppercase() {
            Ok(utf8_percent_encode(&transformed, URL_ESCAPE).to_string())
        } else {
            Ok(transformed)
        }
    }

    fn letter_value(&self, letter: char, ctx: &SpfContext) -> Result<String, SpfError> {
        let value = match letter {
            's' => ctx.sender(),
            'l' => ctx.sender_local_part().to_string(),
            'o' => ctx.sender_domain().to_string(),
            'd' => ctx.current_domain().to_string(),
            'i' => dotted_ip(ctx.ip()),
            'p' => self.validated_name(ctx)?,
            'v' => match ctx.ip() {
                IpAddr::V4(_) => "in-addr".to_string(),
                IpAddr::V6(_) => "ip6".to_string(),
            },
            'h' => ctx.helo_domain().to_string(),
            'c' => ctx.ip().to_string(),
            'r' => ctx.receiving_domain().to_string(),
            't' => ctx.timestamp().to_string(),
            other => {
                return Err(SpfError::perm(format!("unknown macro letter '{other}'")));
            }
        };
        Ok(value)
    }

    fn validated_name(&self, ctx: &SpfContext) -> Result<String, SpfError> {
        let resolver = self
            .identity
            .as_ref()
            .ok_or_else(|| SpfError::temp("no identity resolver available for %{p}"))?;

        let name = resolver.validated_name(ctx.ip(), ctx.current_domain())?;
        Ok(name.unwrap_or_else(|| "unknown".to_string()))
    }
}

fn parse_count(digits: &str, token: &str) -> Result<Option<usize>, SpfError> {
    if digits.is_empty() {
        return Ok(None);
    }
    // Overlong digit strings saturate to the cap
    let count = digits.parse::<usize>().unwrap_or(MAX_TRANSFORM_DIGITS);
    if count == 0 {
        return Err(SpfError::perm(format!("zero label count in '%{{{token}}}'")));
    }
    Ok(Some(count.min(MAX_TRANSFORM_DIGITS)))
}

/// Split on `delimiters`, optionally reverse, keep the rightmost `count`
/// pieces and rejoin with dots.
fn transform(value: &str, delimiters: &str, reverse: bool, count: Option<usize>) -> String {
    let mut pieces: Vec<&str> = value.split(|c: char| delimiters.contains(c)).collect();

    if reverse {
        pieces.reverse();
    }
    if let Some(count) = count {
        if pieces.len() > count {
            pieces.drain(..pieces.len() - count);
        }
    }

    pieces.join(".")
}

/// IPv4 as dotted quad, IPv6 as 32 dot-separated nibbles
fn dotted_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => v6
            .octets()
            .iter()
            .flat_map(|byte| [byte >> 4, byte & 0x0f])
            .map(|nibble| format!("{nibble:x}"))
            .collect::<Vec<_>>()
            .join("."),
    }
}

/// Strip empty leading labels, then drop whole leading labels until the
/// name fits in 253 characters
fn truncate_domain(expanded: &str) -> Result<String, SpfError> {
    let mut name = expanded.trim_start_matches('.');

    while name.len() > MAX_DOMAIN_LENGTH {
        match name.find('.') {
            Some(pos) => name = name[pos + 1..].trim_start_matches('.'),
            None => {
                return Err(SpfError::perm(format!(
                    "expanded domain label exceeds {MAX_DOMAIN_LENGTH} characters"
                )));
            }
        }
    }

    if name.len() < expanded.len() {
        log::debug!("Truncated expanded domain to {name}");
    }
    Ok(name.to_string())
}
