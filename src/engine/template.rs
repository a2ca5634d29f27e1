//! Username templates for dynamically created IAM users.
//!
//! A template is literal text with `{{placeholder}}` substitutions:
//! `display_name`, `role_name`, `unix_time` and `random` (optionally followed
//! by a length, as in `{{random 8}}`).

use chrono::{DateTime, Utc};
use pom::utf8::{none_of, one_of, seq, sym, Parser};

use crate::{
    error::Error,
    utils::{normalize_display_name, random_alphanumeric, truncate},
};

pub const DEFAULT_USERNAME_TEMPLATE: &str =
    "vault-{{display_name}}-{{role_name}}-{{random}}-{{unix_time}}";

/// IAM rejects user names longer than this.
pub const MAX_USERNAME_LEN: usize = 64;

const DEFAULT_RANDOM_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    DisplayName,
    RoleName,
    UnixTime,
    Random(usize),
}

fn spaces<'a>() -> Parser<'a, ()> {
    sym(' ').repeat(0..).discard()
}

fn placeholder<'a>() -> Parser<'a, Piece> {
    let display_name = seq("display_name").map(|_| Piece::DisplayName);
    let role_name = seq("role_name").map(|_| Piece::RoleName);
    let unix_time = seq("unix_time").map(|_| Piece::UnixTime);

    let length = sym(' ').repeat(1..)
        * one_of("0123456789")
            .repeat(1..)
            .collect()
            .convert(|digits: &str| digits.parse::<usize>());
    let random =
        (seq("random") * length.opt()).map(|len| Piece::Random(len.unwrap_or(DEFAULT_RANDOM_LEN)));

    (seq("{{") * spaces() * (display_name | role_name | unix_time | random) - spaces() - seq("}}"))
        .name("placeholder")
}

fn literal<'a>() -> Parser<'a, Piece> {
    let text = none_of("{").repeat(1..).collect();
    let brace = sym('{').collect();

    (text | brace).map(|s: &str| Piece::Literal(s.to_owned()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsernameTemplate {
    pieces: Vec<Piece>,
}

impl UsernameTemplate {
    pub fn parse(template: &str) -> Result<Self, Error> {
        let parsed = ((placeholder() | literal()).repeat(0..) - pom::utf8::end())
            .parse_str(template)
            .map_err(|e| Error::validation(format!("invalid username template: {e}")))?;

        let mut pieces: Vec<Piece> = Vec::with_capacity(parsed.len());
        for piece in parsed {
            match (pieces.last_mut(), piece) {
                (Some(Piece::Literal(prev)), Piece::Literal(next)) => prev.push_str(&next),
                (_, piece) => pieces.push(piece),
            }
        }

        // A `{{` that did not parse as a placeholder ends up in a literal.
        if pieces
            .iter()
            .any(|p| matches!(p, Piece::Literal(s) if s.contains("{{")))
        {
            return Err(Error::validation(format!(
                "invalid username template {template:?}: unknown placeholder"
            )));
        }

        Ok(Self { pieces })
    }

    /// Renders a user name of at most [`MAX_USERNAME_LEN`] bytes.
    ///
    /// Overlong names are shortened from the display and role names first,
    /// last name first, so random and time components keep their length.
    pub fn render(&self, display_name: &str, role_name: &str, now: DateTime<Utc>) -> String {
        let mut rendered: Vec<(String, bool)> = self
            .pieces
            .iter()
            .map(|piece| match piece {
                Piece::Literal(s) => (s.clone(), false),
                Piece::DisplayName => (normalize_display_name(display_name), true),
                Piece::RoleName => (normalize_display_name(role_name), true),
                Piece::UnixTime => (now.timestamp().to_string(), false),
                Piece::Random(len) => (random_alphanumeric(*len), false),
            })
            .collect();

        let mut excess = rendered
            .iter()
            .map(|(s, _)| s.len())
            .sum::<usize>()
            .saturating_sub(MAX_USERNAME_LEN);
        for (s, _) in rendered.iter_mut().rev().filter(|(_, shrink)| *shrink) {
            if excess == 0 {
                break;
            }
            let keep = s.len().saturating_sub(excess);
            let kept = truncate(s.as_str(), keep).len();
            excess -= s.len() - kept;
            s.truncate(kept);
        }

        let out: String = rendered.into_iter().map(|(s, _)| s).collect();
        truncate(&out, MAX_USERNAME_LEN).to_owned()
    }
}

impl Default for UsernameTemplate {
    fn default() -> Self {
        Self {
            pieces: vec![
                Piece::Literal("vault-".to_owned()),
                Piece::DisplayName,
                Piece::Literal("-".to_owned()),
                Piece::RoleName,
                Piece::Literal("-".to_owned()),
                Piece::Random(DEFAULT_RANDOM_LEN),
                Piece::Literal("-".to_owned()),
                Piece::UnixTime,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_default_template_parses_to_default() {
        assert_eq!(
            UsernameTemplate::parse(DEFAULT_USERNAME_TEMPLATE).unwrap(),
            UsernameTemplate::default()
        );
    }

    #[test]
    fn test_render_default() {
        let name = UsernameTemplate::default().render("token", "deploy", now());

        let parts: Vec<_> = name.split('-').collect();
        assert_eq!(parts[0], "vault");
        assert_eq!(parts[1], "token");
        assert_eq!(parts[2], "deploy");
        assert_eq!(parts[3].len(), DEFAULT_RANDOM_LEN);
        assert_eq!(parts[4], "1700000000");
    }

    #[test]
    fn test_render_normalizes_and_truncates() {
        let display = "ldap-".to_owned() + &"x".repeat(80);
        let name = UsernameTemplate::default().render(&display, "my role", now());

        assert!(name.starts_with("vault-ldap_xxx"));
        assert_eq!(name.len(), MAX_USERNAME_LEN);
        assert!(name.ends_with("-1700000000"));
    }

    #[test]
    fn test_long_names_keep_random_suffix() {
        let display = "a".repeat(40);
        let name = UsernameTemplate::default().render(&display, "deployment-prod", now());

        assert_eq!(name.len(), MAX_USERNAME_LEN);
        let parts: Vec<_> = name.rsplitn(3, '-').collect();
        assert_eq!(parts[0], "1700000000");
        assert_eq!(parts[1].len(), DEFAULT_RANDOM_LEN);
        assert!(parts[2].starts_with("vault-aaaa"));

        let other = UsernameTemplate::default().render(&display, "deployment-prod", now());
        assert_ne!(name, other);
    }

    #[test]
    fn test_oversized_literals_still_truncate() {
        let template = UsernameTemplate::parse(&"z".repeat(70)).unwrap();
        assert_eq!(template.render("d", "r", now()).len(), MAX_USERNAME_LEN);
    }

    #[test]
    fn test_custom_template() {
        let template = UsernameTemplate::parse("svc_{{ role_name }}_{{random 4}}{x}").unwrap();
        let name = template.render("ignored", "db", now());

        assert!(name.starts_with("svc_db_"));
        assert!(name.ends_with("{x}"));
        assert_eq!(name.len(), "svc_db_".len() + 4 + 3);
    }

    #[test]
    fn test_invalid_templates() {
        for template in ["{{bogus}}", "a-{{display_name", "{{random x}}"] {
            assert!(UsernameTemplate::parse(template).is_err(), "{template}");
        }
    }
}
