//! Log-safe secret redaction, used wherever a task's secret values or
//! `$NAME`-style references might otherwise land in a structured log line.

use std::collections::HashMap;

const MAX_REDACTED_LEN: usize = 200;

/// Redacts every occurrence of a secret's value (and of `$NAME` references to
/// it) out of `text`, suitable for passing to a `tracing` field.
///
/// Values longer than four characters keep their first two and last two
/// characters (`sk***ey`); shorter non-empty values collapse to `***`
/// entirely, since a partial reveal of a four-character-or-shorter secret is
/// not meaningfully safer than the whole thing. The result is truncated to
/// [`MAX_REDACTED_LEN`] characters so one secret can't blow out a log line.
pub fn redact_for_log(text: &str, secrets: &HashMap<String, String>) -> String {
    let mut out = text.to_string();

    for (name, value) in secrets {
        if !value.is_empty() {
            let replacement = mask_value(value);
            out = out.replace(value.as_str(), &replacement);
        }
        let reference = format!("${name}");
        let masked_reference = format!("${name}[REDACTED]");
        out = out.replace(&reference, &masked_reference);
    }

    truncate_chars(&out, MAX_REDACTED_LEN)
}

fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 4 {
        let first: String = chars[..2].iter().collect();
        let last: String = chars[chars.len() - 2..].iter().collect();
        format!("{first}***{last}")
    } else {
        "***".to_string()
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn long_secret_is_masked_with_head_and_tail() {
        let secrets = secrets(&[("API_KEY", "sk-abcdefgh12345")]);
        let out = redact_for_log("using key sk-abcdefgh12345 now", &secrets);
        assert_eq!(out, "using key sk***45 now");
    }

    #[test]
    fn short_secret_is_fully_masked() {
        let secrets = secrets(&[("PIN", "1234")]);
        let out = redact_for_log("pin is 1234", &secrets);
        assert_eq!(out, "pin is ***");
    }

    #[test]
    fn dollar_reference_is_marked_redacted() {
        let secrets = secrets(&[("API_KEY", "sk-abcdefgh12345")]);
        let out = redact_for_log("export $API_KEY before running", &secrets);
        assert!(out.contains("$API_KEY[REDACTED]"));
    }

    #[test]
    fn empty_secret_value_is_left_alone_but_reference_is_marked() {
        let secrets = secrets(&[("EMPTY", "")]);
        let out = redact_for_log("value of $EMPTY is blank", &secrets);
        assert_eq!(out, "value of $EMPTY[REDACTED] is blank");
    }

    #[test]
    fn output_is_truncated_to_max_len() {
        let secrets = HashMap::new();
        let long = "x".repeat(500);
        let out = redact_for_log(&long, &secrets);
        assert_eq!(out.chars().count(), MAX_REDACTED_LEN);
    }

    #[test]
    fn no_secrets_returns_text_unchanged_when_short() {
        let secrets = HashMap::new();
        let out = redact_for_log("nothing secret here", &secrets);
        assert_eq!(out, "nothing secret here");
    }

    #[test]
    fn multiple_secrets_are_all_redacted() {
        let secrets = secrets(&[("A", "alpha-secret-1"), ("B", "beta-secret-2")]);
        let out = redact_for_log("alpha-secret-1 and beta-secret-2 combined", &secrets);
        assert!(!out.contains("alpha-secret-1"));
        assert!(!out.contains("beta-secret-2"));
    }
}
