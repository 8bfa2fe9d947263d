//! Echo suppression.
//! The microphone hears the kiosk's own speaker. A recognised query that is
//! (nearly) the text we just spoke is treated as an echo and dropped.

use std::sync::OnceLock;

use regex::Regex;

/// Normalised similarity at or above which a query counts as an echo.
pub const ECHO_SIMILARITY: f64 = 0.8;
/// Shortest normalised query for which containment counts as an echo.
const MIN_CONTAINED_CHARS: usize = 2;

/// Lowercase and strip punctuation, symbols and whitespace (including the
/// full-width framing characters used in utterances).
pub fn normalize(text: &str) -> String {
    static STRIP: OnceLock<Regex> = OnceLock::new();
    let re = STRIP.get_or_init(|| Regex::new(r"[\p{P}\p{S}\s]+").unwrap());
    re.replace_all(&text.to_lowercase(), "").into_owned()
}

/// Levenshtein-based similarity in 0..=1 over chars.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitute = prev[j] + usize::from(ca != cb);
            row[j + 1] = substitute.min(prev[j + 1] + 1).min(row[j] + 1);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    1.0 - prev[b.len()] as f64 / longest as f64
}

/// True if `query` looks like the microphone picking up `last_spoken`.
pub fn is_likely_echo(query: &str, last_spoken: &str) -> bool {
    let q = normalize(query);
    let s = normalize(last_spoken);
    if q.is_empty() || s.is_empty() {
        return false;
    }
    if q.chars().count() >= MIN_CONTAINED_CHARS && (s.contains(&q) || q.contains(&s)) {
        return true;
    }
    similarity(&q, &s) >= ECHO_SIMILARITY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_framing() {
        assert_eq!(normalize("。先生　欢迎光临　。"), "先生欢迎光临");
        assert_eq!(normalize("Hello, World!"), "helloworld");
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(similarity("abc", "abc"), 1.0);
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("abc", "xyz"), 0.0);
        assert!((similarity("kitten", "sitting") - (1.0 - 3.0 / 7.0)).abs() < 1e-9);
    }

    #[test]
    fn detects_echo() {
        assert!(is_likely_echo("欢迎光临", "。先生　欢迎光临　。"));
        assert!(is_likely_echo("要试试我们的招牌饮品", "。　要试试我们的招牌饮品吗?　。"));
        assert!(!is_likely_echo("我想要一杯拿铁", "。　需要推荐吗?　。"));
        assert!(!is_likely_echo("", "欢迎"));
        assert!(!is_likely_echo("好", "你好"));
    }
}
