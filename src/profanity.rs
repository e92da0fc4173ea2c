//! Blocked-word screening for member-written text.
//!
//! The admin-curated list lives in the repo; entries are stored lowercase.
//! Single words match whole tokens only ("class" does not trip on "ass"),
//! multi-word entries match as substrings of the lowercased text.

/// Returns the first blocked entry found in `text`, if any.
pub fn find_blocked<'a>(text: &str, blocked: &'a [String]) -> Option<&'a str> {
    if blocked.is_empty() {
        return None;
    }
    let lowered = text.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
        .collect();

    for entry in blocked {
        if entry.contains(' ') || entry.contains('-') {
            if lowered.contains(entry.as_str()) {
                return Some(entry);
            }
        } else if tokens.iter().any(|t| *t == entry.as_str()) {
            return Some(entry);
        }
    }
    None
}

/// Screen every user-supplied field of a submission in one pass.
pub fn find_blocked_in<'a>(fields: &[&str], blocked: &'a [String]) -> Option<&'a str> {
    fields.iter().find_map(|f| find_blocked(f, blocked))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn matches_whole_tokens_only() {
        let blocked = list(&["ass"]);
        assert_eq!(find_blocked("what an ass", &blocked), Some("ass"));
        assert_eq!(find_blocked("my art class", &blocked), None);
        assert_eq!(find_blocked("classic assignment", &blocked), None);
    }

    #[test]
    fn case_insensitive() {
        let blocked = list(&["idiot"]);
        assert_eq!(find_blocked("IDIOT!", &blocked), Some("idiot"));
    }

    #[test]
    fn punctuation_does_not_hide_words() {
        let blocked = list(&["idiot"]);
        assert_eq!(find_blocked("you...idiot?", &blocked), Some("idiot"));
    }

    #[test]
    fn phrases_match_as_substrings() {
        let blocked = list(&["go away"]);
        assert_eq!(find_blocked("please GO AWAY now", &blocked), Some("go away"));
        assert_eq!(find_blocked("go far away", &blocked), None);
    }

    #[test]
    fn apostrophes_stay_inside_tokens() {
        let blocked = list(&["dont"]);
        assert_eq!(find_blocked("don't", &blocked), None);
    }

    #[test]
    fn scans_all_fields() {
        let blocked = list(&["spam"]);
        assert_eq!(find_blocked_in(&["clean title", "buy spam"], &blocked), Some("spam"));
        assert_eq!(find_blocked_in(&["clean", "also clean"], &blocked), None);
    }

    #[test]
    fn empty_list_blocks_nothing() {
        assert_eq!(find_blocked("anything at all", &[]), None);
    }
}
