//! An offline grammar checker built from a few simple rules.
//!
//! This catches the mechanical problems that OCR tends to introduce, like
//! doubled spaces, repeated words, and stray spaces before punctuation. It's no
//! substitute for a real grammar checker, but it needs no network access.

use regex::Regex;

use crate::prelude::*;

use super::{GrammarChecker, GrammarIssue, GrammarReport, apply_corrections};

/// Offline rule-based grammar checker.
pub struct RuleGrammarChecker {
    repeated_whitespace: Regex,
    space_before_punctuation: Regex,
    sentence_start: Regex,
    word: Regex,
}

impl RuleGrammarChecker {
    pub fn new() -> Result<Self> {
        Ok(Self {
            repeated_whitespace: Regex::new(r"[ \t]{2,}")?,
            space_before_punctuation: Regex::new(r"[ \t]+([,.;:!?])")?,
            sentence_start: Regex::new(r"(?:^|[.!?][ \t]+)([a-z])")?,
            word: Regex::new(r"\w+")?,
        })
    }

    /// Run every rule over `text`, returning issues sorted by offset.
    fn find_issues(&self, text: &str) -> Vec<GrammarIssue> {
        let mut issues = vec![];

        for m in self.repeated_whitespace.find_iter(text) {
            issues.push(issue(
                text,
                m.start(),
                m.end(),
                "WHITESPACE_RULE",
                "whitespace",
                "Possible typo: you repeated a whitespace",
                " ".to_owned(),
            ));
        }

        for caps in self.space_before_punctuation.captures_iter(text) {
            let (Some(whole), Some(punct)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            issues.push(issue(
                text,
                whole.start(),
                whole.end(),
                "COMMA_PARENTHESIS_WHITESPACE",
                "punctuation",
                "Don't put a space before punctuation",
                punct.as_str().to_owned(),
            ));
        }

        for caps in self.sentence_start.captures_iter(text) {
            let Some(letter) = caps.get(1) else {
                continue;
            };
            issues.push(issue(
                text,
                letter.start(),
                letter.end(),
                "UPPERCASE_SENTENCE_START",
                "capitalization",
                "This sentence does not start with an uppercase letter",
                letter.as_str().to_uppercase(),
            ));
        }

        // The regex crate has no backreferences, so compare neighbors by hand.
        let words = self.word.find_iter(text).collect::<Vec<_>>();
        for pair in words.windows(2) {
            let (first, second) = (pair[0], pair[1]);
            let between = &text[first.end()..second.start()];
            let only_whitespace =
                !between.is_empty() && between.chars().all(|c| c == ' ' || c == '\t');
            if only_whitespace && first.as_str().eq_ignore_ascii_case(second.as_str()) {
                issues.push(issue(
                    text,
                    first.end(),
                    second.end(),
                    "ENGLISH_WORD_REPEAT_RULE",
                    "grammar",
                    "Possible typo: you repeated a word",
                    String::new(),
                ));
            }
        }

        issues.sort_by_key(|issue| (issue.offset, issue.length));
        issues
    }
}

/// Build an issue from a byte range, converting to character offsets.
fn issue(
    text: &str,
    byte_start: usize,
    byte_end: usize,
    rule_id: &str,
    category: &str,
    message: &str,
    suggestion: String,
) -> GrammarIssue {
    let offset = text[..byte_start].chars().count();
    let length = text[byte_start..byte_end].chars().count();
    GrammarIssue {
        rule_id: rule_id.to_owned(),
        category: category.to_owned(),
        message: message.to_owned(),
        offset,
        length,
        suggestions: vec![suggestion],
    }
}

#[async_trait]
impl GrammarChecker for RuleGrammarChecker {
    #[instrument(level = "debug", skip_all, fields(len = text.len()))]
    async fn check_grammar(&self, text: &str, auto_correct: bool) -> Result<GrammarReport> {
        let issues = self.find_issues(text);
        let corrected_text = if auto_correct {
            apply_corrections(text, &issues)
        } else {
            text.to_owned()
        };
        Ok(GrammarReport {
            issues,
            corrected_text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_ids(text: &str) -> Vec<String> {
        RuleGrammarChecker::new()
            .unwrap()
            .find_issues(text)
            .into_iter()
            .map(|issue| issue.rule_id)
            .collect()
    }

    #[test]
    fn clean_text_has_no_issues() {
        assert!(rule_ids("The cat sat on the mat. It was happy!").is_empty());
    }

    #[test]
    fn finds_each_rule() {
        assert_eq!(rule_ids("The  cat."), vec!["WHITESPACE_RULE"]);
        assert_eq!(rule_ids("The cat , sat."), vec!["COMMA_PARENTHESIS_WHITESPACE"]);
        assert_eq!(rule_ids("the cat."), vec!["UPPERCASE_SENTENCE_START"]);
        assert_eq!(rule_ids("The the cat."), vec!["ENGLISH_WORD_REPEAT_RULE"]);
    }

    #[test]
    fn offsets_are_in_characters() {
        let issues = RuleGrammarChecker::new().unwrap().find_issues("Café  bar.");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].offset, 4);
        assert_eq!(issues[0].length, 2);
    }

    #[tokio::test]
    async fn auto_correct_fixes_text() {
        let checker = RuleGrammarChecker::new().unwrap();
        let text = "the cat sat  on on the mat .";
        let report = checker.check_grammar(text, true).await.unwrap();
        assert_eq!(report.issues.len(), 4);
        assert_eq!(report.corrected_text, "The cat sat on the mat.");

        let report = checker.check_grammar(text, false).await.unwrap();
        assert_eq!(report.corrected_text, text);
    }
}
