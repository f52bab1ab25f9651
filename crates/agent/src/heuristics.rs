//! Transcript heuristics
//!
//! Deterministic classification of lead utterances: does a transcript look
//! like an answer to the question we just asked, is it a hangup request,
//! and - when the model fails to call a tool despite a forced choice - what
//! qualification answer should be inferred directly from the words.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::qualification::{QualAnswer, QualKey};
use crate::script::LadderQuestion;

static AFFIRMATIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(yes|yeah|yep|yup|sure|correct|right|absolutely|of course|that's right|that is right|i do|i have|i am|it is|uh huh|mm+hm+)\b",
    )
    .unwrap()
});

static NEGATIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(no|nope|nah|never|negative|i don't|i do not|i haven't|i have not|i'm not|i am not|don't have|do not have)\b",
    )
    .unwrap()
});

static HANGUP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(hang up|take me off|remove me|stop calling|don't call|do not call|not interested|leave me alone|goodbye)",
    )
    .unwrap()
});

static AGE_NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{2,3})\b").unwrap());

static AGE_WORDS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(forty|fifty|sixty|seventy|eighty|ninety)([ -](one|two|three|four|five|six|seven|eight|nine))?\b")
        .unwrap()
});

static BANK_PHRASE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(bank|checking|savings|credit union|direct express)").unwrap()
});

static AT_HOME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bat home\b").unwrap());

/// Ages accepted by the program
const QUALIFYING_AGES: std::ops::RangeInclusive<u32> = 50..=85;

/// Classify a transcript as affirmative (true), negative (false), or
/// neither. Negations win when both patterns appear ("no, I don't think
/// so" contains "so" but must stay negative).
pub fn classify_yes_no(transcript: &str) -> Option<bool> {
    if NEGATIVE_RE.is_match(transcript) {
        Some(false)
    } else if AFFIRMATIVE_RE.is_match(transcript) {
        Some(true)
    } else {
        None
    }
}

/// Explicit requests to end the call
pub fn is_hangup_request(transcript: &str) -> bool {
    HANGUP_RE.is_match(transcript)
}

/// Parse a spoken age from digits or number words
pub fn parse_age(transcript: &str) -> Option<u32> {
    if let Some(caps) = AGE_NUMBER_RE.captures(transcript) {
        return caps[1].parse().ok();
    }
    let caps = AGE_WORDS_RE.captures(transcript)?;
    let tens = match caps[1].to_lowercase().as_str() {
        "forty" => 40,
        "fifty" => 50,
        "sixty" => 60,
        "seventy" => 70,
        "eighty" => 80,
        "ninety" => 90,
        _ => return None,
    };
    let ones = caps.get(3).map_or(0, |m| match m.as_str().to_lowercase().as_str() {
        "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        _ => 0,
    });
    Some(tens + ones)
}

/// Does the transcript look like an answer to `question`?
///
/// Drives the tool-choice policy: only when the lead plausibly answered a
/// qualification (or transfer-confirmation) question do we force the model
/// to call a tool. The health-discovery question never forces.
pub fn looks_like_answer(transcript: &str, question: LadderQuestion) -> bool {
    match question {
        LadderQuestion::HealthDiscovery => false,
        LadderQuestion::Age => {
            parse_age(transcript).is_some() || classify_yes_no(transcript).is_some()
        }
        LadderQuestion::BankAccount => {
            BANK_PHRASE_RE.is_match(transcript) || classify_yes_no(transcript).is_some()
        }
        LadderQuestion::Hospice => {
            AT_HOME_RE.is_match(transcript) || classify_yes_no(transcript).is_some()
        }
        LadderQuestion::Verification
        | LadderQuestion::Alzheimers
        | LadderQuestion::TransferConfirmation => classify_yes_no(transcript).is_some(),
    }
}

/// Manual-inference fallback: derive the qualification update directly from
/// the transcript when the forced tool call never arrived.
///
/// Returns the key and the inferred answer, or `None` when the words are
/// too ambiguous to act on.
pub fn infer_qualification(
    transcript: &str,
    question: LadderQuestion,
) -> Option<(QualKey, QualAnswer)> {
    let key = question.qual_key()?;
    match question {
        LadderQuestion::Verification => {
            classify_yes_no(transcript).map(|yes| (key, QualAnswer::from_bool(yes)))
        }
        // "Yes, I was diagnosed" disqualifies; "no" qualifies
        LadderQuestion::Alzheimers => {
            classify_yes_no(transcript).map(|yes| (key, QualAnswer::from_bool(!yes)))
        }
        // "At home" answers count as not-in-hospice
        LadderQuestion::Hospice => {
            if AT_HOME_RE.is_match(transcript) {
                Some((key, QualAnswer::Yes))
            } else {
                classify_yes_no(transcript).map(|yes| (key, QualAnswer::from_bool(!yes)))
            }
        }
        LadderQuestion::Age => parse_age(transcript)
            .map(|age| (key, QualAnswer::from_bool(QUALIFYING_AGES.contains(&age)))),
        LadderQuestion::BankAccount => {
            if BANK_PHRASE_RE.is_match(transcript) && classify_yes_no(transcript) != Some(false) {
                Some((key, QualAnswer::Yes))
            } else {
                classify_yes_no(transcript).map(|yes| (key, QualAnswer::from_bool(yes)))
            }
        }
        LadderQuestion::HealthDiscovery | LadderQuestion::TransferConfirmation => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_yes_no() {
        assert_eq!(classify_yes_no("Yes that's right"), Some(true));
        assert_eq!(classify_yes_no("yeah sure"), Some(true));
        assert_eq!(classify_yes_no("No, I don't think so"), Some(false));
        assert_eq!(classify_yes_no("nope"), Some(false));
        assert_eq!(classify_yes_no("what is this about"), None);
    }

    #[test]
    fn test_negation_wins_over_affirmation() {
        assert_eq!(classify_yes_no("no, that's right next door"), Some(false));
    }

    #[test]
    fn test_hangup_requests() {
        assert!(is_hangup_request("please take me off your list"));
        assert!(is_hangup_request("just hang up"));
        assert!(is_hangup_request("stop calling me"));
        assert!(!is_hangup_request("yes I have a bank account"));
    }

    #[test]
    fn test_parse_age() {
        assert_eq!(parse_age("I'm 62"), Some(62));
        assert_eq!(parse_age("sixty two"), Some(62));
        assert_eq!(parse_age("I am seventy-five years old"), Some(75));
        assert_eq!(parse_age("sixty"), Some(60));
        assert_eq!(parse_age("young at heart"), None);
    }

    #[test]
    fn test_looks_like_answer_age() {
        assert!(looks_like_answer("I'm 62", LadderQuestion::Age));
        assert!(looks_like_answer("sixty two", LadderQuestion::Age));
        assert!(!looks_like_answer("why do you ask", LadderQuestion::Age));
    }

    #[test]
    fn test_looks_like_answer_hospice_at_home() {
        assert!(looks_like_answer("I'm at home", LadderQuestion::Hospice));
    }

    #[test]
    fn test_health_discovery_never_forces() {
        assert!(!looks_like_answer(
            "yes I have some back trouble",
            LadderQuestion::HealthDiscovery
        ));
    }

    #[test]
    fn test_infer_alzheimers_inverts() {
        assert_eq!(
            infer_qualification("Yes, I was diagnosed", LadderQuestion::Alzheimers),
            Some((QualKey::NoAlzheimers, QualAnswer::No))
        );
        assert_eq!(
            infer_qualification("no never", LadderQuestion::Alzheimers),
            Some((QualKey::NoAlzheimers, QualAnswer::Yes))
        );
    }

    #[test]
    fn test_infer_hospice_at_home() {
        assert_eq!(
            infer_qualification("I'm living at home", LadderQuestion::Hospice),
            Some((QualKey::NoHospice, QualAnswer::Yes))
        );
        assert_eq!(
            infer_qualification("yes I'm in hospice", LadderQuestion::Hospice),
            Some((QualKey::NoHospice, QualAnswer::No))
        );
    }

    #[test]
    fn test_infer_age_bounds() {
        assert_eq!(
            infer_qualification("I'm 62", LadderQuestion::Age),
            Some((QualKey::AgeQualified, QualAnswer::Yes))
        );
        assert_eq!(
            infer_qualification("I'm 30", LadderQuestion::Age),
            Some((QualKey::AgeQualified, QualAnswer::No))
        );
    }

    #[test]
    fn test_infer_bank_account() {
        assert_eq!(
            infer_qualification("I bank with Chase", LadderQuestion::BankAccount),
            Some((QualKey::HasBankAccount, QualAnswer::Yes))
        );
        assert_eq!(
            infer_qualification("no I don't have one", LadderQuestion::BankAccount),
            Some((QualKey::HasBankAccount, QualAnswer::No))
        );
    }
}
