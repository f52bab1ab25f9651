//! The call script
//!
//! Greeting lines, the fixed question ladder, and the deterministic
//! templates the engine falls back to when the model answers with a pure
//! tool call. Each ladder question is asked at most once per call; the
//! engine detects what has been asked by matching these patterns against
//! the assistant turns in the history.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::qualification::QualKey;

/// Reply used whenever the LLM call fails
pub const FALLBACK_REPLY: &str = "I apologize, could you repeat that for me?";

/// Prompt sent after the first no-response timeout
pub const NO_RESPONSE_PROMPT: &str = "I can't hear you clearly. Please try again";

/// The fixed question ladder, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderQuestion {
    /// "Am I speaking with {name}?" - maps to verified_info
    Verification,
    /// Open health question; deliberately NOT a qualification
    HealthDiscovery,
    Alzheimers,
    Hospice,
    Age,
    BankAccount,
    /// "Sound good?" before the blind transfer
    TransferConfirmation,
}

impl LadderQuestion {
    /// The qualification key this question feeds, if any
    pub fn qual_key(&self) -> Option<QualKey> {
        match self {
            LadderQuestion::Verification => Some(QualKey::VerifiedInfo),
            LadderQuestion::HealthDiscovery => None,
            LadderQuestion::Alzheimers => Some(QualKey::NoAlzheimers),
            LadderQuestion::Hospice => Some(QualKey::NoHospice),
            LadderQuestion::Age => Some(QualKey::AgeQualified),
            LadderQuestion::BankAccount => Some(QualKey::HasBankAccount),
            LadderQuestion::TransferConfirmation => None,
        }
    }

    /// Spoken text of the question
    pub fn text(&self) -> &'static str {
        match self {
            LadderQuestion::Verification => "Am I speaking with the right person?",
            LadderQuestion::HealthDiscovery => {
                "Before we go over your options, do you have any major health issues I should know about?"
            }
            LadderQuestion::Alzheimers => {
                "Have you ever been diagnosed with Alzheimer's or dementia?"
            }
            LadderQuestion::Hospice => "And are you currently in hospice care, or living at home?",
            LadderQuestion::Age => "And may I ask how old you are?",
            LadderQuestion::BankAccount => {
                "Do you have an active bank account or a Direct Express card for your benefits?"
            }
            LadderQuestion::TransferConfirmation => {
                "Great news, you qualify! Let me connect you with a licensed specialist who can go over your options. Sound good?"
            }
        }
    }
}

static VERIFICATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(am i speaking (with|to)|is this)").unwrap());
static HEALTH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)health (issues?|problems?|concerns?)").unwrap());
static ALZHEIMERS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)alzheimer|dementia").unwrap());
static HOSPICE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)hospice").unwrap());
static AGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(how old|your age|what age)").unwrap());
static BANK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(bank account|direct express)").unwrap());
static TRANSFER_CONFIRM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(sound good|connect you with)").unwrap());

/// Identify which ladder question an assistant turn asked, if any.
///
/// Checked in reverse ladder order so that composite lines ("…hospice care,
/// or living at home?") resolve to the most specific question.
pub fn question_in(text: &str) -> Option<LadderQuestion> {
    if TRANSFER_CONFIRM_RE.is_match(text) {
        Some(LadderQuestion::TransferConfirmation)
    } else if BANK_RE.is_match(text) {
        Some(LadderQuestion::BankAccount)
    } else if AGE_RE.is_match(text) {
        Some(LadderQuestion::Age)
    } else if HOSPICE_RE.is_match(text) {
        Some(LadderQuestion::Hospice)
    } else if ALZHEIMERS_RE.is_match(text) {
        Some(LadderQuestion::Alzheimers)
    } else if HEALTH_RE.is_match(text) {
        Some(LadderQuestion::HealthDiscovery)
    } else if VERIFICATION_RE.is_match(text) {
        Some(LadderQuestion::Verification)
    } else {
        None
    }
}

/// System prompt composed from the lead snapshot
pub fn system_prompt(first_name: &str, last_name: &str, address: Option<&str>) -> String {
    let location = address
        .map(|a| format!(" in the {} area", a))
        .unwrap_or_default();
    format!(
        "You are Sarah, a friendly phone agent helping {first} {last}{location} check \
         whether they qualify for a final expense benefit program. Speak naturally and \
         keep every reply to one or two short sentences suitable for reading aloud. \
         Ask exactly one question at a time, in this order: confirm you are speaking \
         with {first}; ask about any major health issues; ask about Alzheimer's or \
         dementia; ask about hospice care; ask their age; ask about an active bank \
         account. Record answers with the update_qualification tool. When every \
         qualification is met, confirm and use set_call_outcome with transfer_to_agent. \
         If the person does not qualify or asks to stop, politely end with \
         set_call_outcome. Never read tool names, JSON, or stage directions aloud.",
        first = first_name,
        last = last_name,
        location = location,
    )
}

/// Scripted opening line (also the verification question)
pub fn greeting(first_name: &str) -> String {
    format!(
        "Hello, this is Sarah on a recorded line. Am I speaking with {}?",
        first_name
    )
}

/// Scripted follow-up once the line is confirmed live
pub fn greeting_part_two() -> String {
    "Great! I'm reaching out about the state-regulated final expense programs now \
     available in your area. It only takes a minute to see what you qualify for."
        .to_string()
}

/// Template reply asking the next unanswered question
pub fn next_question_for(key: QualKey) -> &'static str {
    match key {
        QualKey::VerifiedInfo => LadderQuestion::Verification.text(),
        QualKey::NoAlzheimers => LadderQuestion::Alzheimers.text(),
        QualKey::NoHospice => LadderQuestion::Hospice.text(),
        QualKey::AgeQualified => LadderQuestion::Age.text(),
        QualKey::HasBankAccount => LadderQuestion::BankAccount.text(),
    }
}

/// Template used when the transfer is confirmed
pub fn transfer_announcement() -> &'static str {
    "Perfect, one moment while I connect you with a licensed specialist. Please stay on the line."
}

/// Polite goodbye for disqualified or declining leads
pub fn goodbye() -> &'static str {
    "Thank you so much for your time today. Have a wonderful day. Goodbye!"
}

/// Defer line when the model promised a transfer it cannot make
pub fn polite_defer() -> &'static str {
    "Thank you for your patience. A specialist will follow up with you soon. Have a great day!"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_ladder_question_is_detected() {
        for q in [
            LadderQuestion::Verification,
            LadderQuestion::HealthDiscovery,
            LadderQuestion::Alzheimers,
            LadderQuestion::Hospice,
            LadderQuestion::Age,
            LadderQuestion::BankAccount,
            LadderQuestion::TransferConfirmation,
        ] {
            assert_eq!(question_in(q.text()), Some(q), "failed for {:?}", q);
        }
    }

    #[test]
    fn test_greeting_is_the_verification_question() {
        assert_eq!(
            question_in(&greeting("Terry")),
            Some(LadderQuestion::Verification)
        );
    }

    #[test]
    fn test_plain_statement_is_no_question() {
        assert_eq!(question_in("Thanks, that's all I needed."), None);
    }

    #[test]
    fn test_system_prompt_mentions_lead() {
        let prompt = system_prompt("Terry", "Hodges", Some("Sacramento"));
        assert!(prompt.contains("Terry Hodges"));
        assert!(prompt.contains("Sacramento"));
    }
}
