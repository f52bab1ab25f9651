//! Qualification tracking
//!
//! Five fixed keys, each a three-valued answer. Keys are monotonic within a
//! call: once a key leaves `Unset` it never changes again. The dialogue
//! stage is a pure function of the map.

use serde::{Deserialize, Serialize};

/// Three-valued qualification answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualAnswer {
    #[default]
    Unset,
    No,
    Yes,
}

impl QualAnswer {
    pub fn from_bool(value: bool) -> Self {
        if value {
            QualAnswer::Yes
        } else {
            QualAnswer::No
        }
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, QualAnswer::Unset)
    }
}

/// The five qualification keys, in ladder order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualKey {
    VerifiedInfo,
    NoAlzheimers,
    NoHospice,
    AgeQualified,
    HasBankAccount,
}

/// Per-call qualification record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualificationMap {
    pub verified_info: QualAnswer,
    pub no_alzheimers: QualAnswer,
    pub no_hospice: QualAnswer,
    pub age_qualified: QualAnswer,
    pub has_bank_account: QualAnswer,
}

impl QualificationMap {
    pub fn get(&self, key: QualKey) -> QualAnswer {
        match key {
            QualKey::VerifiedInfo => self.verified_info,
            QualKey::NoAlzheimers => self.no_alzheimers,
            QualKey::NoHospice => self.no_hospice,
            QualKey::AgeQualified => self.age_qualified,
            QualKey::HasBankAccount => self.has_bank_account,
        }
    }

    /// Set a key, enforcing monotonicity: an already-answered key keeps its
    /// first answer and the conflicting write is dropped with a warning.
    pub fn set(&mut self, key: QualKey, value: QualAnswer) {
        if value == QualAnswer::Unset {
            return;
        }
        let slot = match key {
            QualKey::VerifiedInfo => &mut self.verified_info,
            QualKey::NoAlzheimers => &mut self.no_alzheimers,
            QualKey::NoHospice => &mut self.no_hospice,
            QualKey::AgeQualified => &mut self.age_qualified,
            QualKey::HasBankAccount => &mut self.has_bank_account,
        };
        if slot.is_set() && *slot != value {
            tracing::warn!(?key, current = ?slot, attempted = ?value,
                "Dropping conflicting qualification update");
            return;
        }
        *slot = value;
    }

    pub fn all_yes(&self) -> bool {
        [
            self.verified_info,
            self.no_alzheimers,
            self.no_hospice,
            self.age_qualified,
            self.has_bank_account,
        ]
        .iter()
        .all(|a| *a == QualAnswer::Yes)
    }

    pub fn any_no(&self) -> bool {
        [
            self.verified_info,
            self.no_alzheimers,
            self.no_hospice,
            self.age_qualified,
            self.has_bank_account,
        ]
        .iter()
        .any(|a| *a == QualAnswer::No)
    }

    /// First qualification key (after verification) still unanswered
    pub fn next_unanswered(&self) -> Option<QualKey> {
        [
            (QualKey::NoAlzheimers, self.no_alzheimers),
            (QualKey::NoHospice, self.no_hospice),
            (QualKey::AgeQualified, self.age_qualified),
            (QualKey::HasBankAccount, self.has_bank_account),
        ]
        .into_iter()
        .find(|(_, a)| !a.is_set())
        .map(|(k, _)| k)
    }
}

/// Dialogue stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DialogueStage {
    #[default]
    Greeting,
    Verification,
    VerificationFailed,
    Qualifying,
    Disqualified,
    Qualified,
    Error,
}

impl DialogueStage {
    /// Derive the stage from the qualification map. Pure.
    pub fn from_map(map: &QualificationMap) -> Self {
        if map.verified_info == QualAnswer::No {
            return DialogueStage::VerificationFailed;
        }
        if map.any_no() {
            return DialogueStage::Disqualified;
        }
        if map.all_yes() {
            return DialogueStage::Qualified;
        }
        if map.verified_info == QualAnswer::Yes {
            return DialogueStage::Qualifying;
        }
        DialogueStage::Verification
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DialogueStage::Greeting => "greeting",
            DialogueStage::Verification => "verification",
            DialogueStage::VerificationFailed => "verification_failed",
            DialogueStage::Qualifying => "qualifying",
            DialogueStage::Disqualified => "disqualified",
            DialogueStage::Qualified => "qualified",
            DialogueStage::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_starts_at_verification() {
        let map = QualificationMap::default();
        assert_eq!(DialogueStage::from_map(&map), DialogueStage::Verification);
    }

    #[test]
    fn test_stage_verification_failed() {
        let mut map = QualificationMap::default();
        map.set(QualKey::VerifiedInfo, QualAnswer::No);
        assert_eq!(
            DialogueStage::from_map(&map),
            DialogueStage::VerificationFailed
        );
    }

    #[test]
    fn test_stage_disqualified_on_any_no() {
        let mut map = QualificationMap::default();
        map.set(QualKey::VerifiedInfo, QualAnswer::Yes);
        map.set(QualKey::NoAlzheimers, QualAnswer::No);
        assert_eq!(DialogueStage::from_map(&map), DialogueStage::Disqualified);
    }

    #[test]
    fn test_stage_qualifying_then_qualified() {
        let mut map = QualificationMap::default();
        map.set(QualKey::VerifiedInfo, QualAnswer::Yes);
        assert_eq!(DialogueStage::from_map(&map), DialogueStage::Qualifying);

        map.set(QualKey::NoAlzheimers, QualAnswer::Yes);
        map.set(QualKey::NoHospice, QualAnswer::Yes);
        map.set(QualKey::AgeQualified, QualAnswer::Yes);
        assert_eq!(DialogueStage::from_map(&map), DialogueStage::Qualifying);

        map.set(QualKey::HasBankAccount, QualAnswer::Yes);
        assert_eq!(DialogueStage::from_map(&map), DialogueStage::Qualified);
    }

    #[test]
    fn test_keys_do_not_flip() {
        let mut map = QualificationMap::default();
        map.set(QualKey::AgeQualified, QualAnswer::Yes);
        map.set(QualKey::AgeQualified, QualAnswer::No);
        assert_eq!(map.age_qualified, QualAnswer::Yes);

        map.set(QualKey::NoHospice, QualAnswer::No);
        map.set(QualKey::NoHospice, QualAnswer::Yes);
        assert_eq!(map.no_hospice, QualAnswer::No);
    }

    #[test]
    fn test_unset_write_is_ignored() {
        let mut map = QualificationMap::default();
        map.set(QualKey::VerifiedInfo, QualAnswer::Unset);
        assert_eq!(map.verified_info, QualAnswer::Unset);
    }

    #[test]
    fn test_next_unanswered_order() {
        let mut map = QualificationMap::default();
        map.set(QualKey::VerifiedInfo, QualAnswer::Yes);
        assert_eq!(map.next_unanswered(), Some(QualKey::NoAlzheimers));
        map.set(QualKey::NoAlzheimers, QualAnswer::Yes);
        assert_eq!(map.next_unanswered(), Some(QualKey::NoHospice));
        map.set(QualKey::NoHospice, QualAnswer::Yes);
        map.set(QualKey::AgeQualified, QualAnswer::Yes);
        assert_eq!(map.next_unanswered(), Some(QualKey::HasBankAccount));
        map.set(QualKey::HasBankAccount, QualAnswer::Yes);
        assert_eq!(map.next_unanswered(), None);
    }
}
