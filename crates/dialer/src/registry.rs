//! Active-phone registry
//!
//! Process-wide map from normalized recipient phone (digits only) to the
//! call currently dialling it. Enforces at-most-one concurrent outbound
//! attempt per recipient. Release is idempotent and runs on every
//! dispatcher exit path.

use dashmap::DashMap;

use outdial_core::phone::digits_only;

use crate::DialerError;

/// Phone -> owning call id (or reservation tag before origination)
#[derive(Default)]
pub struct ActivePhoneRegistry {
    entries: DashMap<String, String>,
}

impl ActivePhoneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically reserve a phone for dialling.
    ///
    /// `owner` is a reservation tag until the carrier assigns a call id;
    /// use [`associate`](Self::associate) to swap it once known.
    pub fn try_reserve(&self, phone: &str, owner: &str) -> Result<(), DialerError> {
        let key = digits_only(phone);
        match self.entries.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => Err(DialerError::AlreadyDialing {
                phone: key,
                existing_call_id: existing.get().clone(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(owner.to_string());
                Ok(())
            }
        }
    }

    /// Attach the carrier call id to an existing reservation
    pub fn associate(&self, phone: &str, call_id: &str) {
        let key = digits_only(phone);
        if let Some(mut entry) = self.entries.get_mut(&key) {
            *entry = call_id.to_string();
        }
    }

    /// The call currently dialling this phone, if any
    pub fn owner_of(&self, phone: &str) -> Option<String> {
        self.entries.get(&digits_only(phone)).map(|e| e.clone())
    }

    /// Idempotent release
    pub fn release(&self, phone: &str) {
        self.entries.remove(&digits_only(phone));
    }

    /// Release by owning call id, for teardown paths that only know the call
    pub fn release_by_call(&self, call_id: &str) {
        self.entries.retain(|_, owner| owner.as_str() != call_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_release_round_trip() {
        let registry = ActivePhoneRegistry::new();
        registry.try_reserve("+15307748286", "r-1").unwrap();
        assert_eq!(registry.len(), 1);

        registry.release("+15307748286");
        assert!(registry.is_empty());
        // Release is idempotent
        registry.release("+15307748286");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_reservation_rejected() {
        let registry = ActivePhoneRegistry::new();
        registry.try_reserve("+15307748286", "r-1").unwrap();
        // Same number in a different format still collides
        let err = registry.try_reserve("(530) 774-8286", "r-2").unwrap_err();
        match err {
            DialerError::AlreadyDialing {
                existing_call_id, ..
            } => assert_eq!(existing_call_id, "r-1"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_associate_swaps_owner() {
        let registry = ActivePhoneRegistry::new();
        registry.try_reserve("+15307748286", "r-1").unwrap();
        registry.associate("+15307748286", "cc-42");
        assert_eq!(
            registry.owner_of("15307748286").as_deref(),
            Some("cc-42")
        );
    }

    #[test]
    fn test_release_by_call() {
        let registry = ActivePhoneRegistry::new();
        registry.try_reserve("+15307748286", "cc-1").unwrap();
        registry.try_reserve("+15305550000", "cc-2").unwrap();
        registry.release_by_call("cc-1");
        assert_eq!(registry.len(), 1);
        assert!(registry.owner_of("+15305550000").is_some());
    }
}
