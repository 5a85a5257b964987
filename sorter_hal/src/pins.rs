//! Pin ownership registry.
//!
//! Every GPIO pin is owned by exactly one component. All claims happen at
//! startup; a duplicate claim refuses initialization with the owner and
//! the claimant named, so wiring mistakes surface before any output is
//! driven. Immutable after construction.

use std::collections::HashMap;

use crate::gpio::HalError;

/// Startup pin-claim registry.
#[derive(Debug, Default)]
pub struct PinRegistry {
    claims: HashMap<u8, String>,
}

impl PinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a pin for `owner`. Fails if any component already owns it.
    pub fn claim(&mut self, pin: u8, owner: impl Into<String>) -> Result<(), HalError> {
        let claimant = owner.into();
        if let Some(existing) = self.claims.get(&pin) {
            return Err(HalError::PinConflict {
                pin,
                owner: existing.clone(),
                claimant,
            });
        }
        self.claims.insert(pin, claimant);
        Ok(())
    }

    /// Claim a batch of `(pin, owner)` pairs; stops at the first conflict.
    pub fn claim_all<I>(&mut self, claims: I) -> Result<(), HalError>
    where
        I: IntoIterator<Item = (u8, String)>,
    {
        for (pin, owner) in claims {
            self.claim(pin, owner)?;
        }
        Ok(())
    }

    /// Owner of a pin, if claimed.
    pub fn owner(&self, pin: u8) -> Option<&str> {
        self.claims.get(&pin).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_and_lookup() {
        let mut registry = PinRegistry::new();
        registry.claim(17, "safety.e_stop").unwrap();
        assert_eq!(registry.owner(17), Some("safety.e_stop"));
        assert_eq!(registry.owner(18), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_claim_names_both_parties() {
        let mut registry = PinRegistry::new();
        registry.claim(22, "sensors.camera_trigger").unwrap();
        let err = registry.claim(22, "diverter:metal.step").unwrap_err();
        match err {
            HalError::PinConflict {
                pin,
                owner,
                claimant,
            } => {
                assert_eq!(pin, 22);
                assert_eq!(owner, "sensors.camera_trigger");
                assert_eq!(claimant, "diverter:metal.step");
            }
            other => panic!("expected PinConflict, got {other}"),
        }
    }

    #[test]
    fn claim_all_stops_at_first_conflict() {
        let mut registry = PinRegistry::new();
        let result = registry.claim_all(vec![
            (1, "a".to_string()),
            (2, "b".to_string()),
            (1, "c".to_string()),
            (3, "d".to_string()),
        ]);
        assert!(result.is_err());
        // The conflicting claim and everything after it are rejected.
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.owner(3), None);
    }
}
