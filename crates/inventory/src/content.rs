use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use packline_core::{ContentId, DomainError, Entity, PackageId};

/// Quantity of one item code held in a package.
///
/// Invariant: `0 <= committed_quantity <= quantity`. Every mutating method
/// either applies completely or leaves the value untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageContent {
    id: ContentId,
    package_id: PackageId,
    item_code: String,
    quantity: i64,
    committed_quantity: i64,
    updated_at: DateTime<Utc>,
}

impl PackageContent {
    pub fn new(
        package_id: PackageId,
        item_code: impl Into<String>,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let item_code = item_code.into();
        if item_code.trim().is_empty() {
            return Err(DomainError::validation("item code cannot be empty"));
        }
        if quantity < 0 {
            return Err(DomainError::validation("quantity cannot be negative"));
        }
        Ok(Self {
            id: ContentId::new(),
            package_id,
            item_code,
            quantity,
            committed_quantity: 0,
            updated_at: now,
        })
    }

    /// Rebuild a content from persisted columns, re-checking the invariant.
    pub fn from_parts(
        id: ContentId,
        package_id: PackageId,
        item_code: String,
        quantity: i64,
        committed_quantity: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let content = Self {
            id,
            package_id,
            item_code,
            quantity,
            committed_quantity,
            updated_at,
        };
        content.check_invariant()?;
        Ok(content)
    }

    pub fn package_id(&self) -> PackageId {
        self.package_id
    }

    pub fn item_code(&self) -> &str {
        &self.item_code
    }

    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn committed_quantity(&self) -> i64 {
        self.committed_quantity
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Quantity not yet reserved by any commitment.
    pub fn available(&self) -> i64 {
        self.quantity - self.committed_quantity
    }

    pub fn check_invariant(&self) -> Result<(), DomainError> {
        if self.committed_quantity < 0 || self.committed_quantity > self.quantity {
            return Err(DomainError::invariant(format!(
                "content {} has committed {} of {}",
                self.id, self.committed_quantity, self.quantity
            )));
        }
        Ok(())
    }

    /// Reserve `quantity` for a new commitment.
    pub fn reserve(&mut self, quantity: i64, now: DateTime<Utc>) -> Result<(), DomainError> {
        if quantity <= 0 {
            return Err(DomainError::validation("commit quantity must be positive"));
        }
        if quantity > self.available() {
            return Err(DomainError::invariant(format!(
                "insufficient available quantity for {}: requested {}, available {}",
                self.item_code,
                quantity,
                self.available()
            )));
        }
        self.committed_quantity += quantity;
        self.updated_at = now;
        Ok(())
    }

    /// Give back a reservation without touching the physical quantity.
    pub fn release(&mut self, quantity: i64, now: DateTime<Utc>) -> Result<(), DomainError> {
        if quantity <= 0 {
            return Err(DomainError::validation("release quantity must be positive"));
        }
        if quantity > self.committed_quantity {
            return Err(DomainError::invariant(format!(
                "content {} cannot release {} with only {} committed",
                self.id, quantity, self.committed_quantity
            )));
        }
        self.committed_quantity -= quantity;
        self.updated_at = now;
        Ok(())
    }

    /// Retire a reservation of `reserved`, removing `actual` units from the package.
    ///
    /// `reserved - actual` is released back to the available quantity.
    pub fn consume(&mut self, reserved: i64, actual: i64, now: DateTime<Utc>) -> Result<(), DomainError> {
        if actual < 0 {
            return Err(DomainError::validation("consumed quantity cannot be negative"));
        }
        if actual > reserved {
            return Err(DomainError::validation(format!(
                "cannot consume {actual}, only {reserved} reserved"
            )));
        }
        if reserved > self.committed_quantity {
            return Err(DomainError::invariant(format!(
                "content {} cannot retire {} with only {} committed",
                self.id, reserved, self.committed_quantity
            )));
        }
        self.committed_quantity -= reserved;
        self.quantity -= actual;
        self.updated_at = now;
        Ok(())
    }

    /// Add received stock.
    pub fn receive(&mut self, quantity: i64, now: DateTime<Utc>) -> Result<(), DomainError> {
        if quantity <= 0 {
            return Err(DomainError::validation("received quantity must be positive"));
        }
        self.quantity = self
            .quantity
            .checked_add(quantity)
            .ok_or_else(|| DomainError::validation("quantity overflow"))?;
        self.updated_at = now;
        Ok(())
    }
}

impl Entity for PackageContent {
    type Id = ContentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn content(quantity: i64) -> PackageContent {
        PackageContent::new(PackageId::new(), "ITEM-1", quantity, Utc::now()).unwrap()
    }

    #[test]
    fn reserve_up_to_available() {
        let mut c = content(10);
        c.reserve(6, Utc::now()).unwrap();
        assert_eq!(c.available(), 4);

        let err = c.reserve(5, Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(c.committed_quantity(), 6, "failed reserve must not change state");
    }

    #[test]
    fn reserve_rejects_non_positive() {
        let mut c = content(10);
        assert!(matches!(c.reserve(0, Utc::now()), Err(DomainError::Validation(_))));
        assert!(matches!(c.reserve(-3, Utc::now()), Err(DomainError::Validation(_))));
    }

    #[test]
    fn consume_less_than_reserved_releases_remainder() {
        let mut c = content(24);
        c.reserve(24, Utc::now()).unwrap();
        c.consume(24, 20, Utc::now()).unwrap();
        assert_eq!(c.quantity(), 4);
        assert_eq!(c.committed_quantity(), 0);
        assert_eq!(c.available(), 4);
    }

    #[test]
    fn consume_more_than_reserved_is_rejected() {
        let mut c = content(24);
        c.reserve(10, Utc::now()).unwrap();
        assert!(matches!(
            c.consume(10, 11, Utc::now()),
            Err(DomainError::Validation(_))
        ));
        assert_eq!(c.quantity(), 24);
        assert_eq!(c.committed_quantity(), 10);
    }

    #[test]
    fn from_parts_rechecks_invariant() {
        let err = PackageContent::from_parts(
            ContentId::new(),
            PackageId::new(),
            "ITEM-1".to_string(),
            5,
            6,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Reserve(i64),
        Release(usize),
        Consume(usize, i64),
        Receive(i64),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (1i64..50).prop_map(Step::Reserve),
            (0usize..8).prop_map(Step::Release),
            ((0usize..8), (0i64..50)).prop_map(|(i, a)| Step::Consume(i, a)),
            (1i64..50).prop_map(Step::Receive),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence of operations is attempted, the
        /// committed quantity equals the sum of live reservations and never
        /// exceeds the physical quantity.
        #[test]
        fn committed_tracks_live_reservations(
            initial in 0i64..100,
            steps in prop::collection::vec(step(), 1..40)
        ) {
            let mut c = content(initial);
            let mut live: Vec<i64> = Vec::new();

            for s in steps {
                let now = Utc::now();
                match s {
                    Step::Reserve(q) => {
                        if c.reserve(q, now).is_ok() {
                            live.push(q);
                        }
                    }
                    Step::Release(i) => {
                        if !live.is_empty() {
                            let q = live.remove(i % live.len());
                            c.release(q, now).unwrap();
                        }
                    }
                    Step::Consume(i, actual) => {
                        if !live.is_empty() {
                            let idx = i % live.len();
                            let q = live[idx];
                            if c.consume(q, actual, now).is_ok() {
                                live.remove(idx);
                            }
                        }
                    }
                    Step::Receive(q) => {
                        c.receive(q, now).unwrap();
                    }
                }

                prop_assert!(c.check_invariant().is_ok());
                prop_assert_eq!(c.committed_quantity(), live.iter().sum::<i64>());
            }
        }
    }
}
