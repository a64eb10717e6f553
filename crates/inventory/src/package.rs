use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use packline_core::{DomainError, Entity, PackageId};

/// Lifecycle of a physical container.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    /// Being built; may receive stock but not be reserved against.
    Init,
    /// In use.
    Active,
    /// Emptied and retired.
    Closed,
    /// Voided before use.
    Cancelled,
    /// Temporarily frozen (e.g. under inspection).
    Locked,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Init => "init",
            PackageStatus::Active => "active",
            PackageStatus::Closed => "closed",
            PackageStatus::Cancelled => "cancelled",
            PackageStatus::Locked => "locked",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "init" => Ok(PackageStatus::Init),
            "active" => Ok(PackageStatus::Active),
            "closed" => Ok(PackageStatus::Closed),
            "cancelled" => Ok(PackageStatus::Cancelled),
            "locked" => Ok(PackageStatus::Locked),
            other => Err(DomainError::validation(format!(
                "unknown package status: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PackageStatus::Closed | PackageStatus::Cancelled)
    }

    /// Whether `self -> next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: PackageStatus) -> bool {
        use PackageStatus::*;
        matches!(
            (self, next),
            (Init, Active)
                | (Active, Locked)
                | (Locked, Active)
                | (Active, Closed)
                | (Init, Cancelled)
                | (Active, Cancelled)
                | (Locked, Cancelled)
        )
    }
}

impl core::fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed metadata value attached to a package.
///
/// Schema validation of metadata keys happens outside the ledger; the ledger
/// only stores what it is given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetadataValue {
    Text(String),
    Integer(i64),
    /// Decimal kept in its textual form so no precision is lost in transit.
    Decimal(String),
    Date(NaiveDate),
    Flag(bool),
}

pub type PackageMetadata = BTreeMap<String, MetadataValue>;

/// A physical container of stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub id: PackageId,
    pub barcode: String,
    pub warehouse_code: String,
    pub status: PackageStatus,
    pub metadata: PackageMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Package {
    pub fn new(
        barcode: impl Into<String>,
        warehouse_code: impl Into<String>,
        metadata: PackageMetadata,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let barcode = barcode.into();
        let warehouse_code = warehouse_code.into();
        if barcode.trim().is_empty() {
            return Err(DomainError::validation("barcode cannot be empty"));
        }
        if warehouse_code.trim().is_empty() {
            return Err(DomainError::validation("warehouse code cannot be empty"));
        }
        Ok(Self {
            id: PackageId::new(),
            barcode,
            warehouse_code,
            status: PackageStatus::Init,
            metadata,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn transition_to(&mut self, next: PackageStatus, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(DomainError::validation(format!(
                "package {} cannot move from {} to {}",
                self.barcode, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// New reservations are only taken against packages in use.
    pub fn ensure_accepts_commitments(&self) -> Result<(), DomainError> {
        if self.status != PackageStatus::Active {
            return Err(DomainError::validation(format!(
                "package {} is {}, commitments require an active package",
                self.barcode, self.status
            )));
        }
        Ok(())
    }

    pub fn ensure_accepts_stock(&self) -> Result<(), DomainError> {
        match self.status {
            PackageStatus::Init | PackageStatus::Active => Ok(()),
            other => Err(DomainError::validation(format!(
                "package {} is {}, it cannot receive stock",
                self.barcode, other
            ))),
        }
    }
}

impl Entity for Package {
    type Id = PackageId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package() -> Package {
        Package::new("PKG-0001", "WH01", PackageMetadata::new(), Utc::now()).unwrap()
    }

    #[test]
    fn new_package_starts_in_init() {
        let p = package();
        assert_eq!(p.status, PackageStatus::Init);
        assert!(p.ensure_accepts_stock().is_ok());
        assert!(p.ensure_accepts_commitments().is_err());
    }

    #[test]
    fn empty_barcode_is_rejected() {
        let err = Package::new("  ", "WH01", PackageMetadata::new(), Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn lifecycle_follows_transition_table() {
        let mut p = package();
        let now = Utc::now();

        p.transition_to(PackageStatus::Active, now).unwrap();
        assert!(p.ensure_accepts_commitments().is_ok());

        p.transition_to(PackageStatus::Locked, now).unwrap();
        assert!(p.ensure_accepts_commitments().is_err());
        assert!(p.ensure_accepts_stock().is_err());

        p.transition_to(PackageStatus::Active, now).unwrap();
        p.transition_to(PackageStatus::Closed, now).unwrap();

        // Closed is terminal.
        assert!(p.transition_to(PackageStatus::Active, now).is_err());
        assert!(p.status.is_terminal());
    }

    #[test]
    fn init_cannot_be_closed_directly() {
        let mut p = package();
        assert!(p.transition_to(PackageStatus::Closed, Utc::now()).is_err());
    }

    #[test]
    fn status_string_round_trip() {
        for s in [
            PackageStatus::Init,
            PackageStatus::Active,
            PackageStatus::Closed,
            PackageStatus::Cancelled,
            PackageStatus::Locked,
        ] {
            assert_eq!(PackageStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(PackageStatus::parse("lost").is_err());
    }

    #[test]
    fn metadata_serializes_with_type_tags() {
        let mut p = package();
        p.metadata
            .insert("lot".to_string(), MetadataValue::Text("L-77".to_string()));
        p.metadata.insert("weight".to_string(), MetadataValue::Decimal("12.50".to_string()));

        let json = serde_json::to_value(&p.metadata).unwrap();
        assert_eq!(json["lot"]["type"], "text");
        assert_eq!(json["weight"]["value"], "12.50");
    }
}
