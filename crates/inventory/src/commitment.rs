use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use packline_core::{CommitmentId, ContentId, DomainError, Entity, OperationId, OperationLineId};

use crate::content::PackageContent;

/// Kind of operation a commitment was taken for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOperationType {
    Transfer,
    Counting,
    Receipt,
    Pick,
}

impl SourceOperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceOperationType::Transfer => "transfer",
            SourceOperationType::Counting => "counting",
            SourceOperationType::Receipt => "receipt",
            SourceOperationType::Pick => "pick",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "transfer" => Ok(SourceOperationType::Transfer),
            "counting" => Ok(SourceOperationType::Counting),
            "receipt" => Ok(SourceOperationType::Receipt),
            "pick" => Ok(SourceOperationType::Pick),
            other => Err(DomainError::validation(format!(
                "unknown source operation type: {other}"
            ))),
        }
    }
}

impl core::fmt::Display for SourceOperationType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Back-reference from a commitment to the operation line that created it.
///
/// Lookup only: the operation may be archived or deleted independently, and
/// the commitment stays releasable by its own id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceOperation {
    pub kind: SourceOperationType,
    pub operation_id: OperationId,
    pub line_id: OperationLineId,
}

/// A reservation of part of a content's quantity by an in-flight operation line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageCommitment {
    pub id: CommitmentId,
    pub content_id: ContentId,
    pub item_code: String,
    pub quantity: i64,
    pub source: SourceOperation,
    pub committed_at: DateTime<Utc>,
}

impl PackageCommitment {
    /// Build the commitment row for a reservation that `content` has already accepted.
    pub fn for_content(
        content: &PackageContent,
        quantity: i64,
        source: SourceOperation,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if quantity <= 0 {
            return Err(DomainError::validation("commitment quantity must be positive"));
        }
        Ok(Self {
            id: CommitmentId::new(),
            content_id: *content.id(),
            item_code: content.item_code().to_string(),
            quantity,
            source,
            committed_at: now,
        })
    }
}

impl Entity for PackageCommitment {
    type Id = CommitmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packline_core::PackageId;

    #[test]
    fn commitment_copies_item_code_from_content() {
        let content = PackageContent::new(PackageId::new(), "SKU-9", 5, Utc::now()).unwrap();
        let source = SourceOperation {
            kind: SourceOperationType::Pick,
            operation_id: OperationId::new(),
            line_id: OperationLineId::new(),
        };
        let c = PackageCommitment::for_content(&content, 3, source, Utc::now()).unwrap();
        assert_eq!(c.item_code, "SKU-9");
        assert_eq!(c.content_id, *content.id());
        assert_eq!(c.source.kind.as_str(), "pick");
    }

    #[test]
    fn source_type_parse_rejects_unknown() {
        assert!(SourceOperationType::parse("transfer").is_ok());
        assert!(SourceOperationType::parse("delivery").is_err());
    }
}
