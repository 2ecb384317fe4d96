//! Document entity - the central record of the contract workflow
//!
//! A document moves through the signing lifecycle:
//! requested -> drafted -> rendered -> sent -> signed -> indexed,
//! with declined and failed as alternative terminal outcomes.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Requester role. Closed set; unknown role strings are rejected at the
/// boundary rather than dispatched dynamically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Provider,
    Insurer,
    Pharmacy,
    Administrator,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Patient,
        Role::Provider,
        Role::Insurer,
        Role::Pharmacy,
        Role::Administrator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Provider => "provider",
            Role::Insurer => "insurer",
            Role::Pharmacy => "pharmacy",
            Role::Administrator => "administrator",
        }
    }
}

impl TryFrom<&str> for Role {
    type Error = AppError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_ascii_lowercase().as_str() {
            "patient" => Ok(Role::Patient),
            "provider" => Ok(Role::Provider),
            "insurer" => Ok(Role::Insurer),
            "pharmacy" => Ok(Role::Pharmacy),
            "administrator" => Ok(Role::Administrator),
            other => Err(AppError::UnknownRole { role: other.into() }),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    Requested,
    Drafted,
    Rendered,
    Sent,
    Signed,
    Declined,
    Failed,
    Indexed,
}

impl DocumentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentState::Requested => "requested",
            DocumentState::Drafted => "drafted",
            DocumentState::Rendered => "rendered",
            DocumentState::Sent => "sent",
            DocumentState::Signed => "signed",
            DocumentState::Declined => "declined",
            DocumentState::Failed => "failed",
            DocumentState::Indexed => "indexed",
        }
    }

    /// States with no further workflow activity. Signed is not terminal:
    /// it still proceeds to indexed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentState::Declined | DocumentState::Failed | DocumentState::Indexed
        )
    }

    /// Monotonic position in the lifecycle, used to ignore stale status
    /// events during reconciliation. Signed and declined are alternative
    /// outcomes at the same depth.
    pub fn rank(&self) -> u8 {
        match self {
            DocumentState::Requested => 0,
            DocumentState::Drafted => 1,
            DocumentState::Rendered => 2,
            DocumentState::Sent => 3,
            DocumentState::Signed | DocumentState::Declined => 4,
            DocumentState::Indexed => 5,
            DocumentState::Failed => 6,
        }
    }

    /// The transition table. Failed is reachable from every non-terminal
    /// state; everything else is a single forward step.
    pub fn can_transition(&self, to: DocumentState) -> bool {
        if to == DocumentState::Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (DocumentState::Requested, DocumentState::Drafted)
                | (DocumentState::Drafted, DocumentState::Rendered)
                | (DocumentState::Rendered, DocumentState::Sent)
                | (DocumentState::Sent, DocumentState::Signed)
                | (DocumentState::Sent, DocumentState::Declined)
                | (DocumentState::Signed, DocumentState::Indexed)
        )
    }
}

impl TryFrom<&str> for DocumentState {
    type Error = AppError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "requested" => Ok(DocumentState::Requested),
            "drafted" => Ok(DocumentState::Drafted),
            "rendered" => Ok(DocumentState::Rendered),
            "sent" => Ok(DocumentState::Sent),
            "signed" => Ok(DocumentState::Signed),
            "declined" => Ok(DocumentState::Declined),
            "failed" => Ok(DocumentState::Failed),
            "indexed" => Ok(DocumentState::Indexed),
            other => Err(AppError::Internal {
                message: format!("unknown document state: {}", other),
            }),
        }
    }
}

impl std::fmt::Display for DocumentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "documents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub role: String,

    #[sea_orm(column_type = "Text")]
    pub template_id: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub content: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub rendered_blob_ref: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub envelope_id: Option<String>,

    #[sea_orm(column_type = "Text")]
    pub state: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    pub metadata: Json,

    /// Optimistic-concurrency counter, bumped on every persisted update
    pub version: i32,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Build a fresh document in the requested state
    pub fn new(role: Role, template_id: &str, metadata: serde_json::Value) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            role: role.as_str().to_string(),
            template_id: template_id.to_string(),
            content: None,
            rendered_blob_ref: None,
            envelope_id: None,
            state: DocumentState::Requested.as_str().to_string(),
            error_message: None,
            metadata,
            version: 1,
            created_at: now.into(),
            updated_at: now.into(),
        }
    }

    /// Get the typed role. Records are only written through the boundary
    /// that validates roles, so stored values parse.
    pub fn role(&self) -> Result<Role, AppError> {
        Role::try_from(self.role.as_str())
    }

    /// Get the typed lifecycle state. A corrupted stored state is treated
    /// as failed so no further transitions are applied to the record.
    pub fn document_state(&self) -> DocumentState {
        DocumentState::try_from(self.state.as_str()).unwrap_or(DocumentState::Failed)
    }

    /// Check if the document is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.document_state().is_terminal()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in Role::ALL {
            assert_eq!(Role::try_from(role.as_str()).unwrap(), role);
        }
        assert!(Role::try_from("Patient").is_ok());
        assert!(matches!(
            Role::try_from("wizard"),
            Err(AppError::UnknownRole { .. })
        ));
    }

    #[test]
    fn test_transition_table_forward_steps() {
        use DocumentState::*;
        assert!(Requested.can_transition(Drafted));
        assert!(Drafted.can_transition(Rendered));
        assert!(Rendered.can_transition(Sent));
        assert!(Sent.can_transition(Signed));
        assert!(Sent.can_transition(Declined));
        assert!(Signed.can_transition(Indexed));
    }

    #[test]
    fn test_transition_table_rejects_skips() {
        use DocumentState::*;
        assert!(!Requested.can_transition(Sent));
        assert!(!Requested.can_transition(Rendered));
        assert!(!Drafted.can_transition(Sent));
        assert!(!Rendered.can_transition(Signed));
        assert!(!Sent.can_transition(Indexed));
        assert!(!Declined.can_transition(Signed));
    }

    #[test]
    fn test_failed_reachable_from_non_terminal_only() {
        use DocumentState::*;
        for state in [Requested, Drafted, Rendered, Sent, Signed] {
            assert!(state.can_transition(Failed), "{state} should be able to fail");
        }
        for state in [Declined, Failed, Indexed] {
            assert!(!state.can_transition(Failed), "{state} is terminal");
        }
    }

    #[test]
    fn test_rank_is_monotonic_along_happy_path() {
        use DocumentState::*;
        let path = [Requested, Drafted, Rendered, Sent, Signed, Indexed];
        for pair in path.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
        // Alternative outcomes share a depth
        assert_eq!(Signed.rank(), Declined.rank());
    }

    #[test]
    fn test_new_document_state_and_invariants() {
        let doc = Model::new(Role::Patient, "T1", serde_json::json!({"requester": "r-1"}));
        assert_eq!(doc.document_state(), DocumentState::Requested);
        assert_eq!(doc.version, 1);
        assert!(doc.content.is_none());
        assert!(doc.rendered_blob_ref.is_none());
        assert!(doc.envelope_id.is_none());
        assert_eq!(doc.role().unwrap(), Role::Patient);
    }
}
