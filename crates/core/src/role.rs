//! Actor roles relevant to the closure workflow.

use serde::{Deserialize, Serialize};

/// Role of the user submitting a closure.
///
/// Technicians submit closures for approval; managers and admins close tickets
/// directly.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Technician,
    Manager,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Technician => "technician",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }

    /// Whether this role may move a ticket straight to `closed`.
    pub fn can_close_directly(&self) -> bool {
        matches!(self, Role::Manager | Role::Admin)
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
