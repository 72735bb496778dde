//! Common types used across Subsync

use serde::{Deserialize, Serialize};

/// Billing permissions carried in access tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewBilling,
    ManageBilling,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ViewBilling => "view_billing",
            Permission::ManageBilling => "manage_billing",
        }
    }

    /// Whether holding `self` also grants `other`
    pub fn implies(&self, other: Permission) -> bool {
        matches!(
            (self, other),
            (Permission::ManageBilling, _) | (Permission::ViewBilling, Permission::ViewBilling)
        )
    }
}

impl std::str::FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view_billing" => Ok(Permission::ViewBilling),
            "manage_billing" => Ok(Permission::ManageBilling),
            other => Err(format!("unknown permission: {}", other)),
        }
    }
}
