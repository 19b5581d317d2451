use serde::{Deserialize, Serialize};

/// Staff privilege level.
///
/// `Super` is never implied by any other role; it is granted explicitly in the
/// session token and every use of it is audited as an escalation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffRole {
    #[default]
    Standard,
    Super,
}

impl StaffRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StaffRole::Standard => "standard",
            StaffRole::Super => "super",
        }
    }
}

impl core::fmt::Display for StaffRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
