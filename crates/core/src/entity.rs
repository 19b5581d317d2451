//! Kinds of lifecycle-managed entities.

use serde::{Deserialize, Serialize};

/// The three entity kinds whose status is governed by a transition table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Engagement,
    Document,
    TaxForm,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Engagement => "engagement",
            EntityKind::Document => "document",
            EntityKind::TaxForm => "tax_form",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "engagement" => Some(EntityKind::Engagement),
            "document" => Some(EntityKind::Document),
            "tax_form" => Some(EntityKind::TaxForm),
            _ => None,
        }
    }
}

impl core::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
