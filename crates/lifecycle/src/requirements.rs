//! Conditional sub-section requirements for tax-form submission.
//!
//! A form carries boolean flags (e.g. `hasForeignProperty`) and free-form JSON
//! sections. Each [`Requirement`] says: when `flag` is true, `section` must be
//! present and non-empty. A missing flag counts as false.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationFailure;

/// Content of a tax form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormData {
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub sections: BTreeMap<String, Value>,
}

impl FormData {
    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    /// A section counts as present when it is non-null and, for arrays,
    /// objects and strings, non-empty.
    pub fn has_section(&self, name: &str) -> bool {
        match self.sections.get(name) {
            None | Some(Value::Null) => false,
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::Object(fields)) => !fields.is_empty(),
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        }
    }
}

/// One row of the requirement table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub flag: String,
    pub section: String,
}

impl Requirement {
    pub fn new(flag: impl Into<String>, section: impl Into<String>) -> Self {
        Self {
            flag: flag.into(),
            section: section.into(),
        }
    }
}

/// Ordered flag → section rules, evaluated once per submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementTable {
    rules: Vec<Requirement>,
}

impl RequirementTable {
    pub fn new(rules: Vec<Requirement>) -> Self {
        Self { rules }
    }

    /// The rules the filing workflow ships with.
    pub fn standard() -> Self {
        Self::new(vec![
            Requirement::new("hasForeignProperty", "foreignProperties"),
            Requirement::new("hasDependents", "dependents"),
            Requirement::new("hasRentalIncome", "rentalProperties"),
            Requirement::new("hasForeignIncome", "foreignIncome"),
            Requirement::new("isSelfEmployed", "businessIncome"),
            Requirement::new("hasCapitalGains", "capitalTransactions"),
        ])
    }

    pub fn rules(&self) -> &[Requirement] {
        &self.rules
    }

    /// Check `data` against every rule.
    ///
    /// Fails on the first missing section in table order; the error also lists
    /// every other missing section.
    pub fn validate(&self, data: &FormData) -> Result<(), ValidationFailure> {
        let unmet: Vec<&Requirement> = self
            .rules
            .iter()
            .filter(|r| data.flag(&r.flag) && !data.has_section(&r.section))
            .collect();

        let Some(first) = unmet.first() else {
            return Ok(());
        };

        Err(ValidationFailure {
            field: first.section.clone(),
            flag: first.flag.clone(),
            flag_value: true,
            missing: unmet.iter().map(|r| r.section.clone()).collect(),
        })
    }
}

impl Default for RequirementTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn form(flags: &[(&str, bool)], sections: &[(&str, Value)]) -> FormData {
        FormData {
            flags: flags.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            sections: sections
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn foreign_property_flag_requires_records() {
        let table = RequirementTable::standard();
        let data = form(
            &[("hasForeignProperty", true)],
            &[("foreignProperties", json!([]))],
        );
        let err = table.validate(&data).unwrap_err();
        assert_eq!(err.field, "foreignProperties");
        assert_eq!(err.flag, "hasForeignProperty");
        assert_eq!(err.missing, vec!["foreignProperties".to_string()]);
    }

    #[test]
    fn false_flag_ignores_the_section_entirely() {
        let table = RequirementTable::standard();
        for section in [json!([]), json!(null), json!([{"country": "PT"}])] {
            let data = form(
                &[("hasForeignProperty", false)],
                &[("foreignProperties", section)],
            );
            assert!(table.validate(&data).is_ok());
        }
    }

    #[test]
    fn missing_flag_counts_as_false() {
        assert!(RequirementTable::standard().validate(&FormData::default()).is_ok());
    }

    #[test]
    fn all_missing_sections_are_listed_in_table_order() {
        let data = form(
            &[("isSelfEmployed", true), ("hasDependents", true)],
            &[("businessIncome", json!({}))],
        );
        let err = RequirementTable::standard().validate(&data).unwrap_err();
        assert_eq!(err.field, "dependents");
        assert_eq!(err.missing, vec!["dependents", "businessIncome"]);
    }

    #[test]
    fn form_data_deserializes_with_defaults() {
        let data: FormData = serde_json::from_value(json!({"flags": {"hasDependents": true}})).unwrap();
        assert!(data.flag("hasDependents"));
        assert!(data.sections.is_empty());
    }

    proptest! {
        /// With every flag false, no section content can make validation fail.
        #[test]
        fn all_false_flags_always_validate(len in 0usize..4, present in any::<bool>()) {
            let table = RequirementTable::standard();
            let mut data = FormData::default();
            for rule in table.rules() {
                data.flags.insert(rule.flag.clone(), false);
                if present {
                    data.sections.insert(rule.section.clone(), json!(vec![1; len]));
                }
            }
            prop_assert!(table.validate(&data).is_ok());
        }

        /// With every flag true, validation passes exactly when every section is non-empty.
        #[test]
        fn true_flags_require_non_empty_sections(lens in prop::collection::vec(0usize..3, 6)) {
            let table = RequirementTable::standard();
            let mut data = FormData::default();
            for (rule, len) in table.rules().iter().zip(&lens) {
                data.flags.insert(rule.flag.clone(), true);
                data.sections.insert(rule.section.clone(), json!(vec![0; *len]));
            }
            let all_present = lens.iter().all(|l| *l > 0);
            prop_assert_eq!(table.validate(&data).is_ok(), all_present);
        }
    }
}
