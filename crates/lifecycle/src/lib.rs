//! `taxguard-lifecycle`: the lifecycle state machines.
//!
//! Three independent machines (Engagement, Document, TaxForm) are expressed as
//! explicit transition tables. Every check here is a pure function: no IO, no
//! clocks beyond timestamps passed in by the caller.

pub mod document;
pub mod engagement;
pub mod error;
pub mod machine;
pub mod requirements;
pub mod tax_form;

pub use document::{Document, DocumentMachine, DocumentStatus};
pub use engagement::{Engagement, EngagementMachine, EngagementStatus};
pub use error::{LifecycleError, TransitionError, ValidationFailure};
pub use machine::{Edge, PlannedTransition, StateMachine, Status, TableDefect, check_consistency};
pub use requirements::{FormData, Requirement, RequirementTable};
pub use tax_form::{TaxForm, TaxFormMachine, TaxFormStatus};

/// Run the consistency check over all three transition tables.
///
/// Returns every defect found; an empty vector means the tables are sound.
pub fn check_all_tables() -> Vec<TableDefect> {
    let mut defects = Vec::new();
    defects.extend(check_consistency::<EngagementMachine>());
    defects.extend(check_consistency::<DocumentMachine>());
    defects.extend(check_consistency::<TaxFormMachine>());
    defects
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shipped_tables_are_consistent() {
        assert_eq!(check_all_tables(), Vec::<TableDefect>::new());
    }
}
