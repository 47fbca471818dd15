//! Secondary-eligibility policy for database commands.
use bson::{Bson, Document};

// Commands whose first field name appears here are read-only and carry no
// causal ordering requirement, so they may be routed to a secondary.
const SECONDARY_ELIGIBLE_COMMANDS: [&str; 9] = [
    "group",
    "aggregate",
    "collstats",
    "dbstats",
    "count",
    "distinct",
    "geonear",
    "geosearch",
    "geowalk",
];

/// Decides whether a command document is safe to route to a secondary.
///
/// The policy is consulted whenever a command cursor carries a non-primary
/// read preference; an ineligible command is forced back to the primary.
/// Callers with custom commands can supply their own implementation through
/// the client options.
pub trait SecondaryEligibility: Send + Sync {
    fn can_run_on_secondary(&self, command: &Document) -> bool;
}

/// The stock allow-list policy.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSecondaryEligibility;

impl SecondaryEligibility for DefaultSecondaryEligibility {
    fn can_run_on_secondary(&self, command: &Document) -> bool {
        let name = match command.keys().next() {
            Some(name) => name.to_lowercase(),
            None => return false,
        };

        if SECONDARY_ELIGIBLE_COMMANDS.contains(&name.as_str()) {
            return true;
        }

        // mapreduce stays in memory (and off the primary) only with inline output.
        if name == "mapreduce" {
            if let Some(&Bson::Document(ref out)) = command.get("out") {
                return out.contains_key("inline");
            }
        }

        false
    }
}
