//! Entity kinds and the per-entity descriptor table.
//!
//! All per-entity variation (table names, scope keys, conflict identity,
//! sanitizer hints, compound-op ledger) lives in [`EntityDescriptor`] so the
//! mutator/hydrator/synchronizer logic is written exactly once.

use serde::{Deserialize, Serialize};

/// Entity kinds that participate in offline caching and queue replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Client,
    IntakeCase,
    AssistanceCase,
    HousingCase,
    Program,
    Enrollment,
    Resource,
    ServiceDelivery,
}

/// Canonical list of synced entity kinds, in default drain order.
pub const CASE_SYNC_ENTITIES: [EntityKind; 8] = [
    EntityKind::Client,
    EntityKind::IntakeCase,
    EntityKind::AssistanceCase,
    EntityKind::HousingCase,
    EntityKind::Program,
    EntityKind::Enrollment,
    EntityKind::Resource,
    EntityKind::ServiceDelivery,
];

/// Secondary table written by a compound stock adjustment.
#[derive(Debug, Clone, Copy)]
pub struct LedgerDescriptor {
    /// Remote table receiving the ledger row.
    pub table: &'static str,
    /// Column on the ledger row referencing the adjusted record's remote id.
    pub reference_field: &'static str,
}

/// Static description of how one entity kind syncs.
#[derive(Debug, Clone, Copy)]
pub struct EntityDescriptor {
    pub entity: EntityKind,
    /// Remote table name.
    pub table: &'static str,
    /// Stable sort key used for snapshot reads.
    pub order_field: &'static str,
    /// Parent/scope column for scoped hydration and subscriptions.
    pub scope_field: Option<&'static str>,
    /// Natural-identity columns used to resolve create conflicts.
    pub conflict_fields: &'static [&'static str],
    /// Payload fields normalized to JSON arrays by the sanitizer.
    pub array_fields: &'static [&'static str],
    /// Payload fields normalized to JSON numbers by the sanitizer.
    pub number_fields: &'static [&'static str],
    /// Present only for entities with a compound stock-adjustment operation.
    pub ledger: Option<LedgerDescriptor>,
}

const DESCRIPTORS: [EntityDescriptor; 8] = [
    EntityDescriptor {
        entity: EntityKind::Client,
        table: "clients",
        order_field: "last_name",
        scope_field: None,
        conflict_fields: &["first_name", "last_name", "date_of_birth"],
        array_fields: &["languages"],
        number_fields: &["household_size"],
        ledger: None,
    },
    EntityDescriptor {
        entity: EntityKind::IntakeCase,
        table: "intake_cases",
        order_field: "created_at",
        scope_field: Some("client_id"),
        conflict_fields: &["client_id", "intake_date"],
        array_fields: &["referral_sources", "presenting_needs"],
        number_fields: &[],
        ledger: None,
    },
    EntityDescriptor {
        entity: EntityKind::AssistanceCase,
        table: "assistance_cases",
        order_field: "created_at",
        scope_field: Some("client_id"),
        conflict_fields: &["client_id", "opened_at", "assistance_type"],
        array_fields: &["documents_provided"],
        number_fields: &["amount_requested", "amount_approved"],
        ledger: None,
    },
    EntityDescriptor {
        entity: EntityKind::HousingCase,
        table: "housing_cases",
        order_field: "created_at",
        scope_field: Some("client_id"),
        conflict_fields: &["client_id", "opened_at"],
        array_fields: &["barriers"],
        number_fields: &["monthly_income", "household_size"],
        ledger: None,
    },
    EntityDescriptor {
        entity: EntityKind::Program,
        table: "programs",
        order_field: "name",
        scope_field: None,
        conflict_fields: &["name"],
        array_fields: &["eligibility_criteria"],
        number_fields: &["capacity"],
        ledger: None,
    },
    EntityDescriptor {
        entity: EntityKind::Enrollment,
        table: "enrollments",
        order_field: "enrolled_at",
        scope_field: Some("program_id"),
        conflict_fields: &["program_id", "client_id"],
        array_fields: &[],
        number_fields: &[],
        ledger: None,
    },
    EntityDescriptor {
        entity: EntityKind::Resource,
        table: "resources",
        order_field: "name",
        scope_field: Some("category"),
        conflict_fields: &["name", "category"],
        array_fields: &["tags"],
        number_fields: &["current_stock", "minimum_stock"],
        ledger: Some(LedgerDescriptor {
            table: "stock_transactions",
            reference_field: "resource_id",
        }),
    },
    EntityDescriptor {
        entity: EntityKind::ServiceDelivery,
        table: "service_deliveries",
        order_field: "delivered_at",
        scope_field: Some("enrollment_id"),
        conflict_fields: &["enrollment_id", "delivered_at", "service_type"],
        array_fields: &[],
        number_fields: &["units"],
        ledger: None,
    },
];

/// Look up the static descriptor for an entity kind. The descriptor table is
/// declared in the same order as the enum.
pub fn descriptor(entity: EntityKind) -> &'static EntityDescriptor {
    &DESCRIPTORS[entity as usize]
}

impl EntityKind {
    /// Stable string form, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Client => "client",
            EntityKind::IntakeCase => "intake_case",
            EntityKind::AssistanceCase => "assistance_case",
            EntityKind::HousingCase => "housing_case",
            EntityKind::Program => "program",
            EntityKind::Enrollment => "enrollment",
            EntityKind::Resource => "resource",
            EntityKind::ServiceDelivery => "service_delivery",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_entity_has_a_descriptor() {
        for entity in CASE_SYNC_ENTITIES {
            let d = descriptor(entity);
            assert_eq!(d.entity, entity);
            assert!(!d.table.is_empty());
            assert!(!d.conflict_fields.is_empty());
        }
    }

    #[test]
    fn entity_serialization_matches_backend_contract() {
        let actual = CASE_SYNC_ENTITIES
            .iter()
            .map(|entity| serde_json::to_string(entity).expect("serialize entity kind"))
            .collect::<Vec<_>>();
        let expected = vec![
            "\"client\"",
            "\"intake_case\"",
            "\"assistance_case\"",
            "\"housing_case\"",
            "\"program\"",
            "\"enrollment\"",
            "\"resource\"",
            "\"service_delivery\"",
        ];
        assert_eq!(actual, expected);
    }

    #[test]
    fn as_str_round_trips_through_serde() {
        for entity in CASE_SYNC_ENTITIES {
            let json = serde_json::to_string(&entity).expect("serialize");
            assert_eq!(json, format!("\"{}\"", entity.as_str()));
        }
    }

    #[test]
    fn only_resources_carry_a_ledger() {
        for entity in CASE_SYNC_ENTITIES {
            let d = descriptor(entity);
            assert_eq!(d.ledger.is_some(), entity == EntityKind::Resource);
        }
    }
}
