//! Data models for rent-collection entities.
//!
//! - `Tenant`: a renter assigned to a collecting agent
//! - `Collection`, `ApprovalState`: recorded payments and their review state
//! - `Profile`, `Role`: agents, managers, admins
//! - `QueryData`: the typed value cached for a query, tagged by topic

pub mod collection;
pub mod profile;
pub mod tenant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::Topic;
use crate::error::BackendError;

pub use collection::{ApprovalState, ApprovalStatus, Collection};
pub use profile::{Profile, Role};
pub use tenant::Tenant;

/// Result set of one query. Known topics decode into typed records; any
/// other topic keeps its raw rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "rows", rename_all = "lowercase")]
pub enum QueryData {
    Tenants(Vec<Tenant>),
    Collections(Vec<Collection>),
    Profiles(Vec<Profile>),
    Rows(Vec<Value>),
}

fn decode<T: serde::de::DeserializeOwned>(topic: &Topic, rows: Vec<Value>) -> Result<Vec<T>, BackendError> {
    rows.into_iter()
        .map(serde_json::from_value)
        .collect::<Result<Vec<T>, _>>()
        .map_err(|e| BackendError::InvalidResponse(format!("{} rows: {}", topic, e)))
}

impl QueryData {
    pub fn from_rows(topic: &Topic, rows: Vec<Value>) -> Result<Self, BackendError> {
        Ok(match topic.as_str() {
            "tenants" => QueryData::Tenants(decode(topic, rows)?),
            "collections" => QueryData::Collections(decode(topic, rows)?),
            "profiles" => QueryData::Profiles(decode(topic, rows)?),
            _ => QueryData::Rows(rows),
        })
    }

    pub fn len(&self) -> usize {
        match self {
            QueryData::Tenants(rows) => rows.len(),
            QueryData::Collections(rows) => rows.len(),
            QueryData::Profiles(rows) => rows.len(),
            QueryData::Rows(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn collections(&self) -> Option<&[Collection]> {
        match self {
            QueryData::Collections(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn collection(&self, id: &str) -> Option<&Collection> {
        self.collections()?.iter().find(|c| c.id == id)
    }

    pub fn collection_mut(&mut self, id: &str) -> Option<&mut Collection> {
        match self {
            QueryData::Collections(rows) => rows.iter_mut().find(|c| c.id == id),
            _ => None,
        }
    }

    pub fn tenants(&self) -> Option<&[Tenant]> {
        match self {
            QueryData::Tenants(rows) => Some(rows),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_rows_decodes_known_topics() {
        let rows = vec![json!({"id": "t1", "name": "Ada", "agent_id": "a1", "unit": null, "monthly_rent": 800})];
        let data = QueryData::from_rows(&Topic::TENANTS, rows).unwrap();
        assert_eq!(data.tenants().unwrap()[0].name, "Ada");
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn test_from_rows_keeps_unknown_topics_raw() {
        let rows = vec![json!({"id": 1, "note": "anything"})];
        let data = QueryData::from_rows(&Topic::new("payments"), rows.clone()).unwrap();
        assert_eq!(data, QueryData::Rows(rows));
    }

    #[test]
    fn test_from_rows_reports_bad_rows() {
        let rows = vec![json!({"id": "t1"})];
        let err = QueryData::from_rows(&Topic::TENANTS, rows).unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(msg) if msg.starts_with("tenants rows")));
    }

    #[test]
    fn test_collection_lookup() {
        let rows = vec![json!({
            "id": "c1", "tenant_id": "t1", "agent_id": "a1", "amount": 100,
            "collected_on": null, "status": "pending",
            "approved_by": null, "approved_at": null, "rejection_reason": null
        })];
        let mut data = QueryData::from_rows(&Topic::COLLECTIONS, rows).unwrap();
        assert!(data.collection("c1").is_some());
        assert!(data.collection("missing").is_none());
        data.collection_mut("c1").unwrap().amount = 120.0;
        assert_eq!(data.collection("c1").unwrap().amount, 120.0);
        assert!(data.tenants().is_none());
    }
}
