use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub agent_id: Option<String>,
    pub unit: Option<String>,
    #[serde(default)]
    pub monthly_rent: f64,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Tenant {
    pub fn display_unit(&self) -> String {
        match &self.unit {
            Some(unit) if !unit.is_empty() => format!("Unit {}", unit),
            _ => "No unit".to_string(),
        }
    }
}
