use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable identifier of a regulated entity (factory).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Per-cycle compliance status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceStatus {
    #[default]
    Normal,
    Alert,
    Penalty,
}

impl ComplianceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Alert => "ALERT",
            Self::Penalty => "PENALTY",
        }
    }
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplianceStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "NORMAL" => Ok(Self::Normal),
            "ALERT" => Ok(Self::Alert),
            "PENALTY" => Ok(Self::Penalty),
            other => Err(StoreError::InvalidInput(format!(
                "unknown compliance status '{other}'"
            ))),
        }
    }
}

/// Who caused a slash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlashTrigger {
    /// The autonomous monitor observed an actual breach.
    Oracle,
    /// An operator invoked the ledger directly.
    Manual,
}

impl SlashTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oracle => "ORACLE",
            Self::Manual => "MANUAL",
        }
    }
}

impl FromStr for SlashTrigger {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ORACLE" => Ok(Self::Oracle),
            "MANUAL" => Ok(Self::Manual),
            other => Err(StoreError::InvalidInput(format!(
                "unknown slash trigger '{other}'"
            ))),
        }
    }
}

/// A monitored factory. Metadata fields are opaque to the compliance core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub owner: Option<String>,
    pub location: Option<String>,
    /// Posted stake in minor units.
    pub stake_balance: u64,
    pub status: ComplianceStatus,
}

/// Registration payload used by bootstrap seeding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEntity {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub stake_balance: u64,
}

impl NewEntity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, stake_balance: u64) -> Self {
        Self {
            id: EntityId::new(id),
            name: name.into(),
            owner: None,
            location: None,
            stake_balance,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Raw pollutant concentrations produced by a sensor feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub pm2_5: f64,
    pub so2: f64,
    pub nox: f64,
}

impl SensorSample {
    pub fn new(pm2_5: f64, so2: f64, nox: f64) -> Self {
        Self { pm2_5, so2, nox }
    }
}

/// Reading append payload. The store assigns the row identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NewReading {
    pub sample: SensorSample,
    pub recorded_at: DateTime<Utc>,
}

/// Persisted, immutable sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub entity_id: EntityId,
    pub pm2_5: f64,
    pub so2: f64,
    pub nox: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only forecast audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastLogEntry {
    pub entity_id: EntityId,
    pub predicted_value: f64,
    pub breach_predicted: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only slash ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlashEvent {
    pub entity_id: EntityId,
    pub amount: u64,
    /// Stake immediately before the slash was applied.
    pub stake_before: u64,
    pub reason: String,
    pub triggered_by: SlashTrigger,
    pub tx_hash: String,
    pub recorded_at: DateTime<Utc>,
}

impl SlashEvent {
    pub fn stake_after(&self) -> u64 {
        self.stake_before - self.amount
    }
}

/// Singleton pool of slashed stake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProtocolFund {
    pub admin_fund_balance: u64,
}
