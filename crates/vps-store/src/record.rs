//! Instance records and their single-line wire form.
//!
//! A record is one line: `owner|name|session|ram|cpu|creator|os|expiry`.

use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Numeric identity of a chat user.
pub type UserId = u64;

pub const FIELD_SEPARATOR: char = '|';

pub const DEFAULT_RAM_LIMIT: &str = "2048";
pub const DEFAULT_CPU_LIMIT: &str = "1";
pub const DEFAULT_OS_LABEL: &str = "Ubuntu 22.04";
pub const NO_EXPIRY: &str = "None";

// ─── Fields ───────────────────────────────────────────────────────────────────

/// Positional fields of a stored line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    OwnerId,
    InstanceName,
    SessionCommand,
    RamLimit,
    CpuLimit,
    CreatorId,
    OsLabel,
    Expiry,
}

impl RecordField {
    pub fn index(self) -> usize {
        match self {
            Self::OwnerId => 0,
            Self::InstanceName => 1,
            Self::SessionCommand => 2,
            Self::RamLimit => 3,
            Self::CpuLimit => 4,
            Self::CreatorId => 5,
            Self::OsLabel => 6,
            Self::Expiry => 7,
        }
    }
}

impl std::fmt::Display for RecordField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OwnerId => "owner_id",
            Self::InstanceName => "instance_name",
            Self::SessionCommand => "session_command",
            Self::RamLimit => "ram_limit",
            Self::CpuLimit => "cpu_limit",
            Self::CreatorId => "creator_id",
            Self::OsLabel => "os_label",
            Self::Expiry => "expiry",
        };
        write!(f, "{s}")
    }
}

// ─── Record ───────────────────────────────────────────────────────────────────

/// One provisioned instance owned by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub owner_id: UserId,
    pub instance_name: String,
    pub session_command: String,
    pub ram_limit: String,
    pub cpu_limit: String,
    pub creator_id: String,
    pub os_label: String,
    pub expiry: String,
}

impl InstanceRecord {
    /// A record with every optional field at its default.
    pub fn new(owner_id: UserId, instance_name: impl Into<String>) -> Self {
        Self {
            owner_id,
            instance_name: instance_name.into(),
            session_command: String::new(),
            ram_limit: DEFAULT_RAM_LIMIT.to_string(),
            cpu_limit: DEFAULT_CPU_LIMIT.to_string(),
            creator_id: owner_id.to_string(),
            os_label: DEFAULT_OS_LABEL.to_string(),
            expiry: NO_EXPIRY.to_string(),
        }
    }

    /// Parse a stored line. Returns `None` for lines with fewer than two
    /// fields or a non-numeric owner (legacy lines awaiting migration).
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let parts: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        if parts.len() < 2 {
            return None;
        }
        let owner_id: UserId = parts[0].parse().ok()?;
        let field = |i: usize, default: &str| {
            parts
                .get(i)
                .map(|s| s.to_string())
                .unwrap_or_else(|| default.to_string())
        };
        Some(Self {
            owner_id,
            instance_name: parts[1].to_string(),
            session_command: field(2, ""),
            ram_limit: field(3, DEFAULT_RAM_LIMIT),
            cpu_limit: field(4, DEFAULT_CPU_LIMIT),
            creator_id: field(5, &owner_id.to_string()),
            os_label: field(6, DEFAULT_OS_LABEL),
            expiry: field(7, NO_EXPIRY),
        })
    }

    /// Serialize to a line without the trailing newline.
    pub fn to_line(&self) -> Result<String, StoreError> {
        self.validate()?;
        let owner = self.owner_id.to_string();
        Ok([
            owner.as_str(),
            self.instance_name.as_str(),
            self.session_command.as_str(),
            self.ram_limit.as_str(),
            self.cpu_limit.as_str(),
            self.creator_id.as_str(),
            self.os_label.as_str(),
            self.expiry.as_str(),
        ]
        .join("|"))
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.instance_name.is_empty() {
            return Err(StoreError::InvalidField {
                field: RecordField::InstanceName,
                reason: "must not be empty".to_string(),
            });
        }
        let text_fields = [
            (RecordField::InstanceName, &self.instance_name),
            (RecordField::SessionCommand, &self.session_command),
            (RecordField::RamLimit, &self.ram_limit),
            (RecordField::CpuLimit, &self.cpu_limit),
            (RecordField::CreatorId, &self.creator_id),
            (RecordField::OsLabel, &self.os_label),
            (RecordField::Expiry, &self.expiry),
        ];
        for (field, value) in text_fields {
            check_value(field, value)?;
        }
        Ok(())
    }
}

/// Reject values that would break the line structure.
pub(crate) fn check_value(field: RecordField, value: &str) -> Result<(), StoreError> {
    if value.contains([FIELD_SEPARATOR, '\n', '\r']) {
        return Err(StoreError::InvalidField {
            field,
            reason: "must not contain '|' or line breaks".to_string(),
        });
    }
    Ok(())
}

/// Raw first field of a line. A trailing `\r` is ignored.
pub(crate) fn owner_field(line: &str) -> &str {
    line.trim_end_matches('\r')
        .split(FIELD_SEPARATOR)
        .next()
        .unwrap_or("")
}

/// Raw instance-name field of a line, if present. A trailing `\r` is
/// ignored.
pub(crate) fn instance_field(line: &str) -> Option<&str> {
    line.trim_end_matches('\r').split(FIELD_SEPARATOR).nth(1)
}
