use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::constants::*;
use super::DatabaseError;

/// Backend kind. Fixed at creation; selects the provider for every lifecycle call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineType {
    CloudVm,
    AlwaysOnHost,
    BrowserService,
    LocalContainer,
}

impl MachineType {
    pub const ALL: [MachineType; 4] = [
        MachineType::CloudVm,
        MachineType::AlwaysOnHost,
        MachineType::BrowserService,
        MachineType::LocalContainer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineType::CloudVm => MACHINE_TYPE_CLOUD_VM,
            MachineType::AlwaysOnHost => MACHINE_TYPE_ALWAYS_ON_HOST,
            MachineType::BrowserService => MACHINE_TYPE_BROWSER_SERVICE,
            MachineType::LocalContainer => MACHINE_TYPE_LOCAL_CONTAINER,
        }
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            MACHINE_TYPE_CLOUD_VM | "cloud_vm" => Ok(MachineType::CloudVm),
            MACHINE_TYPE_ALWAYS_ON_HOST | "always_on_host" => Ok(MachineType::AlwaysOnHost),
            MACHINE_TYPE_BROWSER_SERVICE | "browser_service" => Ok(MachineType::BrowserService),
            MACHINE_TYPE_LOCAL_CONTAINER | "local_container" => Ok(MachineType::LocalContainer),
            other => Err(format!("unknown machine type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Provisioning,
    Active,
    Stopping,
    Stopped,
    Terminated,
    Unhealthy,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Provisioning => SANDBOX_STATUS_PROVISIONING,
            SandboxStatus::Active => SANDBOX_STATUS_ACTIVE,
            SandboxStatus::Stopping => SANDBOX_STATUS_STOPPING,
            SandboxStatus::Stopped => SANDBOX_STATUS_STOPPED,
            SandboxStatus::Terminated => SANDBOX_STATUS_TERMINATED,
            SandboxStatus::Unhealthy => SANDBOX_STATUS_UNHEALTHY,
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            SANDBOX_STATUS_PROVISIONING => Ok(SandboxStatus::Provisioning),
            SANDBOX_STATUS_ACTIVE => Ok(SandboxStatus::Active),
            SANDBOX_STATUS_STOPPING => Ok(SandboxStatus::Stopping),
            SANDBOX_STATUS_STOPPED => Ok(SandboxStatus::Stopped),
            SANDBOX_STATUS_TERMINATED => Ok(SandboxStatus::Terminated),
            SANDBOX_STATUS_UNHEALTHY => Ok(SandboxStatus::Unhealthy),
            other => Err(format!("unknown sandbox status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => HEALTH_HEALTHY,
            HealthStatus::Degraded => HEALTH_DEGRADED,
            HealthStatus::Unhealthy => HEALTH_UNHEALTHY,
        }
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            HEALTH_HEALTHY => Ok(HealthStatus::Healthy),
            HEALTH_DEGRADED => Ok(HealthStatus::Degraded),
            HEALTH_UNHEALTHY => Ok(HealthStatus::Unhealthy),
            other => Err(format!("unknown health status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: Uuid,
    pub name: String,
    pub environment: String, // dev | staging | prod
    /// `None` for legacy rows created before the column existed.
    pub machine_type: Option<MachineType>,
    pub instance_id: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub session_handle: Option<String>,
    pub status: SandboxStatus,
    pub health_status: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub capacity: i32,
    pub current_load: i32,
    pub auto_stop_enabled: bool,
    pub idle_minutes_before_stop: i32,
    /// Provider-side power state as last reported (e.g. `running`, `stopped`).
    pub backing_state: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sandbox {
    pub fn is_terminated(&self) -> bool {
        self.status == SandboxStatus::Terminated
    }

    pub fn is_idle(&self) -> bool {
        self.status == SandboxStatus::Active && self.current_load == 0
    }

    /// True when the auto-stop policy applies and the sandbox has sat
    /// untouched for longer than its own threshold.
    pub fn is_past_idle_threshold(&self, now: DateTime<Utc>) -> bool {
        if !self.auto_stop_enabled || self.idle_minutes_before_stop <= 0 {
            return false;
        }
        let threshold = chrono::Duration::minutes(self.idle_minutes_before_stop as i64);
        now - self.updated_at > threshold
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SandboxRow {
    pub id: String,
    pub name: String,
    pub environment: String,
    pub machine_type: Option<String>,
    pub instance_id: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub session_handle: Option<String>,
    pub status: String,
    pub health_status: String,
    pub last_health_check: Option<DateTime<Utc>>,
    pub capacity: i32,
    pub current_load: i32,
    pub auto_stop_enabled: bool,
    pub idle_minutes_before_stop: i32,
    pub backing_state: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SandboxRow> for Sandbox {
    type Error = DatabaseError;

    fn try_from(row: SandboxRow) -> Result<Self, Self::Error> {
        let machine_type = row
            .machine_type
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(MachineType::from_str)
            .transpose()
            .map_err(DatabaseError::Internal)?;

        Ok(Sandbox {
            id: Uuid::parse_str(&row.id)?,
            name: row.name,
            environment: row.environment,
            machine_type,
            instance_id: row.instance_id,
            public_ip: row.public_ip,
            private_ip: row.private_ip,
            session_handle: row.session_handle,
            status: row.status.parse().map_err(DatabaseError::Internal)?,
            health_status: row.health_status.parse().map_err(DatabaseError::Internal)?,
            last_health_check: row.last_health_check,
            capacity: row.capacity,
            current_load: row.current_load,
            auto_stop_enabled: row.auto_stop_enabled,
            idle_minutes_before_stop: row.idle_minutes_before_stop,
            backing_state: row.backing_state,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Fields for a new sandbox record.
#[derive(Debug, Clone)]
pub struct NewSandbox {
    pub name: String,
    pub environment: String,
    pub machine_type: MachineType,
    pub capacity: i32,
    pub auto_stop_enabled: bool,
    pub idle_minutes_before_stop: i32,
}

/// Partial update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxUpdate {
    pub status: Option<SandboxStatus>,
    pub health_status: Option<HealthStatus>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub instance_id: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub session_handle: Option<String>,
    pub backing_state: Option<String>,
}

impl SandboxUpdate {
    pub fn status(status: SandboxStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == SandboxUpdate::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(updated_minutes_ago: i64, now: DateTime<Utc>) -> Sandbox {
        Sandbox {
            id: Uuid::new_v4(),
            name: "sbx".to_string(),
            environment: "dev".to_string(),
            machine_type: Some(MachineType::CloudVm),
            instance_id: None,
            public_ip: None,
            private_ip: None,
            session_handle: None,
            status: SandboxStatus::Active,
            health_status: HealthStatus::Healthy,
            last_health_check: None,
            capacity: 1,
            current_load: 0,
            auto_stop_enabled: true,
            idle_minutes_before_stop: 30,
            backing_state: None,
            created_at: now - chrono::Duration::hours(2),
            updated_at: now - chrono::Duration::minutes(updated_minutes_ago),
        }
    }

    #[test]
    fn idle_threshold_is_per_sandbox() {
        let now = Utc::now();
        assert!(sandbox(31, now).is_past_idle_threshold(now));
        assert!(!sandbox(29, now).is_past_idle_threshold(now));

        let mut disabled = sandbox(120, now);
        disabled.auto_stop_enabled = false;
        assert!(!disabled.is_past_idle_threshold(now));
    }

    #[test]
    fn machine_type_parses_tags_and_names() {
        assert_eq!("ec2".parse::<MachineType>(), Ok(MachineType::CloudVm));
        assert_eq!("macos".parse::<MachineType>(), Ok(MachineType::AlwaysOnHost));
        assert_eq!(
            "local_container".parse::<MachineType>(),
            Ok(MachineType::LocalContainer)
        );
        assert!("mainframe".parse::<MachineType>().is_err());
    }
}
