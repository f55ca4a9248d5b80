// Sandbox lifecycle status constants (sandboxes.status)
pub const SANDBOX_STATUS_PROVISIONING: &str = "provisioning";
pub const SANDBOX_STATUS_ACTIVE: &str = "active";
pub const SANDBOX_STATUS_STOPPING: &str = "stopping";
pub const SANDBOX_STATUS_STOPPED: &str = "stopped";
pub const SANDBOX_STATUS_TERMINATED: &str = "terminated";
pub const SANDBOX_STATUS_UNHEALTHY: &str = "unhealthy";

// Sandbox health constants (sandboxes.health_status)
pub const HEALTH_HEALTHY: &str = "healthy";
pub const HEALTH_DEGRADED: &str = "degraded";
pub const HEALTH_UNHEALTHY: &str = "unhealthy";

// Machine type tags (sandboxes.machine_type)
pub const MACHINE_TYPE_CLOUD_VM: &str = "ec2";
pub const MACHINE_TYPE_ALWAYS_ON_HOST: &str = "macos";
pub const MACHINE_TYPE_BROWSER_SERVICE: &str = "browserbase";
pub const MACHINE_TYPE_LOCAL_CONTAINER: &str = "docker";

// Task status constants (tasks.status)
pub const TASK_STATUS_CREATED: &str = "created";
pub const TASK_STATUS_QUEUED: &str = "queued";
pub const TASK_STATUS_IN_PROGRESS: &str = "in_progress";
pub const TASK_STATUS_WAITING_HUMAN: &str = "waiting_human";
pub const TASK_STATUS_COMPLETED: &str = "completed";
pub const TASK_STATUS_FAILED: &str = "failed";
pub const TASK_STATUS_CANCELLED: &str = "cancelled";

pub const TERMINAL_TASK_STATUSES: [&str; 3] = [
    TASK_STATUS_COMPLETED,
    TASK_STATUS_FAILED,
    TASK_STATUS_CANCELLED,
];

// Error code written when the watchdog force-fails a task
pub const ERROR_CODE_RECONCILIATION_TIMEOUT: &str = "reconciliation_timeout";
