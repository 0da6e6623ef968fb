//! High-level operations over the registry store.

use anyhow::Result;
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::pin::{self, PinVerdict};

/// Device names that must never be persisted. `ETHOSCOPE_000` is the
/// factory-default name a freshly flashed device advertises before it has
/// been configured.
const BLACKLISTED_NAMES: &[&str] = &["ETHOSCOPE_000"];

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

/// Handle to the registry store. Cheap to clone; all methods take `&self`.
#[derive(Debug, Clone)]
pub struct Registry {
    pool: SqlitePool,
}

/// A persisted device row.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct EthoscopeRecord {
    pub ethoscope_id: String,
    pub ethoscope_name: String,
    pub first_seen: String,
    pub last_seen: String,
    pub active: i64,
    pub last_ip: Option<String>,
    pub status: String,
    pub machineinfo: Option<String>,
    pub problems: String,
    pub comments: String,
}

/// Fields to change on a device row. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct EthoscopeUpdate {
    pub ethoscope_id: String,
    pub ethoscope_name: Option<String>,
    pub active: Option<i64>,
    pub last_ip: Option<String>,
    pub status: Option<String>,
    pub machineinfo: Option<String>,
    pub comments: Option<String>,
}

impl EthoscopeUpdate {
    pub fn new(ethoscope_id: impl Into<String>) -> Self {
        EthoscopeUpdate {
            ethoscope_id: ethoscope_id.into(),
            ..Default::default()
        }
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.ethoscope_name = Some(name.into());
        self
    }

    pub fn last_ip(mut self, ip: impl Into<String>) -> Self {
        self.last_ip = Some(ip.into());
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active as i64);
        self
    }

    pub fn machineinfo(mut self, info: impl Into<String>) -> Self {
        self.machineinfo = Some(info.into());
        self
    }

    pub fn comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }
}

/// A persisted acquisition run.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct RunRecord {
    pub run_id: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub experiment_type: String,
    pub ethoscope_name: String,
    pub ethoscope_id: String,
    pub user_name: String,
    pub user_id: String,
    pub location: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub status: String,
    pub alert: i64,
    pub problems: String,
    pub comments: String,
    pub experimental_data: String,
}

/// Parameters for creating a run.
#[derive(Debug, Clone, Default)]
pub struct NewRun {
    /// Generated when absent.
    pub run_id: Option<String>,
    pub experiment_type: String,
    pub ethoscope_name: String,
    pub ethoscope_id: String,
    pub user_name: String,
    pub user_id: String,
    pub location: String,
    pub alert: bool,
    pub comments: String,
    pub experimental_data: String,
}

/// A persisted user.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub fullname: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub pin: String,
    pub telephone: String,
    pub labname: String,
    pub active: i64,
    pub isadmin: i64,
    pub created: String,
}

/// Parameters for creating a user. The PIN is hashed before storage.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub fullname: String,
    pub email: String,
    pub pin: String,
    pub telephone: String,
    pub labname: String,
    pub isadmin: bool,
}

impl Registry {
    /// Open (or create) the registry store at `database_url` and run
    /// migrations. Idempotent.
    pub async fn open(database_url: &str) -> Result<Self> {
        let pool = super::init(database_url).await?;
        Ok(Registry { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // --- devices -----------------------------------------------------------

    /// Upsert a device row. Refuses to *insert* devices without a valid
    /// name or carrying a blacklisted one; updates to existing rows always
    /// go through. Returns whether a row was written.
    pub async fn update_ethoscope(&self, update: EthoscopeUpdate) -> Result<bool, sqlx::Error> {
        if update.ethoscope_id.trim().is_empty() {
            return Ok(false);
        }
        let now = now_str();

        let exists: bool = sqlx::query("SELECT 1 FROM ethoscopes WHERE ethoscope_id = ?")
            .bind(&update.ethoscope_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();

        if !exists {
            let name = update.ethoscope_name.clone().unwrap_or_default();
            if name.trim().is_empty() {
                warn!(device = %update.ethoscope_id, "Refusing to persist unnamed device");
                return Ok(false);
            }
            if BLACKLISTED_NAMES.contains(&name.as_str()) {
                warn!(device = %update.ethoscope_id, name = %name, "Refusing to persist blacklisted device name");
                return Ok(false);
            }

            sqlx::query(
                "INSERT INTO ethoscopes \
                 (ethoscope_id, ethoscope_name, first_seen, last_seen, active, last_ip, status, machineinfo, problems, comments) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, '', ?)",
            )
            .bind(&update.ethoscope_id)
            .bind(&name)
            .bind(&now)
            .bind(&now)
            .bind(update.active.unwrap_or(1))
            .bind(&update.last_ip)
            .bind(update.status.as_deref().unwrap_or("offline"))
            .bind(&update.machineinfo)
            .bind(update.comments.as_deref().unwrap_or(""))
            .execute(&self.pool)
            .await?;
            return Ok(true);
        }

        sqlx::query(
            "UPDATE ethoscopes SET \
             ethoscope_name = COALESCE(?, ethoscope_name), \
             active = COALESCE(?, active), \
             last_ip = COALESCE(?, last_ip), \
             status = COALESCE(?, status), \
             machineinfo = COALESCE(?, machineinfo), \
             comments = COALESCE(?, comments), \
             last_seen = ? \
             WHERE ethoscope_id = ?",
        )
        .bind(&update.ethoscope_name)
        .bind(update.active)
        .bind(&update.last_ip)
        .bind(&update.status)
        .bind(&update.machineinfo)
        .bind(&update.comments)
        .bind(&now)
        .bind(&update.ethoscope_id)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    pub async fn get_ethoscope(
        &self,
        ethoscope_id: &str,
    ) -> Result<Option<EthoscopeRecord>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM ethoscopes WHERE ethoscope_id = ?")
            .bind(ethoscope_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_ethoscopes(
        &self,
        include_inactive: bool,
    ) -> Result<Vec<EthoscopeRecord>, sqlx::Error> {
        if include_inactive {
            sqlx::query_as("SELECT * FROM ethoscopes ORDER BY ethoscope_name")
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query_as("SELECT * FROM ethoscopes WHERE active = 1 ORDER BY ethoscope_name")
                .fetch_all(&self.pool)
                .await
        }
    }

    /// Mark a device inactive (or active again). Retirement is the only way
    /// a device leaves the directory; going offline never deletes it.
    pub async fn retire_ethoscope(
        &self,
        ethoscope_id: &str,
        active: bool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE ethoscopes SET active = ? WHERE ethoscope_id = ?")
            .bind(active as i64)
            .bind(ethoscope_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- runs --------------------------------------------------------------

    /// Create a run record plus its experiments row. Returns the run id.
    pub async fn add_run(&self, run: NewRun) -> Result<String, sqlx::Error> {
        let run_id = run
            .run_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let now = now_str();

        sqlx::query(
            "INSERT INTO runs \
             (run_id, type, ethoscope_name, ethoscope_id, user_name, user_id, location, \
              start_time, status, alert, problems, comments, experimental_data) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'running', ?, '', ?, ?)",
        )
        .bind(&run_id)
        .bind(&run.experiment_type)
        .bind(&run.ethoscope_name)
        .bind(&run.ethoscope_id)
        .bind(&run.user_name)
        .bind(&run.user_id)
        .bind(&run.location)
        .bind(&now)
        .bind(run.alert as i64)
        .bind(&run.comments)
        .bind(&run.experimental_data)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "INSERT INTO experiments (run_id, ethoscope_id, user_id, location, start_time) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&run_id)
        .bind(&run.ethoscope_id)
        .bind(&run.user_id)
        .bind(&run.location)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        info!(run_id = %run_id, device = %run.ethoscope_id, "Run started");
        Ok(run_id)
    }

    /// Mark a run stopped. Returns the new status.
    pub async fn stop_run(&self, run_id: &str) -> Result<&'static str, sqlx::Error> {
        sqlx::query("UPDATE runs SET status = 'stopped', end_time = ? WHERE run_id = ?")
            .bind(now_str())
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        info!(run_id = %run_id, "Run stopped");
        Ok("stopped")
    }

    /// Append a problem note to a run. Existing notes are never overwritten.
    pub async fn flag_problem(&self, run_id: &str, message: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE runs SET problems = CASE \
               WHEN problems = '' THEN ? \
               ELSE problems || '; ' || ? \
             END WHERE run_id = ?",
        )
        .bind(message)
        .bind(message)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
    }

    // --- alerts ------------------------------------------------------------

    /// Record that an alert was dispatched.
    pub async fn log_alert(
        &self,
        device_id: &str,
        alert_type: &str,
        run_id: &str,
        message: &str,
        recipients: &str,
    ) -> Result<i64, sqlx::Error> {
        let now = now_str();
        let result = sqlx::query(
            "INSERT INTO alert_logs \
             (device_id, alert_type, run_id, message, recipients, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(device_id)
        .bind(alert_type)
        .bind(run_id)
        .bind(message)
        .bind(recipients)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Deduplication gate: has this `(device, type, run)` triple already
    /// been alerted on?
    pub async fn has_alert_been_sent(
        &self,
        device_id: &str,
        alert_type: &str,
        run_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let row = sqlx::query(
            "SELECT 1 FROM alert_logs \
             WHERE device_id = ? AND alert_type = ? AND run_id = ? LIMIT 1",
        )
        .bind(device_id)
        .bind(alert_type)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    // --- users -------------------------------------------------------------

    /// Add a user. Username and email are mandatory and unique; the PIN is
    /// hashed before storage.
    pub async fn add_user(&self, user: NewUser) -> Result<i64, sqlx::Error> {
        if user.username.trim().is_empty() || user.email.trim().is_empty() {
            return Err(sqlx::Error::Protocol(
                "username and email are required".into(),
            ));
        }
        let pin_hash = if user.pin.is_empty() {
            String::new()
        } else {
            pin::hash_pin(&user.pin)
        };
        let result = sqlx::query(
            "INSERT INTO users \
             (username, fullname, email, pin, telephone, labname, active, isadmin, created) \
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&user.username)
        .bind(&user.fullname)
        .bind(&user.email)
        .bind(&pin_hash)
        .bind(&user.telephone)
        .bind(&user.labname)
        .bind(user.isadmin as i64)
        .bind(now_str())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_user_by_name(
        &self,
        username: &str,
    ) -> Result<Option<UserRecord>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
    }

    /// Verify a user's PIN. Stored values in a legacy format are
    /// transparently re-hashed into the current format on success.
    pub async fn verify_pin(&self, username: &str, pin_value: &str) -> Result<bool, sqlx::Error> {
        let Some(user) = self.get_user_by_name(username).await? else {
            return Ok(false);
        };

        match pin::verify_pin(pin_value, &user.pin) {
            PinVerdict::Valid { needs_upgrade } => {
                if needs_upgrade {
                    let upgraded = pin::hash_pin(pin_value);
                    sqlx::query("UPDATE users SET pin = ? WHERE username = ?")
                        .bind(&upgraded)
                        .bind(username)
                        .execute(&self.pool)
                        .await?;
                    info!(user = %username, "Upgraded stored PIN to current format");
                }
                Ok(true)
            }
            PinVerdict::Invalid => Ok(false),
        }
    }

    /// Authenticate an active user by PIN.
    pub async fn authenticate_user(
        &self,
        username: &str,
        pin_value: &str,
    ) -> Result<Option<UserRecord>, sqlx::Error> {
        if !self.verify_pin(username, pin_value).await? {
            return Ok(None);
        }
        let user = self.get_user_by_name(username).await?;
        Ok(user.filter(|u| u.active == 1))
    }

    // --- incubators --------------------------------------------------------

    pub async fn add_incubator(
        &self,
        name: &str,
        location: &str,
        owner: &str,
    ) -> Result<i64, sqlx::Error> {
        if name.trim().is_empty() {
            return Err(sqlx::Error::Protocol("incubator name is required".into()));
        }
        let result =
            sqlx::query("INSERT INTO incubators (name, location, owner, active) VALUES (?, ?, ?, 1)")
                .bind(name)
                .bind(location)
                .bind(owner)
                .execute(&self.pool)
                .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn set_incubator_active(&self, name: &str, active: bool) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE incubators SET active = ? WHERE name = ?")
            .bind(active as i64)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- cleanup jobs ------------------------------------------------------

    /// Retire devices not seen for `threshold_days`. Returns rows affected.
    pub async fn retire_inactive_devices(&self, threshold_days: u64) -> Result<u64, sqlx::Error> {
        let cutoff = (Utc::now() - Duration::days(threshold_days as i64)).to_rfc3339();
        let result =
            sqlx::query("UPDATE ethoscopes SET active = 0 WHERE active = 1 AND last_seen < ?")
                .bind(&cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// Force offline any registry row stuck at busy/unreached longer than
    /// `threshold_hours`. Returns rows affected.
    pub async fn cleanup_stale_status(&self, threshold_hours: u64) -> Result<u64, sqlx::Error> {
        let cutoff = (Utc::now() - Duration::hours(threshold_hours as i64)).to_rfc3339();
        let result = sqlx::query(
            "UPDATE ethoscopes SET status = 'offline' \
             WHERE status IN ('busy', 'unreached') AND last_seen < ?",
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Stop running rows that can no longer be running: either their device
    /// is not in a running state, or the device has several concurrent
    /// running rows (only the newest survives). Returns rows affected.
    pub async fn stop_orphaned_runs(&self) -> Result<u64, sqlx::Error> {
        let now = now_str();

        let orphaned = sqlx::query(
            "UPDATE runs SET status = 'stopped', end_time = ? \
             WHERE status = 'running' AND ethoscope_id IN (\
               SELECT ethoscope_id FROM ethoscopes \
               WHERE status NOT IN ('running', 'recording', 'streaming'))",
        )
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let duplicates = sqlx::query(
            "UPDATE runs SET status = 'stopped', end_time = ? \
             WHERE status = 'running' AND run_id NOT IN (\
               SELECT run_id FROM (\
                 SELECT run_id, ROW_NUMBER() OVER (\
                   PARTITION BY ethoscope_id ORDER BY start_time DESC\
                 ) AS rn FROM runs WHERE status = 'running'\
               ) WHERE rn = 1)",
        )
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(orphaned.rows_affected() + duplicates.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_registry() -> Registry {
        Registry::open(":memory:").await.expect("registry init")
    }

    fn sample_update(id: &str, name: &str) -> EthoscopeUpdate {
        EthoscopeUpdate::new(id)
            .name(name)
            .last_ip("192.168.1.100")
            .status("online")
    }

    #[tokio::test]
    async fn test_update_ethoscope_insert_and_update() {
        let registry = test_registry().await;

        assert!(registry
            .update_ethoscope(sample_update("etho_001", "ETHOSCOPE_001"))
            .await
            .unwrap());

        let device = registry.get_ethoscope("etho_001").await.unwrap().unwrap();
        assert_eq!(device.ethoscope_name, "ETHOSCOPE_001");
        assert_eq!(device.status, "online");

        // Partial update leaves unspecified columns alone.
        registry
            .update_ethoscope(EthoscopeUpdate::new("etho_001").status("offline"))
            .await
            .unwrap();
        let device = registry.get_ethoscope("etho_001").await.unwrap().unwrap();
        assert_eq!(device.status, "offline");
        assert_eq!(device.ethoscope_name, "ETHOSCOPE_001");
        assert_eq!(device.last_ip.as_deref(), Some("192.168.1.100"));
    }

    #[tokio::test]
    async fn test_blacklisted_device_not_inserted() {
        let registry = test_registry().await;

        assert!(!registry
            .update_ethoscope(sample_update("blk_001", "ETHOSCOPE_000"))
            .await
            .unwrap());
        assert!(registry.get_ethoscope("blk_001").await.unwrap().is_none());

        // Unnamed devices are refused too.
        assert!(!registry
            .update_ethoscope(EthoscopeUpdate::new("anon_001").status("online"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let registry = test_registry().await;

        let run_id = registry
            .add_run(NewRun {
                run_id: Some("run_001".into()),
                experiment_type: "tracking".into(),
                ethoscope_name: "ETHOSCOPE_001".into(),
                ethoscope_id: "etho_001".into(),
                user_name: "alice".into(),
                location: "Incubator_01".into(),
                alert: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(run_id, "run_001");

        let run = registry.get_run("run_001").await.unwrap().unwrap();
        assert_eq!(run.status, "running");
        assert_eq!(run.experiment_type, "tracking");

        // The experiments row carries all five data columns.
        let row: (String, String, String, String, String) = sqlx::query_as(
            "SELECT run_id, ethoscope_id, user_id, location, start_time \
             FROM experiments WHERE run_id = 'run_001'",
        )
        .fetch_one(registry.pool())
        .await
        .unwrap();
        assert_eq!(row.0, "run_001");
        assert_eq!(row.1, "etho_001");
        assert_eq!(row.3, "Incubator_01");
        assert!(!row.4.is_empty());

        assert_eq!(registry.stop_run("run_001").await.unwrap(), "stopped");
        let run = registry.get_run("run_001").await.unwrap().unwrap();
        assert_eq!(run.status, "stopped");
        assert!(run.end_time.is_some());
    }

    #[tokio::test]
    async fn test_flag_problem_appends() {
        let registry = test_registry().await;
        registry
            .add_run(NewRun {
                run_id: Some("run_p".into()),
                experiment_type: "tracking".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        registry.flag_problem("run_p", "unreached").await.unwrap();
        registry.flag_problem("run_p", "self-stopped").await.unwrap();

        let run = registry.get_run("run_p").await.unwrap().unwrap();
        assert_eq!(run.problems, "unreached; self-stopped");
    }

    #[tokio::test]
    async fn test_alert_dedup_gate() {
        let registry = test_registry().await;

        assert!(!registry
            .has_alert_been_sent("etho_001", "device_stopped", "run_001")
            .await
            .unwrap());

        registry
            .log_alert(
                "etho_001",
                "device_stopped",
                "run_001",
                "Device stopped unexpectedly",
                "admin@lab.org",
            )
            .await
            .unwrap();

        assert!(registry
            .has_alert_been_sent("etho_001", "device_stopped", "run_001")
            .await
            .unwrap());
        // Different run: not yet alerted.
        assert!(!registry
            .has_alert_been_sent("etho_001", "device_stopped", "run_002")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_user_auth_and_pin_upgrade() {
        let registry = test_registry().await;
        registry
            .add_user(NewUser {
                username: "alice".into(),
                email: "alice@lab.org".into(),
                pin: "1234".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(registry.verify_pin("alice", "1234").await.unwrap());
        assert!(!registry.verify_pin("alice", "4321").await.unwrap());
        assert!(!registry.verify_pin("nobody", "1234").await.unwrap());

        // Plant a legacy plaintext PIN; verification upgrades it in place.
        sqlx::query("UPDATE users SET pin = '7777' WHERE username = 'alice'")
            .execute(registry.pool())
            .await
            .unwrap();
        assert!(registry.verify_pin("alice", "7777").await.unwrap());

        let stored: String = sqlx::query_scalar("SELECT pin FROM users WHERE username = 'alice'")
            .fetch_one(registry.pool())
            .await
            .unwrap();
        assert!(stored.starts_with("pbkdf2$"), "PIN upgraded on verify");
        // The same secret still verifies after the upgrade.
        assert!(registry.verify_pin("alice", "7777").await.unwrap());

        let user = registry
            .authenticate_user("alice", "7777")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.username, "alice");

        // Inactive users never authenticate.
        sqlx::query("UPDATE users SET active = 0 WHERE username = 'alice'")
            .execute(registry.pool())
            .await
            .unwrap();
        assert!(registry
            .authenticate_user("alice", "7777")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_user_rejected() {
        let registry = test_registry().await;
        registry
            .add_user(NewUser {
                username: "alice".into(),
                email: "alice@lab.org".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(registry
            .add_user(NewUser {
                username: "alice".into(),
                email: "other@lab.org".into(),
                ..Default::default()
            })
            .await
            .is_err());
        assert!(registry
            .add_user(NewUser {
                username: "bob".into(),
                email: "alice@lab.org".into(),
                ..Default::default()
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_retire_inactive_devices() {
        let registry = test_registry().await;
        registry
            .update_ethoscope(sample_update("etho_old", "ETHOSCOPE_OLD"))
            .await
            .unwrap();

        let old = (Utc::now() - Duration::days(100)).to_rfc3339();
        sqlx::query("UPDATE ethoscopes SET last_seen = ? WHERE ethoscope_id = 'etho_old'")
            .bind(&old)
            .execute(registry.pool())
            .await
            .unwrap();

        let retired = registry.retire_inactive_devices(90).await.unwrap();
        assert_eq!(retired, 1);
        let device = registry.get_ethoscope("etho_old").await.unwrap().unwrap();
        assert_eq!(device.active, 0);
    }

    #[tokio::test]
    async fn test_cleanup_stale_status() {
        let registry = test_registry().await;
        registry
            .update_ethoscope(sample_update("etho_busy", "ETHOSCOPE_B").status("busy"))
            .await
            .unwrap();

        let old = (Utc::now() - Duration::hours(3)).to_rfc3339();
        sqlx::query("UPDATE ethoscopes SET last_seen = ? WHERE ethoscope_id = 'etho_busy'")
            .bind(&old)
            .execute(registry.pool())
            .await
            .unwrap();

        assert_eq!(registry.cleanup_stale_status(2).await.unwrap(), 1);
        let device = registry.get_ethoscope("etho_busy").await.unwrap().unwrap();
        assert_eq!(device.status, "offline");
    }

    #[tokio::test]
    async fn test_stop_orphaned_runs_newest_survives() {
        let registry = test_registry().await;
        registry
            .update_ethoscope(sample_update("etho_r", "ETHOSCOPE_R").status("running"))
            .await
            .unwrap();

        for (run_id, start) in [
            ("run_old", "2024-01-01T00:00:00+00:00"),
            ("run_new", "2025-01-01T00:00:00+00:00"),
        ] {
            registry
                .add_run(NewRun {
                    run_id: Some(run_id.into()),
                    experiment_type: "tracking".into(),
                    ethoscope_id: "etho_r".into(),
                    ..Default::default()
                })
                .await
                .unwrap();
            sqlx::query("UPDATE runs SET start_time = ? WHERE run_id = ?")
                .bind(start)
                .bind(run_id)
                .execute(registry.pool())
                .await
                .unwrap();
        }

        let stopped = registry.stop_orphaned_runs().await.unwrap();
        assert_eq!(stopped, 1, "only the older duplicate is stopped");

        let old = registry.get_run("run_old").await.unwrap().unwrap();
        let new = registry.get_run("run_new").await.unwrap().unwrap();
        assert_eq!(old.status, "stopped");
        assert_eq!(new.status, "running");
    }

    #[tokio::test]
    async fn test_stop_orphaned_runs_device_not_running() {
        let registry = test_registry().await;
        registry
            .update_ethoscope(sample_update("etho_s", "ETHOSCOPE_S").status("stopped"))
            .await
            .unwrap();
        registry
            .add_run(NewRun {
                run_id: Some("run_orphan".into()),
                experiment_type: "tracking".into(),
                ethoscope_id: "etho_s".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let stopped = registry.stop_orphaned_runs().await.unwrap();
        assert_eq!(stopped, 1);
        let run = registry.get_run("run_orphan").await.unwrap().unwrap();
        assert_eq!(run.status, "stopped");
    }
}
