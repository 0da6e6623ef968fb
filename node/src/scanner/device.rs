//! Per-device polling actor.
//!
//! Every discovered device gets one tokio task running its own clock: poll
//! the device, classify what changed, keep the registry and metadata cache
//! in step, and decide whether anything warrants an alert. All mutation
//! happens under the per-device lock; external readers copy.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::AppContext;
use crate::backup::{self, BackupFilename, BackupPolicy, RemoteDbInfo};
use crate::cache::{DbSnapshot, ExperimentInfo};
use crate::client::HttpClient;
use crate::config::AlertConfig;
use crate::db::{EthoscopeUpdate, NewRun};
use crate::error::ScanError;
use crate::notify::{AlertEvent, AlertKind};
use crate::status::{
    epoch_now, DeviceStatus, Instruction, StatusHistory, StatusName, TriggerSource,
};
use crate::stream::{StreamManager, StreamSubscriber};

/// Consecutive connection-refused errors treated as a shutdown.
const REFUSED_SHUTDOWN_THRESHOLD: u32 = 3;

/// Handle to a device actor. Cheap to clone; all clones share one loop.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    ip: String,
    port: u16,
    ctx: AppContext,
    client: HttpClient,
    state: Mutex<DeviceState>,
    running: AtomicBool,
    skip_scanning: AtomicBool,
    stop_notify: Notify,
}

struct DeviceState {
    id: String,
    zeroconf_name: Option<String>,
    info: Map<String, Value>,
    history: StatusHistory,
    ping: u64,
    consecutive_errors: u32,
    last_successful_contact: f64,
    last_user_action: Option<f64>,
    last_user_instruction: Option<Instruction>,
    last_backup_refresh: f64,
    backup_path: Option<PathBuf>,
    last_backup_filename: Option<String>,
    has_received_real_status: bool,
    run_start: Option<DateTime<Utc>>,
    stream: Option<StreamManager>,
}

impl DeviceState {
    fn name(&self) -> String {
        self.info
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.zeroconf_name.clone())
            .unwrap_or_default()
    }

    fn run_id(&self) -> String {
        let Some(exp) = self.info.get("experimental_info") else {
            return String::new();
        };
        match exp.get("run_id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    }
}

impl Device {
    /// Create the actor and start its polling loop.
    pub fn spawn(ctx: AppContext, ip: &str, port: u16) -> Device {
        let timeout = Duration::from_secs_f64(ctx.config.scanner.http_timeout_secs);
        let mut info = Map::new();
        info.insert("ip".into(), Value::String(ip.to_string()));

        let inner = Arc::new(DeviceInner {
            ip: ip.to_string(),
            port,
            client: HttpClient::new(timeout),
            ctx,
            state: Mutex::new(DeviceState {
                id: String::new(),
                zeroconf_name: None,
                info,
                history: StatusHistory::new(DeviceStatus::system(StatusName::Offline)),
                ping: 0,
                consecutive_errors: 0,
                last_successful_contact: epoch_now(),
                last_user_action: None,
                last_user_instruction: None,
                last_backup_refresh: 0.0,
                backup_path: None,
                last_backup_filename: None,
                has_received_real_status: false,
                run_start: None,
                stream: None,
            }),
            running: AtomicBool::new(true),
            skip_scanning: AtomicBool::new(false),
            stop_notify: Notify::new(),
        });

        let loop_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            loop_inner.poll_loop().await;
        });

        Device { inner }
    }

    pub fn ip(&self) -> &str {
        &self.inner.ip
    }

    pub async fn id(&self) -> String {
        self.inner.state.lock().await.id.clone()
    }

    pub async fn name(&self) -> String {
        self.inner.state.lock().await.name()
    }

    pub fn skip_scanning(&self) -> bool {
        self.inner.skip_scanning.load(Ordering::SeqCst)
    }

    /// Latch (or clear) the scanning skip. Clearing also resets the error
    /// state so the next poll starts fresh.
    pub async fn set_skip_scanning(&self, value: bool) {
        self.inner.skip_scanning.store(value, Ordering::SeqCst);
        if !value {
            self.inner.state.lock().await.consecutive_errors = 0;
        }
    }

    pub async fn reset_error_state(&self) {
        self.inner.state.lock().await.consecutive_errors = 0;
    }

    pub async fn set_zeroconf_name(&self, name: Option<String>) {
        self.inner.state.lock().await.zeroconf_name = name;
    }

    /// Stop the polling loop and tear down any shared stream.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.stop_notify.notify_waiters();
        let stream = self.inner.state.lock().await.stream.take();
        if let Some(stream) = stream {
            stream.stop().await;
        }
    }

    pub async fn device_status(&self) -> DeviceStatus {
        self.inner.state.lock().await.history.current().clone()
    }

    /// Copy of the info dict, enriched with status details for readers.
    pub async fn info(&self) -> Map<String, Value> {
        let state = self.inner.state.lock().await;
        let mut info = state.info.clone();
        let current = state.history.current();
        let alerts = &self.inner.ctx.config.alerts;

        info.insert("status".into(), json!(current.name.as_str()));
        info.insert(
            "status_details".into(),
            json!({
                "status": current.name.as_str(),
                "is_user_triggered": current.is_user_triggered,
                "trigger_source": current.trigger_source.to_string(),
                "age_minutes": current.age_minutes(),
                "consecutive_errors": current.consecutive_errors,
                "should_alert": state
                    .history
                    .should_send_alert(alerts.unreachable_timeout_minutes),
            }),
        );
        info.insert(
            "skip_scanning".into(),
            json!(self.inner.skip_scanning.load(Ordering::SeqCst)),
        );
        info
    }

    /// Push an offline status (used by the scanner when a device is
    /// re-advertised or removed) so the next poll re-derives everything.
    pub async fn reset_status_to_offline(&self) {
        let mut state = self.inner.state.lock().await;
        self.inner.push_status(
            &mut state,
            StatusName::Offline,
            false,
            TriggerSource::System,
            Map::new(),
        );
        state
            .info
            .insert("last_seen".into(), json!(epoch_now()));
    }

    /// Fetch `/id` and adopt the reported identity. Returns (old, new).
    pub async fn refresh_identity(&self) -> Result<(String, String), ScanError> {
        self.inner.refresh_id().await
    }

    /// Validate and send a control instruction.
    ///
    /// The instruction is checked against the allow-table for the device's
    /// current (freshly polled) status; a disallowed instruction fails with
    /// a `Device` error and leaves the device untouched. Power operations
    /// are expected to kill the connection mid-request, so their transport
    /// errors are swallowed.
    pub async fn send_instruction(
        &self,
        instruction: Instruction,
        post_data: Option<Value>,
    ) -> Result<(), ScanError> {
        self.inner.update_info().await?;

        let url = {
            let mut state = self.inner.state.lock().await;
            let current = state.history.current().name;
            if !instruction.allowed_from().contains(&current) {
                return Err(ScanError::Device(format!(
                    "Cannot send '{instruction}' to device in status '{current}'"
                )));
            }
            state.last_user_action = Some(epoch_now());
            state.last_user_instruction = Some(instruction);
            format!(
                "http://{}:{}/controls/{}/{}",
                self.inner.ip, self.inner.port, state.id, instruction
            )
        };

        let body = post_data.unwrap_or_else(|| json!({}));
        match self
            .inner
            .client
            .get_json(&url, Some(Duration::from_secs(3)), Some(&body))
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_transport() && instruction.is_power_operation() => {
                debug!(device = %self.inner.ip, instruction = %instruction, "Power operation closed the connection as expected");
            }
            Err(e) => return Err(e),
        }

        // Best-effort refresh; the instruction itself already succeeded.
        let _ = self.inner.update_info().await;
        Ok(())
    }

    /// Push a settings update to the device.
    pub async fn send_settings(&self, post_data: Value) -> Result<Value, ScanError> {
        let url = {
            let state = self.inner.state.lock().await;
            format!(
                "http://{}:{}/update/{}",
                self.inner.ip, self.inner.port, state.id
            )
        };
        let result = self
            .inner
            .client
            .get_json(&url, Some(Duration::from_secs(3)), Some(&post_data))
            .await?;
        let _ = self.inner.update_info().await;
        Ok(result)
    }

    /// Static hardware info; empty map when the device cannot answer.
    pub async fn machine_info(&self) -> Map<String, Value> {
        self.inner
            .fetch_page("machine", None)
            .await
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default()
    }

    /// Attached module info; the module bus is slow to enumerate.
    pub async fn connected_module(&self) -> Map<String, Value> {
        self.inner
            .fetch_page("module", Some(Duration::from_secs(12)))
            .await
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default()
    }

    pub async fn videofiles(&self) -> Vec<String> {
        self.inner
            .fetch_page("data/listfiles/video", None)
            .await
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub async fn user_options(&self) -> Option<Value> {
        self.inner.fetch_page("user_options", None).await
    }

    pub async fn device_log(&self) -> Option<Value> {
        self.inner.fetch_page("data/log", None).await
    }

    /// Trigger an SQL dump on the device.
    pub async fn dump_sql_db(&self) -> Option<Value> {
        self.inner
            .fetch_page("dumpSQLdb", Some(Duration::from_secs(3)))
            .await
    }

    /// The last annotated frame the device drew, as raw JPEG bytes. Only
    /// meaningful while the device is in a stoppable (active) state.
    pub async fn last_image(&self) -> Result<Vec<u8>, ScanError> {
        let current = self.device_status().await.name;
        if !Instruction::Stop.allowed_from().contains(&current) {
            return Err(ScanError::Device(format!(
                "No image available in status '{current}'"
            )));
        }
        self.static_image("last_drawn_img").await
    }

    /// The device's debug frame, when one is published.
    pub async fn debug_image(&self) -> Result<Vec<u8>, ScanError> {
        self.static_image("dbg_img").await
    }

    async fn static_image(&self, key: &str) -> Result<Vec<u8>, ScanError> {
        let img_path = {
            let state = self.inner.state.lock().await;
            state
                .info
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let Some(img_path) = img_path else {
            return Err(ScanError::Payload {
                url: self.inner.url("static"),
                message: format!("device has not reported {key}"),
            });
        };
        self.inner
            .client
            .get_bytes(
                &self.inner.url(&format!("static/{img_path}")),
                Some(Duration::from_secs(10)),
            )
            .await
    }

    /// Attach to the device's shared video stream.
    pub async fn relay_stream(&self) -> Result<StreamSubscriber, ScanError> {
        let manager = {
            let mut state = self.inner.state.lock().await;
            match &state.stream {
                Some(manager) => manager.clone(),
                None => {
                    let manager = StreamManager::new(
                        &self.inner.ip,
                        self.inner.ctx.config.scanner.stream_port,
                        &state.id,
                    );
                    state.stream = Some(manager.clone());
                    manager
                }
            }
        };
        manager.subscribe().await
    }
}

impl DeviceInner {
    fn url(&self, page: &str) -> String {
        format!("http://{}:{}/{page}", self.ip, self.port)
    }

    async fn fetch_page(&self, page: &str, timeout: Option<Duration>) -> Option<Value> {
        let id = self.state.lock().await.id.clone();
        if id.is_empty() {
            return None;
        }
        self.client
            .get_json(&self.url(&format!("{page}/{id}")), timeout, None)
            .await
            .ok()
    }

    /// Main monitoring loop. One iteration per refresh period; the period
    /// stretches to the busy cadence while the device is thinking.
    async fn poll_loop(self: Arc<Self>) {
        let scanner_cfg = &self.ctx.config.scanner;

        while self.running.load(Ordering::SeqCst) {
            let period = {
                let state = self.state.lock().await;
                if state.history.current().name == StatusName::Busy {
                    scanner_cfg.busy_refresh_period_secs
                } else {
                    scanner_cfg.refresh_period_secs
                }
            };

            tokio::select! {
                _ = self.stop_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs_f64(period)) => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            if self.skip_scanning.load(Ordering::SeqCst) {
                let mut state = self.state.lock().await;
                refresh_info_stub(&self.ip, &mut state);
                continue;
            }

            match self.update_info().await {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    if state.consecutive_errors > 0 {
                        info!(
                            ip = %self.ip,
                            errors = state.consecutive_errors,
                            "Device recovered"
                        );
                        state.consecutive_errors = 0;
                    }
                    state.last_successful_contact = epoch_now();
                    let last_contact = state.last_successful_contact;
                    state
                        .info
                        .insert("last_successful_contact".into(), json!(last_contact));
                }
                Err(e) => {
                    if !self.skip_scanning.load(Ordering::SeqCst) {
                        self.handle_device_error(e).await;
                    }
                }
            }
        }
        debug!(ip = %self.ip, "Device loop stopped");
    }

    /// One full poll: ensure identity, fetch the data page, digest it.
    /// A device answering `/id` but not its data page is busy; answering
    /// neither starts the unreachable countdown.
    async fn update_info(&self) -> Result<(), ScanError> {
        {
            let mut state = self.state.lock().await;
            state.ping += 1;
            let ping = state.ping;
            state.info.insert("ping".into(), json!(ping));
        }

        let id = self.state.lock().await.id.clone();
        if id.is_empty() {
            self.refresh_id().await?;
        }
        let id = self.state.lock().await.id.clone();

        let data_url = self.url(&format!("data/{id}"));
        match self.client.get_json(&data_url, None, None).await {
            Ok(Value::Object(report)) => {
                self.process_report(report).await;
                Ok(())
            }
            Ok(other) => Err(ScanError::Payload {
                url: data_url,
                message: format!("expected object, got {other}"),
            }),
            Err(data_err) => {
                match self
                    .client
                    .get_json(&self.url("id"), Some(Duration::from_secs(5)), None)
                    .await
                {
                    Ok(_) => {
                        warn!(
                            ip = %self.ip,
                            "Device responds but cannot communicate its status, flagged busy"
                        );
                        self.mark_busy().await;
                        Err(data_err)
                    }
                    Err(id_err) => {
                        self.handle_unreachable().await;
                        Err(id_err)
                    }
                }
            }
        }
    }

    /// Fetch `/id`, detect identity changes. Returns (old, new).
    async fn refresh_id(&self) -> Result<(String, String), ScanError> {
        let resp = self.client.get_json(&self.url("id"), None, None).await?;
        let new_id = resp
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if new_id.is_empty() {
            return Err(ScanError::Payload {
                url: self.url("id"),
                message: "missing id field".into(),
            });
        }

        let mut state = self.state.lock().await;
        let old_id = state.id.clone();
        if old_id != new_id && !old_id.is_empty() {
            info!(ip = %self.ip, old = %old_id, new = %new_id, "Device id changed");
        }
        state.id = new_id.clone();
        state.info.insert("id".into(), json!(new_id));
        state
            .info
            .insert("ip".into(), json!(self.ip.clone()));
        Ok((old_id, new_id))
    }

    /// Digest a successful data-page report: merge it, classify the status
    /// transition, and run all the downstream bookkeeping.
    async fn process_report(&self, report: Map<String, Value>) {
        let report_had_backup_status = report.contains_key("backup_status");

        let mut state = self.state.lock().await;
        let prev = state.history.current().name;

        for (key, value) in report {
            state.info.insert(key, value);
        }
        state.info.insert("last_seen".into(), json!(epoch_now()));
        state
            .info
            .insert("last_ip".into(), json!(self.ip.clone()));

        let next = match state.info.get("status").and_then(Value::as_str) {
            Some(raw) => raw.parse::<StatusName>().unwrap_or_else(|_| {
                warn!(ip = %self.ip, status = raw, "Device reported unknown status");
                StatusName::Offline
            }),
            None => StatusName::Offline,
        };

        if next != prev {
            let seconds_since_action = state.last_user_action.map(|t| epoch_now() - t);
            let (is_user, trigger) = classify_transition(
                prev,
                next,
                state.last_user_instruction,
                seconds_since_action,
                &self.ctx.config.alerts,
            );
            if is_user && prev == StatusName::Offline {
                info!(
                    ip = %self.ip,
                    status = %next,
                    "Device found in tracking state, marking as user-initiated"
                );
            }
            let mut metadata = Map::new();
            metadata.insert("previous_status".into(), json!(prev.as_str()));
            self.push_status(&mut state, next, is_user, trigger, metadata);
        }

        if prev == StatusName::Offline && next != StatusName::Offline {
            self.handle_coming_online(&mut state).await;
        }

        // Keep the registry's view of the live status current.
        if next != prev && !state.id.is_empty() {
            let _ = self
                .ctx
                .registry
                .update_ethoscope(EthoscopeUpdate::new(&state.id).status(next.as_str()))
                .await;
        }

        // Re-derive the backup path when the status flips, the path is
        // still unknown, or the device reports a different backup file.
        let reported = pick_backup_filename(&state.info, next);
        let filename_changed =
            reported.is_some() && reported != state.last_backup_filename;
        if next != prev || state.backup_path.is_none() || filename_changed {
            self.make_backup_path(&mut state, reported.as_deref());
            state.last_backup_filename = reported;
        }

        self.handle_run_transition(&mut state, prev, next).await;
        self.maybe_send_transition_alerts(&mut state).await;
        self.update_backup_status(&mut state, report_had_backup_status)
            .await;
        self.check_storage_warnings(&mut state).await;
    }

    /// Append a status snapshot. Same-name re-observations are not pushed;
    /// transitions are logged only when the name changes.
    fn push_status(
        &self,
        state: &mut DeviceState,
        name: StatusName,
        is_user_triggered: bool,
        trigger_source: TriggerSource,
        metadata: Map<String, Value>,
    ) {
        let prev = state.history.current().name;
        if prev == name {
            return;
        }

        let mut status = DeviceStatus::new(name, is_user_triggered, trigger_source, metadata);
        if prev == StatusName::Offline && !state.has_received_real_status {
            status.is_initial_discovery = true;
            state.has_received_real_status = true;
        }
        status.consecutive_errors = state.consecutive_errors;

        info!(
            ip = %self.ip,
            from = %prev,
            to = %name,
            trigger = %trigger_source,
            user = is_user_triggered,
            "Status changed"
        );
        state.history.push(status);
        state
            .info
            .insert("consecutive_errors".into(), json!(state.consecutive_errors));
    }

    /// First contact after being offline: persist identity and hardware
    /// info. Factory-default devices are skipped by the registry itself.
    async fn handle_coming_online(&self, state: &mut DeviceState) {
        let name = state.name();
        if name.to_uppercase().contains("ETHOSCOPE_000") {
            return;
        }
        let id = state.id.clone();
        if id.is_empty() {
            return;
        }

        let machine_info = self
            .client
            .get_json(&self.url(&format!("machine/{id}")), None, None)
            .await
            .ok();
        let summary = machine_info
            .as_ref()
            .and_then(|m| {
                let kernel = m.get("kernel")?.as_str()?;
                let pi = m.get("pi_version")?;
                Some(format!("{kernel} on pi{pi}"))
            })
            .unwrap_or_default();

        let mut update = EthoscopeUpdate::new(&id).last_ip(self.ip.clone());
        if !name.is_empty() {
            update = update.name(name);
        }
        if !summary.is_empty() {
            update = update.machineinfo(summary);
        }
        if let Err(e) = self.ctx.registry.update_ethoscope(update).await {
            warn!(ip = %self.ip, error = %e, "Failed to persist device coming online");
        }
    }

    /// Registry wiring for experiment lifecycle transitions.
    async fn handle_run_transition(
        &self,
        state: &mut DeviceState,
        prev: StatusName,
        next: StatusName,
    ) {
        let run_id = state.run_id();
        if run_id.is_empty() {
            return;
        }

        match (prev, next) {
            (StatusName::Initialising, StatusName::Running) => {
                if state.run_start.is_none() {
                    state.run_start = state
                        .last_backup_filename
                        .as_deref()
                        .and_then(run_start_from_filename);
                }
                let exp = state
                    .info
                    .get("experimental_info")
                    .cloned()
                    .unwrap_or_default();
                let new_run = NewRun {
                    run_id: Some(run_id.clone()),
                    experiment_type: "tracking".into(),
                    ethoscope_name: state.name(),
                    ethoscope_id: state.id.clone(),
                    user_name: exp
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .into(),
                    user_id: exp
                        .get("user_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .into(),
                    location: exp
                        .get("location")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .into(),
                    alert: true,
                    comments: String::new(),
                    experimental_data: state
                        .backup_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                };
                if let Err(e) = self.ctx.registry.add_run(new_run).await {
                    warn!(run = %run_id, error = %e, "Failed to record run start");
                }
            }
            (StatusName::Initialising, StatusName::Stopping) => {
                if let Err(e) = self.ctx.registry.flag_problem(&run_id, "self-stopped").await {
                    warn!(run = %run_id, error = %e, "Failed to flag self-stopped run");
                }
            }
            (StatusName::Running, StatusName::Stopped) => {
                if let Err(e) = self.ctx.registry.stop_run(&run_id).await {
                    warn!(run = %run_id, error = %e, "Failed to record run stop");
                }
                let current = state.history.current();
                let graceful = current.is_user_triggered || current.is_graceful_operation();
                let reason = if graceful { "user_stop" } else { "unexpected_stop" };
                if let Some(start) = state.run_start {
                    let name = state.name();
                    if let Err(e) = self.ctx.cache.finalise(&name, start, graceful, reason) {
                        warn!(run = %run_id, error = %e, "Failed to finalise metadata cache");
                    }
                }
            }
            _ => {}
        }
    }

    /// Dispatch an alert for the current state when the status logic says
    /// one is warranted and the `(device, type, run)` triple has not been
    /// alerted on yet.
    async fn maybe_send_transition_alerts(&self, state: &mut DeviceState) {
        let alerts = &self.ctx.config.alerts;
        if !state
            .history
            .should_send_alert(alerts.unreachable_timeout_minutes)
        {
            return;
        }

        let current = state.history.current();
        let kind = match current.name {
            StatusName::Stopped => AlertKind::DeviceStopped,
            StatusName::Offline => {
                let reason = current
                    .metadata
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let timed_out = matches!(reason, "unreachable_timeout" | "busy_timeout");
                if timed_out && !state.history.is_interrupted_tracking_session() {
                    AlertKind::DeviceUnreachable
                } else {
                    AlertKind::DeviceStopped
                }
            }
            StatusName::Unreached => AlertKind::DeviceUnreachable,
            _ => return,
        };

        let device_id = state.id.clone();
        if device_id.is_empty() {
            return;
        }
        let run_id = state.run_id();
        let name = state.name();

        match self
            .ctx
            .registry
            .has_alert_been_sent(&device_id, kind.as_str(), &run_id)
            .await
        {
            Ok(true) => {
                debug!(device = %device_id, kind = kind.as_str(), "Alert already sent for this run");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(device = %device_id, error = %e, "Alert dedup lookup failed");
                return;
            }
        }

        let message = match kind {
            AlertKind::DeviceStopped => {
                format!("Device {name} ({device_id}) stopped unexpectedly")
            }
            AlertKind::DeviceUnreachable => {
                format!("Device {name} ({device_id}) became unreachable")
            }
            AlertKind::StorageWarning => unreachable!("storage alerts have their own path"),
        };
        let event = AlertEvent {
            kind,
            device_id: device_id.clone(),
            device_name: name,
            run_id: run_id.clone(),
            message: message.clone(),
        };

        self.ctx.notifier.dispatch(&event).await;
        if let Err(e) = self
            .ctx
            .registry
            .log_alert(&device_id, kind.as_str(), &run_id, &message, "")
            .await
        {
            warn!(device = %device_id, error = %e, "Failed to log alert");
        }
    }

    /// The device answers `/id` but not its data page. Flag it busy and
    /// promote to offline once it has been thinking for too long.
    async fn mark_busy(&self) {
        let mut state = self.state.lock().await;
        let alerts = &self.ctx.config.alerts;
        let current = state.history.current().name;

        if current == StatusName::Busy {
            let busy_minutes = state.history.current_state_duration_minutes();
            if busy_minutes > alerts.busy_timeout_minutes {
                info!(
                    ip = %self.ip,
                    busy_minutes,
                    "Busy timeout exceeded, marking offline"
                );
                let mut metadata = Map::new();
                metadata.insert("reason".into(), json!("busy_timeout"));
                self.push_status(
                    &mut state,
                    StatusName::Offline,
                    false,
                    TriggerSource::System,
                    metadata,
                );
                self.persist_status(&state, "offline").await;
                self.maybe_send_transition_alerts(&mut state).await;
            } else {
                info!(
                    ip = %self.ip,
                    busy_minutes,
                    timeout = alerts.busy_timeout_minutes,
                    "Device still busy"
                );
                state.info.insert("last_seen".into(), json!(epoch_now()));
            }
        } else {
            self.push_status(
                &mut state,
                StatusName::Busy,
                false,
                TriggerSource::Network,
                Map::new(),
            );
            state.info.insert("last_seen".into(), json!(epoch_now()));
            self.persist_status(&state, "busy").await;
        }
    }

    /// Neither endpoint answers. Enter (or advance) the unreachable state
    /// machine and keep experiment records honest while the device is dark.
    async fn handle_unreachable(&self) {
        let mut state = self.state.lock().await;
        let alerts = &self.ctx.config.alerts;
        let prev = state.history.current().name;

        match prev {
            StatusName::Busy => {
                if state.history.current_state_duration_minutes() > alerts.busy_timeout_minutes {
                    let mut metadata = Map::new();
                    metadata.insert("reason".into(), json!("busy_timeout"));
                    self.push_status(
                        &mut state,
                        StatusName::Offline,
                        false,
                        TriggerSource::System,
                        metadata,
                    );
                    self.persist_status(&state, "offline").await;
                    self.maybe_send_transition_alerts(&mut state).await;
                }
            }
            StatusName::Unreached => {
                if state
                    .history
                    .current()
                    .is_timeout_exceeded(alerts.unreachable_timeout_minutes)
                {
                    info!(
                        ip = %self.ip,
                        timeout = alerts.unreachable_timeout_minutes,
                        "Unreachable timeout exceeded, marking offline"
                    );
                    let mut metadata = Map::new();
                    metadata.insert("reason".into(), json!("unreachable_timeout"));
                    self.push_status(
                        &mut state,
                        StatusName::Offline,
                        false,
                        TriggerSource::System,
                        metadata,
                    );
                    self.persist_status(&state, "offline").await;
                    self.maybe_send_transition_alerts(&mut state).await;
                } else {
                    // Still inside the allowance; try the cache for backup
                    // progress since the device itself cannot report it.
                    self.update_backup_status_from_cache(&mut state).await;
                }
            }
            _ => {
                info!(ip = %self.ip, was = %prev, "Device becoming unreachable");
                let mut metadata = Map::new();
                metadata.insert("previous_status".into(), json!(prev.as_str()));
                self.push_status(
                    &mut state,
                    StatusName::Unreached,
                    false,
                    TriggerSource::Network,
                    metadata,
                );

                let run_id = state.run_id();
                if !run_id.is_empty() {
                    if let Err(e) = self.ctx.registry.flag_problem(&run_id, "unreached").await {
                        warn!(run = %run_id, error = %e, "Failed to flag unreached run");
                    }
                    if prev == StatusName::Running {
                        self.persist_status(&state, "unreached").await;
                    }
                } else if prev == StatusName::Stopped {
                    self.persist_status(&state, "offline").await;
                }
            }
        }

        refresh_info_stub(&self.ip, &mut state);
    }

    async fn persist_status(&self, state: &DeviceState, status: &str) {
        if state.id.is_empty() {
            return;
        }
        if let Err(e) = self
            .ctx
            .registry
            .update_ethoscope(EthoscopeUpdate::new(&state.id).status(status))
            .await
        {
            warn!(device = %state.id, error = %e, "Failed to persist device status");
        }
    }

    /// Classify a poll failure. Connection refusals are evidence of a
    /// shutdown: after three in a row the device latches `skip_scanning`,
    /// marked graceful when a recent power instruction explains it. Other
    /// errors latch after `max_consecutive_errors`.
    async fn handle_device_error(&self, error: ScanError) {
        let mut state = self.state.lock().await;
        state.consecutive_errors += 1;
        let errors = state.consecutive_errors;
        state
            .info
            .insert("consecutive_errors".into(), json!(errors));
        refresh_info_stub(&self.ip, &mut state);

        if error.is_connection_refused() {
            if errors >= REFUSED_SHUTDOWN_THRESHOLD {
                let graceful = state.history.current().is_graceful_operation()
                    || recent_graceful_instruction(&state, &self.ctx.config.alerts);

                self.skip_scanning.store(true, Ordering::SeqCst);
                let mut metadata = Map::new();
                if graceful {
                    info!(
                        ip = %self.ip,
                        "Device shut down gracefully, stopping interrogation"
                    );
                    metadata.insert("reason".into(), json!("graceful_shutdown"));
                    self.push_status(
                        &mut state,
                        StatusName::Offline,
                        false,
                        TriggerSource::Graceful,
                        metadata,
                    );
                } else {
                    info!(
                        ip = %self.ip,
                        errors,
                        "Consecutive connection refusals, device appears shut down ungracefully"
                    );
                    metadata.insert("reason".into(), json!("ungraceful_shutdown"));
                    self.push_status(
                        &mut state,
                        StatusName::Offline,
                        false,
                        TriggerSource::System,
                        metadata,
                    );
                    self.maybe_send_transition_alerts(&mut state).await;
                }
                self.persist_status(&state, "offline").await;
            } else {
                info!(
                    ip = %self.ip,
                    "Connection refused (attempt {errors}/{REFUSED_SHUTDOWN_THRESHOLD})"
                );
            }
            return;
        }

        let max_errors = self.ctx.config.scanner.max_consecutive_errors;
        if errors >= max_errors {
            info!(
                ip = %self.ip,
                errors,
                "Device appears offline, stopping interrogation"
            );
            self.skip_scanning.store(true, Ordering::SeqCst);
            let mut metadata = Map::new();
            metadata.insert("reason".into(), json!("max_errors_reached"));
            self.push_status(
                &mut state,
                StatusName::Offline,
                false,
                TriggerSource::System,
                metadata,
            );
            self.persist_status(&state, "offline").await;
            self.maybe_send_transition_alerts(&mut state).await;
        } else {
            // Log with decreasing verbosity to keep the log readable while
            // a device is flapping.
            match errors {
                1 => info!(ip = %self.ip, error = %error, "Device connection failed"),
                5 => warn!(
                    ip = %self.ip,
                    "Device has 5 consecutive errors, will stop interrogating at {max_errors}"
                ),
                _ => debug!(ip = %self.ip, errors, error = %error, "Device error"),
            }
        }
    }

    /// Derive and store the local backup path from the reported filename.
    fn make_backup_path(&self, state: &mut DeviceState, filename: Option<&str>) {
        let name = state.name();
        let results_dir = PathBuf::from(&self.ctx.config.node.results_dir);

        let path = filename.and_then(|f| backup::backup_path(&results_dir, &name, f));
        match &path {
            Some(p) => {
                debug!(ip = %self.ip, path = %p.display(), "Derived backup path");
                state
                    .info
                    .insert("backup_path".into(), json!(p.display().to_string()));
                if state.run_start.is_none() {
                    state.run_start = filename.and_then(run_start_from_filename);
                }
            }
            None => {
                state.info.insert("backup_path".into(), Value::Null);
            }
        }
        state.backup_path = path;
    }

    /// Recompute the backup fields at most once per configured interval.
    async fn update_backup_status(&self, state: &mut DeviceState, device_provided: bool) {
        let interval = self.ctx.config.scanner.db_update_interval_secs;
        if epoch_now() - state.last_backup_refresh < interval {
            return;
        }
        state.last_backup_refresh = epoch_now();

        // New-format devices compute their own backup status; trust it.
        if device_provided {
            if !state.info.contains_key("backup_size") {
                state.info.insert("backup_size".into(), json!(0));
            }
            if !state.info.contains_key("time_since_backup") {
                state.info.insert("time_since_backup".into(), json!(0));
            }
            return;
        }

        if state.backup_path.is_none() {
            let reported = pick_backup_filename(&state.info, state.history.current().name);
            self.make_backup_path(state, reported.as_deref());
        }
        let Some(path) = state.backup_path.clone() else {
            state.info.insert("backup_status".into(), json!("No Backup"));
            return;
        };
        if !path.exists() {
            state
                .info
                .insert("backup_status".into(), json!("File Missing"));
            return;
        }

        let remote = match select_remote(&state.info) {
            RemoteSelection::Remote(remote) => remote,
            RemoteSelection::DbError => {
                state.info.insert("backup_status".into(), json!("DB Error"));
                return;
            }
            RemoteSelection::None => {
                state
                    .info
                    .insert("backup_status".into(), json!("No Database"));
                return;
            }
        };

        self.write_cache_snapshot(state, &remote);
        self.apply_backup_policy(state, &path, remote).await;
    }

    /// When the device is dark, fall back to the cached metadata snapshot
    /// for backup progress.
    async fn update_backup_status_from_cache(&self, state: &mut DeviceState) {
        let interval = self.ctx.config.scanner.db_update_interval_secs;
        if epoch_now() - state.last_backup_refresh < interval {
            return;
        }
        state.last_backup_refresh = epoch_now();

        let Some(path) = state.backup_path.clone() else {
            return;
        };
        if !path.exists() {
            return;
        }
        let name = state.name();
        if name.is_empty() {
            return;
        }
        let Some(doc) = self.ctx.cache.latest(&name) else {
            return;
        };

        let remote = RemoteDbInfo {
            db_size_bytes: Some(doc.snapshot.db_size_bytes),
            table_counts: (!doc.snapshot.table_counts.is_empty())
                .then(|| doc.snapshot.table_counts.clone()),
            date: Some(doc.last_updated),
            backup_filename: None,
            db_version: Some(doc.snapshot.db_version.clone()),
        };
        debug!(ip = %self.ip, "Using cached metadata for backup status");
        self.apply_backup_policy(state, &path, remote).await;
    }

    /// Compare the local backup file against the remote metadata under
    /// whichever policy the metadata supports, and record the outcome.
    async fn apply_backup_policy(
        &self,
        state: &mut DeviceState,
        path: &std::path::Path,
        remote: RemoteDbInfo,
    ) {
        let Some(policy) = BackupPolicy::from_remote(&remote) else {
            state
                .info
                .insert("backup_status".into(), json!("No Database"));
            return;
        };

        let local_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let local_counts = match &policy {
            BackupPolicy::TableCount(_) => match backup::sqlite_table_counts(path).await {
                Ok(counts) => counts,
                Err(e) => {
                    debug!(ip = %self.ip, error = %e, "Could not read backup database");
                    state
                        .info
                        .insert("backup_status".into(), json!("Backup Read Error"));
                    return;
                }
            },
            BackupPolicy::FileSize(_) => Default::default(),
        };

        let percent = policy.percent(local_size, &local_counts);
        let time_since_backup = std::fs::metadata(path)
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.elapsed().ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        state.info.insert("backup_status".into(), json!(percent));
        state.info.insert("backup_size".into(), json!(local_size));
        state
            .info
            .insert("time_since_backup".into(), json!(time_since_backup));
        state
            .info
            .insert("backup_method".into(), json!(policy.method().as_str()));

        debug!(
            ip = %self.ip,
            percent,
            method = policy.method().as_str(),
            "Backup status updated"
        );
    }

    /// Persist the remote metadata snapshot to the per-experiment cache so
    /// it survives the device going dark.
    fn write_cache_snapshot(&self, state: &mut DeviceState, remote: &RemoteDbInfo) {
        let name = state.name();
        let Some(start) = state.run_start else { return };
        if name.is_empty() {
            return;
        }

        let snapshot = DbSnapshot {
            db_size_bytes: remote.db_size_bytes.unwrap_or(0),
            table_counts: remote.table_counts.clone().unwrap_or_default(),
            db_version: remote.db_version.clone().unwrap_or_default(),
            last_db_update: epoch_now(),
        };
        let exp = state.info.get("experimental_info");
        let experiment = ExperimentInfo {
            user_name: exp
                .and_then(|e| e.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .into(),
            location: exp
                .and_then(|e| e.get("location"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .into(),
            backup_filename: state.last_backup_filename.clone().unwrap_or_default(),
            result_writer: if remote.table_counts.is_some() {
                "MariaDB".into()
            } else {
                "SQLite".into()
            },
        };

        if let Err(e) = self
            .ctx
            .cache
            .update(&name, start, &snapshot, Some(&experiment))
        {
            warn!(ip = %self.ip, error = %e, "Failed to update metadata cache");
        }
    }

    /// Fire a storage warning when the device reports a filesystem over
    /// the configured threshold. Deduplicated per run like other alerts.
    async fn check_storage_warnings(&self, state: &mut DeviceState) {
        let threshold = self.ctx.config.alerts.storage_warning_threshold;
        let Some(disk_usage) = state
            .info
            .get("machine_info")
            .and_then(|m| m.get("disk_usage"))
            .and_then(Value::as_object)
            .cloned()
        else {
            return;
        };

        for (mount, usage) in disk_usage {
            let used_percent = usage.get("used_percent").and_then(Value::as_f64).unwrap_or(0.0);
            if used_percent < threshold {
                continue;
            }

            let device_id = state.id.clone();
            if device_id.is_empty() {
                continue;
            }
            let run_id = state.run_id();
            let kind = AlertKind::StorageWarning;

            match self
                .ctx
                .registry
                .has_alert_been_sent(&device_id, kind.as_str(), &run_id)
                .await
            {
                Ok(false) => {}
                _ => continue,
            }

            let name = state.name();
            let message = format!(
                "Device {name} ({device_id}) storage at {used_percent:.0}% on {mount}"
            );
            let event = AlertEvent {
                kind,
                device_id: device_id.clone(),
                device_name: name,
                run_id: run_id.clone(),
                message: message.clone(),
            };
            self.ctx.notifier.dispatch(&event).await;
            if let Err(e) = self
                .ctx
                .registry
                .log_alert(&device_id, kind.as_str(), &run_id, &message, "")
                .await
            {
                warn!(device = %device_id, error = %e, "Failed to log storage alert");
            }
        }
    }
}

/// Refresh the offline stub fields in the info dict, preserving whatever
/// identity the device already resolved.
fn refresh_info_stub(ip: &str, state: &mut DeviceState) {
    state.info.insert("ip".into(), json!(ip));
    state.info.insert("last_ip".into(), json!(ip));
    state.info.insert("last_seen".into(), json!(epoch_now()));
    state.info.insert("ping".into(), json!(state.ping));
    state
        .info
        .insert("consecutive_errors".into(), json!(state.consecutive_errors));
}

/// Did a recent user instruction make an upcoming disappearance graceful?
fn recent_graceful_instruction(state: &DeviceState, alerts: &AlertConfig) -> bool {
    match (state.last_user_instruction, state.last_user_action) {
        (Some(instruction), Some(at)) => {
            instruction.is_power_operation()
                && epoch_now() - at < alerts.graceful_shutdown_grace_minutes * 60.0
        }
        _ => false,
    }
}

/// Decide user-provenance and trigger source for an observed transition.
fn classify_transition(
    prev: StatusName,
    next: StatusName,
    last_instruction: Option<Instruction>,
    seconds_since_action: Option<f64>,
    alerts: &AlertConfig,
) -> (bool, TriggerSource) {
    let recent_stop_instruction = matches!(
        (last_instruction, seconds_since_action),
        (Some(instruction), Some(secs))
            if instruction.is_stop_class() && secs < alerts.user_action_timeout_seconds
    );

    let mut is_user = recent_stop_instruction;
    let mut trigger = if is_user {
        TriggerSource::User
    } else {
        TriggerSource::System
    };

    // Tracking cannot start without user intent: a device reappearing
    // straight into an acquisition state was started by somebody.
    if prev == StatusName::Offline
        && matches!(
            next,
            StatusName::Running | StatusName::Recording | StatusName::Streaming
        )
    {
        is_user = true;
        trigger = TriggerSource::User;
    }

    let graceful = matches!(
        (last_instruction, seconds_since_action),
        (Some(instruction), Some(secs))
            if instruction.is_power_operation()
                && secs < alerts.graceful_shutdown_grace_minutes * 60.0
    );
    if graceful {
        trigger = TriggerSource::Graceful;
    }

    (is_user, trigger)
}

/// Pick the backup filename the device is currently reporting, preferring
/// the nested `databases` map over the legacy flat shapes.
fn pick_backup_filename(info: &Map<String, Value>, current: StatusName) -> Option<String> {
    if let Some(dbs) = info.get("databases").and_then(Value::as_object) {
        for kind in ["MariaDB", "SQLite"] {
            let filename = dbs
                .get(kind)
                .and_then(Value::as_object)
                .and_then(|m| m.values().next())
                .and_then(|entry| entry.get("backup_filename"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty());
            if let Some(filename) = filename {
                return Some(filename.to_string());
            }
        }
    }

    if let Some(di) = info.get("database_info").and_then(Value::as_object) {
        let key = match di.get("active_type").and_then(Value::as_str) {
            Some("mariadb") => Some("mariadb"),
            Some("sqlite") => Some("sqlite"),
            _ => None,
        };
        let filename = key
            .and_then(|k| di.get(k))
            .and_then(|v| v.get("current"))
            .and_then(|c| c.get("backup_filename"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        if let Some(filename) = filename {
            return Some(filename.to_string());
        }
    }

    if let Some(filename) = info
        .get("backup_filename")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    {
        return Some(filename.to_string());
    }

    // A stopped device keeps pointing at its last experiment's backup.
    if current == StatusName::Stopped {
        if let Some(filename) = info
            .get("previous_backup_filename")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        {
            return Some(filename.to_string());
        }
    }

    None
}

enum RemoteSelection {
    Remote(RemoteDbInfo),
    DbError,
    None,
}

/// Choose the remote metadata to measure backup progress against. The
/// nested `databases.{MariaDB,SQLite}` map is preferred; the flat
/// `database_info` map is kept for older device software.
fn select_remote(info: &Map<String, Value>) -> RemoteSelection {
    if let Some(dbs) = info.get("databases").and_then(Value::as_object) {
        for kind in ["MariaDB", "SQLite"] {
            if let Some(entry) = dbs
                .get(kind)
                .and_then(Value::as_object)
                .and_then(|m| m.values().next())
            {
                return RemoteSelection::Remote(RemoteDbInfo::from_value(entry));
            }
        }
    }

    if let Some(di) = info.get("database_info") {
        if di.get("db_status").and_then(Value::as_str) == Some("error") {
            return RemoteSelection::DbError;
        }
        let mut remote = RemoteDbInfo::from_value(di);
        // SQLite result writers are mirrored whole-file; row counts do not
        // describe their backup progress.
        if uses_sqlite_writer(info) {
            remote.table_counts = None;
        }
        if remote.db_size_bytes.is_some() || remote.table_counts.is_some() {
            return RemoteSelection::Remote(remote);
        }
    }

    RemoteSelection::None
}

fn uses_sqlite_writer(info: &Map<String, Value>) -> bool {
    info.get("experimental_info")
        .and_then(|e| e.get("selected_options"))
        .and_then(Value::as_str)
        .map(|s| s.contains("SQLiteResultWriter"))
        .unwrap_or(false)
}

/// The backup filename's timestamp is the experiment's start time.
fn run_start_from_filename(filename: &str) -> Option<DateTime<Utc>> {
    let parsed = BackupFilename::parse(filename)?;
    let naive = chrono::NaiveDateTime::parse_from_str(
        &format!("{}_{}", parsed.date, parsed.time),
        "%Y-%m-%d_%H-%M-%S",
    )
    .ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alerts() -> AlertConfig {
        AlertConfig::default()
    }

    #[test]
    fn test_classify_recent_stop_is_user_triggered() {
        let (is_user, trigger) = classify_transition(
            StatusName::Running,
            StatusName::Stopped,
            Some(Instruction::Stop),
            Some(10.0),
            &alerts(),
        );
        assert!(is_user);
        assert_eq!(trigger, TriggerSource::User);
    }

    #[test]
    fn test_classify_stale_instruction_is_system() {
        let (is_user, trigger) = classify_transition(
            StatusName::Running,
            StatusName::Stopped,
            Some(Instruction::Stop),
            Some(120.0),
            &alerts(),
        );
        assert!(!is_user);
        assert_eq!(trigger, TriggerSource::System);
    }

    #[test]
    fn test_classify_non_stop_instruction_is_system() {
        let (is_user, _) = classify_transition(
            StatusName::Running,
            StatusName::Stopped,
            Some(Instruction::Start),
            Some(5.0),
            &alerts(),
        );
        assert!(!is_user);
    }

    #[test]
    fn test_classify_offline_to_tracking_forces_user() {
        let (is_user, trigger) = classify_transition(
            StatusName::Offline,
            StatusName::Running,
            None,
            None,
            &alerts(),
        );
        assert!(is_user, "tracking cannot start without user intent");
        assert_eq!(trigger, TriggerSource::User);
    }

    #[test]
    fn test_classify_graceful_window() {
        let (_, trigger) = classify_transition(
            StatusName::Running,
            StatusName::Stopped,
            Some(Instruction::Poweroff),
            Some(60.0),
            &alerts(),
        );
        assert_eq!(trigger, TriggerSource::Graceful);

        // Outside the grace window the poweroff no longer explains it.
        let (_, trigger) = classify_transition(
            StatusName::Running,
            StatusName::Stopped,
            Some(Instruction::Poweroff),
            Some(6.0 * 60.0),
            &alerts(),
        );
        assert_eq!(trigger, TriggerSource::System);
    }

    #[test]
    fn test_pick_backup_filename_prefers_nested_databases() {
        let info = serde_json::json!({
            "backup_filename": "2025-01-01_00-00-00_top.db",
            "databases": {
                "MariaDB": {
                    "etho_db": {"backup_filename": "2025-01-01_00-00-00_nested.db"}
                }
            }
        });
        let info = info.as_object().unwrap().clone();
        assert_eq!(
            pick_backup_filename(&info, StatusName::Running).as_deref(),
            Some("2025-01-01_00-00-00_nested.db")
        );
    }

    #[test]
    fn test_pick_backup_filename_falls_back_to_flat_and_legacy() {
        let info = serde_json::json!({
            "database_info": {
                "active_type": "sqlite",
                "sqlite": {"current": {"backup_filename": "2025-01-01_00-00-00_flat.db"}}
            }
        });
        let info = info.as_object().unwrap().clone();
        assert_eq!(
            pick_backup_filename(&info, StatusName::Running).as_deref(),
            Some("2025-01-01_00-00-00_flat.db")
        );

        let info = serde_json::json!({"backup_filename": "2025-01-01_00-00-00_top.db"});
        let info = info.as_object().unwrap().clone();
        assert_eq!(
            pick_backup_filename(&info, StatusName::Running).as_deref(),
            Some("2025-01-01_00-00-00_top.db")
        );
    }

    #[test]
    fn test_pick_previous_backup_only_when_stopped() {
        let info = serde_json::json!({"previous_backup_filename": "2025-01-01_00-00-00_prev.db"});
        let info = info.as_object().unwrap().clone();
        assert_eq!(
            pick_backup_filename(&info, StatusName::Stopped).as_deref(),
            Some("2025-01-01_00-00-00_prev.db")
        );
        assert_eq!(pick_backup_filename(&info, StatusName::Running), None);
    }

    #[test]
    fn test_select_remote_prefers_nested_and_flags_errors() {
        let info = serde_json::json!({
            "databases": {
                "SQLite": {"etho_db": {"filesize": 1000}}
            },
            "database_info": {"db_status": "error"}
        });
        let info = info.as_object().unwrap().clone();
        match select_remote(&info) {
            RemoteSelection::Remote(remote) => {
                assert_eq!(remote.db_size_bytes, Some(1000));
            }
            _ => panic!("nested databases must win"),
        }

        let info = serde_json::json!({"database_info": {"db_status": "error"}});
        let info = info.as_object().unwrap().clone();
        assert!(matches!(select_remote(&info), RemoteSelection::DbError));
    }

    #[test]
    fn test_select_remote_sqlite_writer_drops_table_counts() {
        let info = serde_json::json!({
            "experimental_info": {"selected_options": "... SQLiteResultWriter ..."},
            "database_info": {"db_size_bytes": 500, "table_counts": {"ROI_1": 10}}
        });
        let info = info.as_object().unwrap().clone();
        match select_remote(&info) {
            RemoteSelection::Remote(remote) => {
                assert!(remote.table_counts.is_none());
                assert_eq!(remote.db_size_bytes, Some(500));
            }
            _ => panic!("expected remote metadata"),
        }
    }

    #[test]
    fn test_run_start_from_filename() {
        let start = run_start_from_filename("2025-06-13_16-05-37_abc.db").unwrap();
        assert_eq!(start.to_rfc3339(), "2025-06-13T16:05:37+00:00");
        assert!(run_start_from_filename("nope.db").is_none());
    }
}
