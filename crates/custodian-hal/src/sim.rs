//! In-process simulated device for CI/CD testing without real hardware.
//!
//! [`SimDevice`] implements every platform trait on top of a small mutable
//! model.  It records launches, lock-task changes, prompts, notifications and
//! reboots so tests can assert on them, and it can be scripted with capability
//! answers and location fixes.
//!
//! # Example
//!
//! ```rust
//! use custodian_hal::sim::SimDevice;
//! use custodian_hal::AppLauncher;
//!
//! let device = SimDevice::new().with_installed(["com.example.mail", "com.example.maps"]);
//! device.launch("com.example.maps").expect("sim launch must succeed");
//! assert_eq!(device.foreground_package().as_deref(), Some("com.example.maps"));
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use custodian_types::{
    BatteryInfo, CapabilityKind, CustodianError, LocationSample, NetworkInfo, PermissionRequest,
    StorageInfo,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::apps::{AppLauncher, PackageManager};
use crate::location::LocationSource;
use crate::power::{Notifier, PowerControl};
use crate::probe::DeviceProbe;
use crate::prompt::{CapabilityPrompt, PromptOutcome};

/// A notification shown on the simulated screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimNotification {
    pub id: String,
    pub title: String,
    pub body: String,
}

/// How the simulated user answers capability prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptMode {
    /// Every prompt resolves immediately with the given answer.
    Auto(PromptOutcome),
    /// Prompts block until [`SimDevice::resolve_prompt`] is called.
    Manual,
}

struct SimState {
    installed: BTreeSet<String>,
    foreground: Option<String>,
    launches: Vec<String>,
    lock_task: Option<String>,
    launcher_visible: BTreeSet<String>,
    grants: BTreeMap<CapabilityKind, bool>,
    prompts: Vec<CapabilityKind>,
    prompts_in_flight: u32,
    max_prompts_in_flight: u32,
    fixes: VecDeque<LocationSample>,
    stationary: Option<(f64, f64)>,
    battery: BatteryInfo,
    storage: StorageInfo,
    network: NetworkInfo,
    notifications: Vec<SimNotification>,
    reboots: u32,
}

/// A fully simulated managed device.
pub struct SimDevice {
    state: Mutex<SimState>,
    prompt_mode: PromptMode,
    resolutions_tx: mpsc::UnboundedSender<PromptOutcome>,
    resolutions_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PromptOutcome>>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    /// A device with nothing installed, no capabilities granted, a healthy
    /// battery and Wi-Fi, whose user grants every prompt.
    pub fn new() -> Self {
        let (resolutions_tx, resolutions_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(SimState {
                installed: BTreeSet::new(),
                foreground: None,
                launches: Vec::new(),
                lock_task: None,
                launcher_visible: BTreeSet::new(),
                grants: CapabilityKind::ALL.iter().map(|k| (*k, false)).collect(),
                prompts: Vec::new(),
                prompts_in_flight: 0,
                max_prompts_in_flight: 0,
                fixes: VecDeque::new(),
                stationary: None,
                battery: BatteryInfo {
                    level_percent: 87,
                    charging: false,
                },
                storage: StorageInfo {
                    total_bytes: 64 * 1024 * 1024 * 1024,
                    free_bytes: 21 * 1024 * 1024 * 1024,
                },
                network: NetworkInfo {
                    connected: true,
                    transport: "wifi".to_string(),
                    ip_address: Some("192.168.1.23".to_string()),
                },
                notifications: Vec::new(),
                reboots: 0,
            }),
            prompt_mode: PromptMode::Auto(PromptOutcome::Granted),
            resolutions_tx,
            resolutions_rx: tokio::sync::Mutex::new(resolutions_rx),
        }
    }

    // ── builder ──────────────────────────────────────────────────────────────

    pub fn with_installed<I, S>(self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock()
            .installed
            .extend(packages.into_iter().map(Into::into));
        self
    }

    pub fn with_granted(self, kinds: &[CapabilityKind]) -> Self {
        {
            let mut state = self.lock();
            for kind in kinds {
                state.grants.insert(*kind, true);
            }
        }
        self
    }

    /// Answer every prompt immediately with `outcome`.
    pub fn with_auto_answer(mut self, outcome: PromptOutcome) -> Self {
        self.prompt_mode = PromptMode::Auto(outcome);
        self
    }

    /// Block every prompt until [`resolve_prompt`][Self::resolve_prompt].
    pub fn with_manual_prompts(mut self) -> Self {
        self.prompt_mode = PromptMode::Manual;
        self
    }

    /// Report `(lat, lon)` whenever no scripted fix is queued.
    pub fn with_stationary_location(self, lat: f64, lon: f64) -> Self {
        self.lock().stationary = Some((lat, lon));
        self
    }

    // ── scripting ────────────────────────────────────────────────────────────

    /// Resolve the oldest pending manual prompt.
    pub fn resolve_prompt(&self, outcome: PromptOutcome) {
        let _ = self.resolutions_tx.send(outcome);
    }

    pub fn push_fix(&self, sample: LocationSample) {
        self.lock().fixes.push_back(sample);
    }

    pub fn set_granted(&self, kind: CapabilityKind, granted: bool) {
        self.lock().grants.insert(kind, granted);
    }

    pub fn set_foreground(&self, package: Option<&str>) {
        self.lock().foreground = package.map(str::to_string);
    }

    pub fn install(&self, package: &str) {
        self.lock().installed.insert(package.to_string());
    }

    pub fn uninstall(&self, package: &str) {
        self.lock().installed.remove(package);
    }

    pub fn set_battery(&self, level_percent: u8, charging: bool) {
        self.lock().battery = BatteryInfo {
            level_percent,
            charging,
        };
    }

    // ── inspection ───────────────────────────────────────────────────────────

    pub fn launches(&self) -> Vec<String> {
        self.lock().launches.clone()
    }

    pub fn lock_task(&self) -> Option<String> {
        self.lock().lock_task.clone()
    }

    pub fn launcher_visible(&self) -> BTreeSet<String> {
        self.lock().launcher_visible.clone()
    }

    pub fn prompts(&self) -> Vec<CapabilityKind> {
        self.lock().prompts.clone()
    }

    /// Highest number of prompts ever outstanding at the same time.
    pub fn max_prompts_in_flight(&self) -> u32 {
        self.lock().max_prompts_in_flight
    }

    pub fn notifications(&self) -> Vec<SimNotification> {
        self.lock().notifications.clone()
    }

    pub fn reboot_count(&self) -> u32 {
        self.lock().reboots
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PackageManager for SimDevice {
    fn installed_packages(&self) -> Result<BTreeSet<String>, CustodianError> {
        Ok(self.lock().installed.clone())
    }
}

impl AppLauncher for SimDevice {
    fn launch(&self, package: &str) -> Result<(), CustodianError> {
        let mut state = self.lock();
        if !state.installed.contains(package) {
            return Err(CustodianError::Platform(format!(
                "package '{package}' is not installed"
            )));
        }
        state.launches.push(package.to_string());
        state.foreground = Some(package.to_string());
        Ok(())
    }

    fn foreground_package(&self) -> Option<String> {
        self.lock().foreground.clone()
    }

    fn engage_lock_task(&self, package: &str) -> Result<(), CustodianError> {
        self.lock().lock_task = Some(package.to_string());
        Ok(())
    }

    fn release_lock_task(&self) -> Result<(), CustodianError> {
        self.lock().lock_task = None;
        Ok(())
    }

    fn refresh_launcher(&self, visible: &BTreeSet<String>) {
        self.lock().launcher_visible = visible.clone();
    }
}

#[async_trait]
impl CapabilityPrompt for SimDevice {
    fn is_granted(&self, kind: CapabilityKind) -> bool {
        self.lock().grants.get(&kind).copied().unwrap_or(false)
    }

    async fn request(&self, request: &PermissionRequest) -> PromptOutcome {
        {
            let mut state = self.lock();
            state.prompts.push(request.capability);
            state.prompts_in_flight += 1;
            state.max_prompts_in_flight = state.max_prompts_in_flight.max(state.prompts_in_flight);
        }
        debug!(capability = %request.capability, "sim prompt shown");

        let outcome = match self.prompt_mode {
            PromptMode::Auto(outcome) => outcome,
            PromptMode::Manual => self
                .resolutions_rx
                .lock()
                .await
                .recv()
                .await
                .unwrap_or(PromptOutcome::Denied),
        };

        let mut state = self.lock();
        state.prompts_in_flight -= 1;
        if outcome == PromptOutcome::Granted {
            state.grants.insert(request.capability, true);
        }
        outcome
    }
}

impl DeviceProbe for SimDevice {
    fn battery(&self) -> Result<BatteryInfo, CustodianError> {
        Ok(self.lock().battery.clone())
    }

    fn storage(&self) -> Result<StorageInfo, CustodianError> {
        Ok(self.lock().storage.clone())
    }

    fn network(&self) -> Result<NetworkInfo, CustodianError> {
        Ok(self.lock().network.clone())
    }
}

#[async_trait]
impl LocationSource for SimDevice {
    async fn current_fix(&self) -> Result<LocationSample, CustodianError> {
        let mut state = self.lock();
        if !state
            .grants
            .get(&CapabilityKind::Location)
            .copied()
            .unwrap_or(false)
        {
            return Err(CustodianError::LocationUnavailable(
                "location capability not granted".to_string(),
            ));
        }
        if let Some(fix) = state.fixes.pop_front() {
            return Ok(fix);
        }
        match state.stationary {
            Some((lat, lon)) => Ok(LocationSample {
                lat,
                lon,
                accuracy_m: 15.0,
                provider: "sim".to_string(),
                timestamp: Utc::now(),
            }),
            None => Err(CustodianError::LocationUnavailable(
                "no fix available".to_string(),
            )),
        }
    }
}

impl Notifier for SimDevice {
    fn show(&self, notification_id: &str, title: &str, body: &str) -> Result<(), CustodianError> {
        self.lock().notifications.push(SimNotification {
            id: notification_id.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

impl PowerControl for SimDevice {
    fn reboot(&self) -> Result<(), CustodianError> {
        self.lock().reboots += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_requires_installed_package() {
        let device = SimDevice::new().with_installed(["com.example.mail"]);
        assert!(device.launch("com.example.mail").is_ok());
        assert!(device.launch("com.example.ghost").is_err());
        assert_eq!(device.launches(), vec!["com.example.mail".to_string()]);
    }

    #[test]
    fn lock_task_engage_and_release() {
        let device = SimDevice::new();
        device.engage_lock_task("com.example.pos").unwrap();
        assert_eq!(device.lock_task().as_deref(), Some("com.example.pos"));
        device.release_lock_task().unwrap();
        assert!(device.lock_task().is_none());
    }

    #[tokio::test]
    async fn auto_prompt_grants_capability() {
        let device = SimDevice::new();
        assert!(!device.is_granted(CapabilityKind::Location));
        let outcome = device
            .request(&PermissionRequest::for_capability(CapabilityKind::Location))
            .await;
        assert_eq!(outcome, PromptOutcome::Granted);
        assert!(device.is_granted(CapabilityKind::Location));
        assert_eq!(device.prompts(), vec![CapabilityKind::Location]);
    }

    #[tokio::test]
    async fn denied_prompt_leaves_capability_missing() {
        let device = SimDevice::new().with_auto_answer(PromptOutcome::Denied);
        let outcome = device
            .request(&PermissionRequest::for_capability(CapabilityKind::HomeRole))
            .await;
        assert_eq!(outcome, PromptOutcome::Denied);
        assert!(!device.is_granted(CapabilityKind::HomeRole));
    }

    #[tokio::test]
    async fn manual_prompt_waits_for_resolution() {
        let device = std::sync::Arc::new(SimDevice::new().with_manual_prompts());
        let d = device.clone();
        let handle = tokio::spawn(async move {
            d.request(&PermissionRequest::for_capability(CapabilityKind::Notifications))
                .await
        });
        tokio::task::yield_now().await;
        device.resolve_prompt(PromptOutcome::Granted);
        assert_eq!(handle.await.unwrap(), PromptOutcome::Granted);
        assert!(device.is_granted(CapabilityKind::Notifications));
    }

    #[tokio::test]
    async fn location_requires_capability() {
        let device = SimDevice::new().with_stationary_location(40.4, -3.7);
        assert!(matches!(
            device.current_fix().await,
            Err(CustodianError::LocationUnavailable(_))
        ));
        device.set_granted(CapabilityKind::Location, true);
        let fix = device.current_fix().await.unwrap();
        assert!((fix.lat - 40.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn scripted_fixes_come_first() {
        let device = SimDevice::new()
            .with_granted(&[CapabilityKind::Location])
            .with_stationary_location(0.0, 0.0);
        device.push_fix(LocationSample {
            lat: 1.0,
            lon: 1.0,
            accuracy_m: 5.0,
            provider: "gps".into(),
            timestamp: Utc::now(),
        });
        assert_eq!(device.current_fix().await.unwrap().provider, "gps");
        assert_eq!(device.current_fix().await.unwrap().provider, "sim");
    }

    #[test]
    fn notifications_and_reboots_are_recorded() {
        let device = SimDevice::new();
        device.show("n-1", "Hello", "World").unwrap();
        device.reboot().unwrap();
        assert_eq!(device.notifications().len(), 1);
        assert_eq!(device.reboot_count(), 1);
    }
}
