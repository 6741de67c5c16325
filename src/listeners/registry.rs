/// Live observer registry
///
/// Records which flow versions currently have someone watching them so that
/// run events are only produced when they will be consumed. Registrations
/// expire after a TTL and are pruned lazily on access.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub stage: Option<String>,
    pub activated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Registration {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// A registration without a stage only satisfies unscoped checks
    fn satisfies(&self, required_stage: Option<&str>) -> bool {
        match required_stage {
            None => true,
            Some(required) => self.stage.as_deref() == Some(required),
        }
    }
}

#[derive(Debug)]
pub struct ListenerRegistry {
    ttl: ChronoDuration,
    registrations: RwLock<HashMap<String, Registration>>,
}

impl ListenerRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(1)),
            registrations: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or refresh) an observer for `flow_version_id`
    pub fn activate(&self, flow_version_id: &str, stage: Option<&str>) {
        self.activate_at(flow_version_id, stage, Utc::now());
    }

    pub fn deactivate(&self, flow_version_id: &str) -> bool {
        let removed = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(flow_version_id)
            .is_some();

        if removed {
            tracing::debug!("🔕 Listener deactivated for {}", flow_version_id);
        }
        removed
    }

    /// Whether a live observer matches `required_stage`
    ///
    /// With `first_run` set, a matching registration has its expiry pushed out
    /// so that the observer present at run start is still present at run end.
    pub fn has_listener(&self, flow_version_id: &str, required_stage: Option<&str>, first_run: bool) -> bool {
        self.has_listener_at(flow_version_id, required_stage, first_run, Utc::now())
    }

    pub fn registration(&self, flow_version_id: &str) -> Option<Registration> {
        let now = Utc::now();
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(flow_version_id)
            .filter(|registration| registration.is_live(now))
            .cloned()
    }

    /// Versions with a live registration, sorted
    pub fn active_versions(&self) -> Vec<String> {
        let now = Utc::now();
        let mut registrations = self.registrations.write().unwrap_or_else(PoisonError::into_inner);
        registrations.retain(|_, registration| registration.is_live(now));

        let mut versions: Vec<String> = registrations.keys().cloned().collect();
        versions.sort();
        versions
    }

    pub(crate) fn activate_at(&self, flow_version_id: &str, stage: Option<&str>, now: DateTime<Utc>) {
        let registration = Registration {
            stage: stage.map(str::to_string),
            activated_at: now,
            expires_at: self.expiry_from(now),
        };

        self.registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(flow_version_id.to_string(), registration);

        tracing::debug!("🔔 Listener activated for {} (stage: {:?})", flow_version_id, stage);
    }

    pub(crate) fn has_listener_at(
        &self,
        flow_version_id: &str,
        required_stage: Option<&str>,
        first_run: bool,
        now: DateTime<Utc>,
    ) -> bool {
        let mut registrations = self.registrations.write().unwrap_or_else(PoisonError::into_inner);

        let Some(registration) = registrations.get_mut(flow_version_id) else {
            return false;
        };

        if !registration.is_live(now) {
            registrations.remove(flow_version_id);
            return false;
        }

        if !registration.satisfies(required_stage) {
            return false;
        }

        if first_run {
            registration.expires_at = self.expiry_from(now);
        }
        true
    }

    /// Saturates at the latest representable instant
    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
