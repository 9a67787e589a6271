//! Live subscription state machine.
//!
//! A [`Subscription`] tracks one server-side subscription: its client-chosen
//! id, channel, weight, playback speed and lifecycle state. It never owns the
//! [`Connection`]; every RPC borrows one for the duration of the call.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::message::Message;
use crate::{HtspError, Result};

/// Normal playback speed in HTSP units (percent).
pub const SPEED_NORMAL: i32 = 100;

/// Server capability required before a timeshift buffer is requested.
const TIMESHIFT_CAPABILITY: &str = "timeshift";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub enum SubscriptionState {
    Stopped,
    Starting,
    Running,
    NoSignal,
    Scrambled,
    NoFreeTuner,
    TuningFailed,
    UserLimit,
    NoAccess,
    Unknown,
    /// Low-weight subscription opened ahead of a likely channel switch.
    PreTuning,
    /// Low-weight subscription kept alive after switching away.
    PostTuning,
}

impl SubscriptionState {
    pub fn is_speculative(self) -> bool {
        matches!(self, SubscriptionState::PreTuning | SubscriptionState::PostTuning)
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            SubscriptionState::NoSignal
                | SubscriptionState::Scrambled
                | SubscriptionState::NoFreeTuner
                | SubscriptionState::TuningFailed
                | SubscriptionState::UserLimit
                | SubscriptionState::NoAccess
                | SubscriptionState::Unknown
        )
    }

    /// Map a structured `subscriptionError` code.
    pub fn from_error_code(code: &str) -> Self {
        match code {
            "badSignal" => SubscriptionState::NoSignal,
            "scrambled" => SubscriptionState::Scrambled,
            "userLimit" => SubscriptionState::UserLimit,
            "noFreeAdapter" => SubscriptionState::NoFreeTuner,
            "tuningFailed" => SubscriptionState::TuningFailed,
            "userAccess" => SubscriptionState::NoAccess,
            _ => SubscriptionState::Unknown,
        }
    }

    fn notice(self) -> Option<&'static str> {
        match self {
            SubscriptionState::NoSignal => Some("No signal on the requested channel"),
            SubscriptionState::Scrambled => Some("Channel is scrambled"),
            SubscriptionState::NoFreeTuner => Some("No free tuner available"),
            SubscriptionState::TuningFailed => Some("Tuning failed"),
            SubscriptionState::UserLimit => Some("User connection limit reached"),
            SubscriptionState::NoAccess => Some("No access to the requested channel"),
            SubscriptionState::Unknown => Some("Subscription failed"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct SubscriptionInner {
    id: u32,
    channel_id: u32,
    weight: u32,
    speed: i32,
    state: SubscriptionState,
    /// A `subscribe` went out that no `unsubscribe` has answered yet.
    on_server: bool,
}

pub struct Subscription {
    inner: Mutex<SubscriptionInner>,
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscription {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SubscriptionInner {
                id: 0,
                channel_id: 0,
                weight: 0,
                speed: SPEED_NORMAL,
                state: SubscriptionState::Stopped,
                on_server: false,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.lock().id
    }

    pub fn channel_id(&self) -> u32 {
        self.inner.lock().channel_id
    }

    pub fn weight(&self) -> u32 {
        self.inner.lock().weight
    }

    pub fn speed(&self) -> i32 {
        self.inner.lock().speed
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() != SubscriptionState::Stopped
    }

    /// Forget the subscription locally without telling the server.
    pub(crate) fn abandon(&self) {
        let mut inner = self.inner.lock();
        inner.state = SubscriptionState::Stopped;
        inner.on_server = false;
    }

    pub(crate) fn set_state(&self, state: SubscriptionState) {
        let mut inner = self.inner.lock();
        if inner.state != state {
            debug!(subscription_id = inner.id, from = ?inner.state, to = ?state, "Subscription state");
            inner.state = state;
        }
    }

    /// Subscribe to `channel_id` under the fresh id `id`. Ends in `Starting`.
    ///
    /// On failure the state stays `Stopped`; the caller should still
    /// unsubscribe in case the server created the subscription anyway.
    pub async fn subscribe(
        &self,
        conn: &Connection,
        id: u32,
        channel_id: u32,
        weight: u32,
    ) -> Result<()> {
        self.start(conn, id, channel_id, weight, SubscriptionState::Starting).await
    }

    /// Subscribe at the pre-tuning weight. Ends in `PreTuning`.
    pub async fn subscribe_speculative(
        &self,
        conn: &Connection,
        id: u32,
        channel_id: u32,
    ) -> Result<()> {
        let weight = conn.config().pretuning_weight;
        self.start(conn, id, channel_id, weight, SubscriptionState::PreTuning).await
    }

    async fn start(
        &self,
        conn: &Connection,
        id: u32,
        channel_id: u32,
        weight: u32,
        target: SubscriptionState,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.id = id;
            inner.channel_id = channel_id;
            inner.weight = weight;
            inner.speed = SPEED_NORMAL;
            inner.state = SubscriptionState::Stopped;
            inner.on_server = true;
        }

        let msg = self.subscribe_message(conn);
        info!(subscription_id = id, channel_id, weight, "Subscribing");
        conn.send_and_wait("subscribe", msg, conn.response_timeout()).await?;
        if !self.settle(id, Some(target)) {
            return Err(HtspError::invalid_state(format!(
                "subscription {} was closed while subscribing",
                id
            )));
        }
        Ok(())
    }

    /// Move to `target` after a `subscribe` reply for `id`, unless the
    /// subscription was torn down or replaced while the request was in flight.
    fn settle(&self, id: u32, target: Option<SubscriptionState>) -> bool {
        let mut inner = self.inner.lock();
        if !inner.on_server || inner.id != id {
            debug!(subscription_id = id, "Subscription closed before its subscribe reply");
            return false;
        }
        if let Some(state) = target.filter(|s| *s != inner.state) {
            debug!(subscription_id = id, from = ?inner.state, to = ?state, "Subscription state");
            inner.state = state;
        }
        true
    }

    /// Resubscribe under the existing id and weight after a reconnect.
    ///
    /// Runs inside the rebuild callback, so it uses the forced RPC path.
    pub async fn restart(&self, conn: &Connection) -> Result<()> {
        let (id, speed, state) = {
            let inner = self.inner.lock();
            (inner.id, inner.speed, inner.state)
        };
        if state == SubscriptionState::Stopped {
            return Ok(());
        }

        info!(subscription_id = id, "Restarting subscription");
        let msg = self.subscribe_message(conn);
        conn.send_and_wait_forced("subscribe", msg, conn.response_timeout()).await?;

        let speed_msg = Message::new().with("subscriptionId", id).with("speed", speed);
        conn.send_and_wait_forced("subscriptionSpeed", speed_msg, conn.response_timeout()).await?;

        let target = (!state.is_speculative()).then_some(SubscriptionState::Starting);
        self.settle(id, target);
        Ok(())
    }

    /// Mark the subscription stopped, then tell the server best-effort.
    ///
    /// Also covers a `subscribe` that failed locally but may exist on the server.
    pub async fn unsubscribe(&self, conn: &Connection) {
        let id = {
            let mut inner = self.inner.lock();
            inner.state = SubscriptionState::Stopped;
            if !std::mem::take(&mut inner.on_server) {
                return;
            }
            inner.id
        };

        info!(subscription_id = id, "Unsubscribing");
        if !conn.is_ready() {
            debug!(subscription_id = id, "Not connected, skipping unsubscribe RPC");
            return;
        }
        let msg = Message::new().with("subscriptionId", id);
        if let Err(e) = conn.send_and_wait("unsubscribe", msg, conn.response_timeout()).await {
            warn!(subscription_id = id, error = %e, "Unsubscribe failed");
        }
    }

    /// Ask the server to skip to absolute `time_us` (microseconds).
    pub async fn seek(&self, conn: &Connection, time_us: i64) -> Result<()> {
        let id = self.require_active("seek")?;
        let msg = Message::new()
            .with("subscriptionId", id)
            .with("time", time_us)
            .with("absolute", 1u32);
        debug!(subscription_id = id, time_us, "Seeking");
        conn.send_and_wait("subscriptionSkip", msg, conn.response_timeout()).await.map(|_| ())
    }

    /// Change playback speed; `speed` is in percent of normal.
    pub async fn set_speed(&self, conn: &Connection, speed: i32) -> Result<()> {
        let id = {
            let mut inner = self.inner.lock();
            inner.speed = speed;
            inner.id
        };
        if !self.is_active() {
            return Ok(());
        }
        let msg = Message::new().with("subscriptionId", id).with("speed", speed);
        debug!(subscription_id = id, speed, "Changing speed");
        conn.send_and_wait("subscriptionSpeed", msg, conn.response_timeout()).await.map(|_| ())
    }

    pub async fn set_weight(&self, conn: &Connection, weight: u32) -> Result<()> {
        let (id, previous) = {
            let mut inner = self.inner.lock();
            let previous = std::mem::replace(&mut inner.weight, weight);
            (inner.id, previous)
        };
        if !self.is_active() || previous == weight {
            return Ok(());
        }
        let msg = Message::new().with("subscriptionId", id).with("weight", weight);
        debug!(subscription_id = id, weight, "Changing weight");
        conn.send_and_wait("subscriptionChangeWeight", msg, conn.response_timeout())
            .await
            .map(|_| ())
    }

    /// Apply a `subscriptionStatus` push.
    pub fn handle_status(&self, conn: &Connection, msg: &Message) {
        let current = self.state();
        if current == SubscriptionState::Stopped {
            return;
        }

        let structured = conn.server_info().is_some_and(|s| s.has_structured_errors());
        let (next, legacy_status) = if structured {
            match msg.get_str("subscriptionError") {
                Some(code) => (SubscriptionState::from_error_code(code), None),
                None => (SubscriptionState::Running, None),
            }
        } else {
            match msg.get_str("status") {
                Some(status) if !status.is_empty() => (SubscriptionState::Unknown, Some(status)),
                _ => (SubscriptionState::Running, None),
            }
        };

        if next == SubscriptionState::Running && current.is_speculative() {
            return;
        }
        self.set_state(next);

        if next.is_failure() && !current.is_speculative() {
            let id = self.id();
            warn!(subscription_id = id, state = ?next, status = ?legacy_status, "Subscription failed");
            match legacy_status {
                Some(text) => conn.notify_user(text),
                None => {
                    if let Some(notice) = next.notice() {
                        conn.notify_user(notice);
                    }
                }
            }
        }
    }

    fn require_active(&self, context: &str) -> Result<u32> {
        let inner = self.inner.lock();
        if inner.state == SubscriptionState::Stopped {
            return Err(HtspError::invalid_state(format!("{} without an active subscription", context)));
        }
        Ok(inner.id)
    }

    fn subscribe_message(&self, conn: &Connection) -> Message {
        let inner = self.inner.lock().clone();
        let config = conn.config();
        let timeshift_period =
            if config.timeshift && conn.has_capability(TIMESHIFT_CAPABILITY) { u32::MAX } else { 0 };

        let mut msg = Message::new()
            .with("channelId", inner.channel_id)
            .with("subscriptionId", inner.id)
            .with("weight", inner.weight)
            .with("timeshiftPeriod", timeshift_period)
            .with("queueDepth", config.server_queue_depth)
            .with("normts", 1u32);
        if !config.streaming_profile.is_empty() {
            msg.set("profile", config.streaming_profile.as_str());
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_error_codes_map_to_states() {
        assert_eq!(SubscriptionState::from_error_code("badSignal"), SubscriptionState::NoSignal);
        assert_eq!(SubscriptionState::from_error_code("scrambled"), SubscriptionState::Scrambled);
        assert_eq!(SubscriptionState::from_error_code("userLimit"), SubscriptionState::UserLimit);
        assert_eq!(
            SubscriptionState::from_error_code("noFreeAdapter"),
            SubscriptionState::NoFreeTuner
        );
        assert_eq!(
            SubscriptionState::from_error_code("tuningFailed"),
            SubscriptionState::TuningFailed
        );
        assert_eq!(SubscriptionState::from_error_code("userAccess"), SubscriptionState::NoAccess);
        assert_eq!(SubscriptionState::from_error_code("somethingNew"), SubscriptionState::Unknown);
    }

    #[test]
    fn failure_and_speculative_classification() {
        assert!(SubscriptionState::Scrambled.is_failure());
        assert!(!SubscriptionState::Running.is_failure());
        assert!(!SubscriptionState::PreTuning.is_failure());
        assert!(SubscriptionState::PostTuning.is_speculative());
        assert!(!SubscriptionState::Starting.is_speculative());
    }

    #[test]
    fn new_subscription_is_stopped_at_normal_speed() {
        let sub = Subscription::new();
        assert_eq!(sub.state(), SubscriptionState::Stopped);
        assert_eq!(sub.speed(), SPEED_NORMAL);
        assert!(!sub.is_active());
        assert!(sub.require_active("seek").is_err());
    }
}
