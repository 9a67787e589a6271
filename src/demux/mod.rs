//! Live stream demuxer.
//!
//! A [`Demuxer`] owns one [`Subscription`] and turns its pushes into a queue
//! of [`DemuxItem`]s:
//!
//! - `subscriptionStart` rebuilds the [`StreamTable`] and queues a
//!   [`DemuxItem::StreamChange`];
//! - `muxpkt` becomes a [`DemuxPacket`], unless a seek or speed change is
//!   still waiting for the server;
//! - `subscriptionSkip` resolves the pending seek and flushes the queue;
//! - status pushes replace the matching snapshot.
//!
//! Pushes are handled on the connection's read loop, so they arrive here in
//! frame order. The connection only holds a weak handle to the demuxer.
//!
//! ```rust,no_run
//! # async fn example(client: &htsp_client::Client) -> htsp_client::Result<()> {
//! use htsp_client::demux::DemuxItem;
//!
//! let demuxer = client.demuxer();
//! demuxer.open(42, 150).await?;
//! while let Some(item) = demuxer.read().await {
//!     match item {
//!         DemuxItem::StreamChange(streams) => println!("{} streams", streams.len()),
//!         DemuxItem::Packet(packet) => println!("{} bytes", packet.payload.len()),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod queue;
pub mod status;
pub mod streams;

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::config::DemuxConfig;
use crate::connection::{Connection, SubscriptionPush, SubscriptionSink};
use crate::message::{Message, Value};
use crate::subscription::{Subscription, SubscriptionState};
use crate::{HtspError, Result};

pub use queue::{DemuxItem, DemuxPacket, PacketQueue};
pub use status::{DescrambleInfo, QueueStatus, SignalStatus, SourceInfo, TimeshiftStatus};
pub use streams::{
    AudioParams, CodecInfo, CodecResolver, DefaultCodecs, MAX_STREAMS, StreamDescriptor,
    StreamKind, StreamTable, VideoParams,
};

/// Ticks per second of packet timestamps.
pub const TIME_BASE: i64 = 1_000_000;

/// Convert server microseconds to `TIME_BASE` ticks.
pub fn to_time_base(micros: i64) -> i64 {
    (i128::from(micros) * i128::from(TIME_BASE) / 1_000_000) as i64
}

type SeekTicket = oneshot::Sender<Result<i64>>;

#[derive(Default)]
struct DemuxState {
    streams: StreamTable,
    layout: Option<Arc<[StreamDescriptor]>>,
    signal: Option<SignalStatus>,
    timeshift: Option<TimeshiftStatus>,
    descramble: Option<DescrambleInfo>,
    queue_status: Option<QueueStatus>,
    source: Option<SourceInfo>,
    seek: Option<SeekTicket>,
    speed_pending: bool,
    server_speed: Option<i32>,
    grace_period: Option<u32>,
}

impl DemuxState {
    fn clear_status(&mut self) {
        self.signal = None;
        self.timeshift = None;
        self.descramble = None;
        self.queue_status = None;
        self.source = None;
        self.grace_period = None;
    }

    fn reset(&mut self) {
        self.clear_status();
        self.streams.clear();
        self.layout = None;
        self.speed_pending = false;
        self.server_speed = None;
        if let Some(ticket) = self.seek.take() {
            let _ = ticket.send(Err(HtspError::Seek { reason: "demuxer reset".into() }));
        }
    }
}

pub struct Demuxer {
    conn: Weak<Connection>,
    weak_self: Weak<Demuxer>,
    config: DemuxConfig,
    poll_interval: Duration,
    default_weight: u32,
    posttuning_weight: u32,
    response_timeout: Duration,
    subscription: Subscription,
    queue: PacketQueue,
    resolver: Arc<dyn CodecResolver>,
    state: Mutex<DemuxState>,
}

impl Demuxer {
    pub fn new(conn: &Arc<Connection>, resolver: Arc<dyn CodecResolver>) -> Arc<Self> {
        let config = conn.config();
        let demux = config.demux.clone();
        let queue = PacketQueue::new(demux.queue_capacity, demux.queue_policy);
        Arc::new_cyclic(|weak_self| Self {
            conn: Arc::downgrade(conn),
            weak_self: weak_self.clone(),
            poll_interval: config.poll_interval(),
            default_weight: config.default_weight,
            posttuning_weight: config.posttuning_weight,
            response_timeout: config.response_timeout(),
            config: demux,
            subscription: Subscription::new(),
            queue,
            resolver,
            state: Mutex::new(DemuxState::default()),
        })
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.conn.upgrade().ok_or_else(|| HtspError::connection_lost("connection dropped"))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Subscribe to `channel_id`, replacing any current subscription.
    ///
    /// A failed subscribe is followed by a best-effort unsubscribe.
    pub async fn open(&self, channel_id: u32, weight: u32) -> Result<()> {
        self.start(channel_id, Some(weight)).await
    }

    /// Subscribe at the pre-tuning weight ahead of a likely channel switch.
    pub async fn open_speculative(&self, channel_id: u32) -> Result<()> {
        self.start(channel_id, None).await
    }

    async fn start(&self, channel_id: u32, weight: Option<u32>) -> Result<()> {
        let conn = self.connection()?;
        self.close().await;

        let id = conn.next_subscription_id();
        let sink: Weak<dyn SubscriptionSink> = self.weak_self.clone();
        conn.register_sink(id, sink);

        let result = match weight {
            Some(weight) => self.subscription.subscribe(&conn, id, channel_id, weight).await,
            None => self.subscription.subscribe_speculative(&conn, id, channel_id).await,
        };
        if let Err(e) = result {
            warn!(subscription_id = id, channel_id, error = %e, "Subscribe failed");
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    /// Turn a speculative subscription into the one being watched.
    pub async fn promote(&self) -> Result<()> {
        let conn = self.connection()?;
        self.subscription.set_weight(&conn, self.default_weight).await?;
        if self.subscription.state().is_speculative() {
            self.subscription.set_state(SubscriptionState::Running);
        }
        Ok(())
    }

    /// Keep the subscription alive at low priority after switching away.
    pub async fn demote(&self) -> Result<()> {
        let conn = self.connection()?;
        self.subscription.set_weight(&conn, self.posttuning_weight).await?;
        if self.subscription.is_active() {
            self.subscription.set_state(SubscriptionState::PostTuning);
        }
        Ok(())
    }

    /// Unsubscribe and drop all local state.
    pub async fn close(&self) {
        let id = self.subscription.id();
        if let Some(conn) = self.conn.upgrade() {
            self.subscription.unsubscribe(&conn).await;
            conn.unregister_sink(id);
        } else {
            self.subscription.abandon();
        }
        self.state.lock().reset();
        self.queue.clear();
    }

    /// Drop local state without telling the server.
    pub fn abort(&self) {
        let id = self.subscription.id();
        debug!(subscription_id = id, "Aborting demuxer");
        self.subscription.abandon();
        if let Some(conn) = self.conn.upgrade() {
            conn.unregister_sink(id);
        }
        self.state.lock().reset();
        self.queue.clear();
    }

    /// Restore the subscription after a reconnect. Called from the rebuild hook.
    pub async fn resume(&self, conn: &Connection) -> Result<()> {
        if !self.subscription.is_active() {
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            state.clear_status();
            state.speed_pending = false;
            if let Some(ticket) = state.seek.take() {
                let _ = ticket.send(Err(HtspError::connection_lost("reconnected during seek")));
            }
        }
        self.queue.flush();
        self.subscription.restart(conn).await
    }

    // ------------------------------------------------------------------
    // Consumer side
    // ------------------------------------------------------------------

    /// Next item, or `None` if nothing arrived within the poll interval.
    pub async fn read(&self) -> Option<DemuxItem> {
        self.queue.pop_timeout(self.poll_interval).await
    }

    pub fn flush(&self) -> usize {
        self.queue.flush()
    }

    /// Drop old packets, keeping enough to resume without rebuffering.
    pub fn trim(&self) -> usize {
        self.queue.trim(self.config.trim_keep)
    }

    /// Seek to absolute `time_ms`; returns the position the server skipped to, in ms.
    pub async fn seek(&self, time_ms: i64) -> Result<i64> {
        let conn = self.connection()?;
        if !self.subscription.is_active() {
            return Err(HtspError::invalid_state("seek without an active subscription"));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if let Some(previous) = state.seek.replace(tx) {
                let _ = previous.send(Err(HtspError::Seek { reason: "superseded".into() }));
            }
        }
        self.queue.flush();

        if let Err(e) = self.subscription.seek(&conn, time_ms.saturating_mul(1000)).await {
            self.state.lock().seek = None;
            return Err(e);
        }

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(result)) => result.map(|micros| micros / 1000),
            Ok(Err(_)) => Err(HtspError::Seek { reason: "seek abandoned".into() }),
            Err(_) => {
                self.state.lock().seek = None;
                Err(HtspError::Timeout {
                    method: "subscriptionSkip".into(),
                    duration: self.response_timeout,
                })
            }
        }
    }

    /// Change playback speed (percent of normal).
    ///
    /// Packets are dropped until the server acknowledges the new speed.
    pub async fn set_speed(&self, speed: i32) -> Result<()> {
        let conn = self.connection()?;
        let active = self.subscription.is_active();
        if active {
            self.state.lock().speed_pending = true;
        }
        let result = self.subscription.set_speed(&conn, speed).await;
        if result.is_err() {
            self.state.lock().speed_pending = false;
        }
        result
    }

    pub async fn set_weight(&self, weight: u32) -> Result<()> {
        let conn = self.connection()?;
        self.subscription.set_weight(&conn, weight).await
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    pub fn queue(&self) -> &PacketQueue {
        &self.queue
    }

    /// Current stream layout, empty before the first `subscriptionStart`.
    pub fn streams(&self) -> Arc<[StreamDescriptor]> {
        self.state.lock().layout.clone().unwrap_or_else(|| Arc::from(Vec::new()))
    }

    pub fn signal_status(&self) -> Option<SignalStatus> {
        self.state.lock().signal.clone()
    }

    pub fn timeshift_status(&self) -> Option<TimeshiftStatus> {
        self.state.lock().timeshift
    }

    pub fn descramble_info(&self) -> Option<DescrambleInfo> {
        self.state.lock().descramble.clone()
    }

    pub fn queue_status(&self) -> Option<QueueStatus> {
        self.state.lock().queue_status
    }

    pub fn source_info(&self) -> Option<SourceInfo> {
        self.state.lock().source.clone()
    }

    /// Speed last reported by the server.
    pub fn server_speed(&self) -> Option<i32> {
        self.state.lock().server_speed
    }

    /// Seconds the server keeps trying before giving up on the subscription.
    pub fn grace_period(&self) -> Option<u32> {
        self.state.lock().grace_period
    }

    pub fn is_speed_pending(&self) -> bool {
        self.state.lock().speed_pending
    }

    /// True while playing behind the live edge.
    pub fn is_timeshifting(&self) -> bool {
        self.state.lock().timeshift.is_some_and(|t| t.shift != 0)
    }

    // ------------------------------------------------------------------
    // Push handlers
    // ------------------------------------------------------------------

    fn handle_start(&self, msg: &Message) {
        let Some(entries) = msg.get_list("streams") else {
            warn!(subscription_id = self.subscription.id(), "subscriptionStart without streams");
            return;
        };

        let layout = {
            let mut state = self.state.lock();
            let layout = state.streams.rebuild(entries, self.resolver.as_ref());
            state.layout = Some(Arc::clone(&layout));
            state.clear_status();
            state.source = msg.get_map("sourceinfo").map(SourceInfo::from_message);
            state.speed_pending = false;
            layout
        };

        info!(subscription_id = self.subscription.id(), streams = layout.len(), "Subscription started");
        self.queue.push(DemuxItem::StreamChange(layout));
    }

    fn handle_stop(&self, msg: &Message) {
        info!(
            subscription_id = self.subscription.id(),
            status = msg.get_str("status").unwrap_or(""),
            "Subscription stopped by server"
        );
        let mut state = self.state.lock();
        state.streams.clear();
        state.layout = None;
    }

    fn handle_skip(&self, msg: &Message) {
        self.queue.flush();
        let Some(ticket) = self.state.lock().seek.take() else {
            debug!(subscription_id = self.subscription.id(), "Skip without a pending seek");
            return;
        };

        let failed = match msg.get("error") {
            Some(Value::S64(v)) => *v != 0,
            Some(Value::Str(s)) => !s.is_empty(),
            Some(_) => true,
            None => false,
        };
        let result = if failed {
            Err(HtspError::Seek { reason: "server rejected seek".into() })
        } else {
            match msg.get_s64("time") {
                Some(time) => Ok(time),
                None => Err(HtspError::Seek { reason: "skip reply without time".into() }),
            }
        };
        debug!(subscription_id = self.subscription.id(), ok = result.is_ok(), "Seek resolved");
        let _ = ticket.send(result);
    }

    fn handle_speed(&self, msg: &Message) {
        let mut state = self.state.lock();
        state.speed_pending = false;
        state.server_speed = msg.get_i32("speed");
        debug!(subscription_id = self.subscription.id(), speed = ?state.server_speed, "Speed acknowledged");
    }

    fn handle_muxpkt(&self, msg: &Message) {
        if !self.subscription.is_active() {
            trace!("Dropping packet for inactive subscription");
            return;
        }
        let (Some(index), Some(payload)) = (msg.get_u32("stream"), msg.get_bin("payload")) else {
            warn!(subscription_id = self.subscription.id(), "Malformed muxpkt");
            return;
        };

        let stream_id = {
            let state = self.state.lock();
            if state.seek.is_some() || state.speed_pending {
                trace!(index, "Dropping packet while seek or speed change is pending");
                return;
            }
            match state.streams.local_id(index) {
                Some(id) => id,
                None => {
                    trace!(index, "Dropping packet for unknown stream");
                    return;
                }
            }
        };

        let packet = DemuxPacket {
            stream_id,
            pts: msg.get_s64("pts").map(to_time_base),
            dts: msg.get_s64("dts").map(to_time_base),
            duration: msg.get_s64("duration").map(to_time_base),
            frame_type: msg.get_u32("frametype").and_then(char::from_u32),
            payload: payload.clone(),
        };
        trace!(stream_id, bytes = packet.payload.len(), "Packet queued");
        self.queue.push(DemuxItem::Packet(packet));
    }

    fn replace_status<T>(
        &self,
        kind: SubscriptionPush,
        parsed: Result<T>,
        apply: impl FnOnce(&mut DemuxState, T),
    ) {
        match parsed {
            Ok(value) => apply(&mut *self.state.lock(), value),
            Err(e) => warn!(push = kind.method_name(), error = %e, "Ignoring malformed status push"),
        }
    }
}

impl SubscriptionSink for Demuxer {
    fn handle_push(&self, kind: SubscriptionPush, msg: &Message) {
        match kind {
            SubscriptionPush::Start => self.handle_start(msg),
            SubscriptionPush::Stop => self.handle_stop(msg),
            SubscriptionPush::Status => {
                if let Some(conn) = self.conn.upgrade() {
                    self.subscription.handle_status(&conn, msg);
                }
            }
            SubscriptionPush::Skip => self.handle_skip(msg),
            SubscriptionPush::Speed => self.handle_speed(msg),
            SubscriptionPush::Grace => {
                self.state.lock().grace_period = msg.get_u32("graceTimeout");
            }
            SubscriptionPush::QueueStatus => {
                self.replace_status(kind, QueueStatus::from_message(msg), |s, v| s.queue_status = Some(v))
            }
            SubscriptionPush::SignalStatus => {
                self.replace_status(kind, SignalStatus::from_message(msg), |s, v| s.signal = Some(v))
            }
            SubscriptionPush::TimeshiftStatus => {
                self.replace_status(kind, TimeshiftStatus::from_message(msg), |s, v| {
                    s.timeshift = Some(v)
                })
            }
            SubscriptionPush::DescrambleInfo => {
                self.replace_status(kind, DescrambleInfo::from_message(msg), |s, v| {
                    s.descramble = Some(v)
                })
            }
            SubscriptionPush::MuxPkt => self.handle_muxpkt(msg),
        }
    }
}

impl Drop for Demuxer {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.unregister_sink(self.subscription.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn microseconds_map_onto_time_base() {
        assert_eq!(to_time_base(0), 0);
        assert_eq!(to_time_base(1_500_000), 1_500_000);
        assert_eq!(to_time_base(-40_000), -40_000);
        assert_eq!(to_time_base(i64::MAX), i64::MAX);
    }
}
