//! Status snapshots carried by subscription pushes.
//!
//! Each snapshot is replaced wholesale by its push. A push missing a
//! mandatory field is rejected as a whole.

use serde::Serialize;

use crate::Result;
use crate::message::Message;

/// `signalStatus`: frontend reception quality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct SignalStatus {
    pub fe_status: String,
    pub snr: Option<u32>,
    pub signal: Option<u32>,
    pub ber: Option<u32>,
    pub unc: Option<u32>,
}

impl SignalStatus {
    pub fn from_message(msg: &Message) -> Result<Self> {
        Ok(Self {
            fe_status: msg.require_str("signalStatus", "feStatus")?.to_string(),
            snr: msg.get_u32("feSNR"),
            signal: msg.get_u32("feSignal"),
            ber: msg.get_u32("feBER"),
            unc: msg.get_u32("feUNC"),
        })
    }
}

/// `timeshiftStatus`: position inside the server's timeshift buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct TimeshiftStatus {
    pub full: bool,
    /// Distance behind live, in microseconds.
    pub shift: i64,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl TimeshiftStatus {
    pub fn from_message(msg: &Message) -> Result<Self> {
        Ok(Self {
            full: msg.require_u32("timeshiftStatus", "full")? != 0,
            shift: msg.require_s64("timeshiftStatus", "shift")?,
            start: msg.get_s64("start"),
            end: msg.get_s64("end"),
        })
    }
}

/// `descrambleInfo`: conditional-access details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct DescrambleInfo {
    pub pid: u32,
    pub caid: u32,
    pub provid: u32,
    pub ecm_time: u32,
    pub hops: u32,
    pub card_system: Option<String>,
    pub reader: Option<String>,
    pub from: Option<String>,
    pub protocol: Option<String>,
}

impl DescrambleInfo {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let ctx = "descrambleInfo";
        let text = |name: &str| msg.get_str(name).map(str::to_string);
        Ok(Self {
            pid: msg.require_u32(ctx, "pid")?,
            caid: msg.require_u32(ctx, "caid")?,
            provid: msg.require_u32(ctx, "provid")?,
            ecm_time: msg.require_u32(ctx, "ecmtime")?,
            hops: msg.require_u32(ctx, "hops")?,
            card_system: text("cardsystem"),
            reader: text("reader"),
            from: text("from"),
            protocol: text("protocol"),
        })
    }
}

/// `queueStatus`: server-side send queue of the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct QueueStatus {
    pub packets: u32,
    pub bytes: u32,
    /// Microseconds.
    pub delay: i64,
    pub b_drops: u32,
    pub p_drops: u32,
    pub i_drops: u32,
}

impl QueueStatus {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let ctx = "queueStatus";
        Ok(Self {
            packets: msg.require_u32(ctx, "packets")?,
            bytes: msg.require_u32(ctx, "bytes")?,
            delay: msg.require_s64(ctx, "delay")?,
            b_drops: msg.get_u32("Bdrops").unwrap_or(0),
            p_drops: msg.get_u32("Pdrops").unwrap_or(0),
            i_drops: msg.get_u32("Idrops").unwrap_or(0),
        })
    }
}

/// `sourceinfo` map of `subscriptionStart`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct SourceInfo {
    pub adapter: Option<String>,
    pub mux: Option<String>,
    pub network: Option<String>,
    pub provider: Option<String>,
    pub service: Option<String>,
    pub satpos: Option<String>,
}

impl SourceInfo {
    pub fn from_message(msg: &Message) -> Self {
        let text = |name: &str| msg.get_str(name).map(str::to_string);
        Self {
            adapter: text("adapter"),
            mux: text("mux"),
            network: text("network"),
            provider: text("provider"),
            service: text("service"),
            satpos: text("satpos"),
        }
    }
}
