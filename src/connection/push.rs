//! Lookup table for subscription-scoped push methods.

use std::collections::HashMap;
use std::sync::LazyLock;

/// Push methods that belong to one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionPush {
    Start,
    Stop,
    Status,
    Skip,
    Speed,
    Grace,
    QueueStatus,
    SignalStatus,
    TimeshiftStatus,
    DescrambleInfo,
    MuxPkt,
}

const METHODS: [(&str, SubscriptionPush); 11] = [
    ("subscriptionStart", SubscriptionPush::Start),
    ("subscriptionStop", SubscriptionPush::Stop),
    ("subscriptionStatus", SubscriptionPush::Status),
    ("subscriptionSkip", SubscriptionPush::Skip),
    ("subscriptionSpeed", SubscriptionPush::Speed),
    ("subscriptionGrace", SubscriptionPush::Grace),
    ("queueStatus", SubscriptionPush::QueueStatus),
    ("signalStatus", SubscriptionPush::SignalStatus),
    ("timeshiftStatus", SubscriptionPush::TimeshiftStatus),
    ("descrambleInfo", SubscriptionPush::DescrambleInfo),
    ("muxpkt", SubscriptionPush::MuxPkt),
];

static TABLE: LazyLock<HashMap<&'static str, SubscriptionPush>> =
    LazyLock::new(|| METHODS.into_iter().collect());

impl SubscriptionPush {
    pub fn lookup(method: &str) -> Option<Self> {
        TABLE.get(method).copied()
    }

    pub fn method_name(self) -> &'static str {
        METHODS.iter().find(|(_, kind)| *kind == self).map(|(name, _)| *name).unwrap_or("unknown")
    }
}
