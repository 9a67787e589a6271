//! TypeScript Generation Tests
//!
//! Validates that the observable client types can be exported to TypeScript
//! when the tauri feature is enabled.

#[cfg(feature = "tauri")]
#[test]
fn test_state_types_implement_specta_type() {
    use specta::Type;

    // If this compiles, every state type a UI observes carries specta::Type.
    fn assert_type<T: Type>() {}

    // Connection
    assert_type::<htsp_client::LinkState>();
    assert_type::<htsp_client::ConnectionStatus>();
    assert_type::<htsp_client::AsyncPhase>();

    // Subscriptions and demuxing
    assert_type::<htsp_client::SubscriptionState>();
    assert_type::<htsp_client::demux::StreamKind>();
    assert_type::<htsp_client::demux::SignalStatus>();
    assert_type::<htsp_client::demux::TimeshiftStatus>();
    assert_type::<htsp_client::demux::DescrambleInfo>();
    assert_type::<htsp_client::demux::QueueStatus>();
    assert_type::<htsp_client::demux::SourceInfo>();
}

#[cfg(not(feature = "tauri"))]
#[test]
fn test_tauri_feature_disabled() {
    // Without the feature the state types still serialize for other front ends.
    let _ = htsp_client::ConnectionStatus::Unknown;
    let _ = htsp_client::SubscriptionState::Stopped;
}
