//! Streaming-type classification.
//!
//! A coarse pre-filter mapping a signal onto one of the named delivery
//! channels before topic matching; it never replaces topic matching.

use crate::signal::Signal;

/// Type-string prefix of event signals.
pub const EVENT_PREFIX: &str = "events:";
/// Type-string prefix of message signals.
pub const MESSAGE_PREFIX: &str = "messages:";
/// Type-string prefix of command signals.
pub const COMMAND_PREFIX: &str = "commands:";
/// Type-string prefix of policy announcements.
pub const POLICY_ANNOUNCEMENT_PREFIX: &str = "policy-announcements:";

/// The named delivery channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamingType {
    /// Persisted (twin) events.
    Events,
    /// Live messages.
    Messages,
    /// Live commands.
    LiveCommands,
    /// Live events.
    LiveEvents,
    /// Policy announcements, independent of channel.
    PolicyAnnouncements,
}

/// Classify a signal into its delivery channel, or `None` when it belongs
/// to no streaming channel.
pub fn classify(signal: &Signal) -> Option<StreamingType> {
    let signal_type = signal.signal_type();
    if signal_type.starts_with(POLICY_ANNOUNCEMENT_PREFIX) {
        return Some(StreamingType::PolicyAnnouncements);
    }
    if signal.is_live() {
        if signal_type.starts_with(EVENT_PREFIX) {
            Some(StreamingType::LiveEvents)
        } else if signal_type.starts_with(MESSAGE_PREFIX) {
            Some(StreamingType::Messages)
        } else if signal_type.starts_with(COMMAND_PREFIX) {
            Some(StreamingType::LiveCommands)
        } else {
            None
        }
    } else if signal_type.starts_with(EVENT_PREFIX) {
        Some(StreamingType::Events)
    } else {
        None
    }
}
