use serde::Deserialize;

/// Prefix of the per-worker liveness channels published by the store.
const WORKER_CHANNEL_PREFIX: &str = "ql:w:";

/// Name of the liveness channel for one worker.
pub fn worker_channel(worker: &str) -> String {
    format!("{}{}", WORKER_CHANNEL_PREFIX, worker)
}

/// Worker name embedded in a liveness channel name, if it is one.
pub fn worker_from_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix(WORKER_CHANNEL_PREFIX)
}

/// One message from a worker's liveness channel.
///
/// The store publishes these as the authoritative view of a worker's lock:
/// a heartbeat extends it, lock_lost and canceled revoke it. Kinds this
/// client does not recognize parse as `Unknown` and are ignored upstream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LivenessEvent {
    Heartbeat {
        worker: String,
        jid: String,
        /// New lock expiry, epoch seconds.
        expires: f64,
    },
    LockLost {
        worker: String,
        jid: String,
    },
    Canceled {
        worker: String,
        jid: String,
    },
    #[serde(other)]
    Unknown,
}

impl LivenessEvent {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_heartbeat() {
        let raw = r#"{"event":"heartbeat","worker":"host-1234","jid":"abc","expires":1700000060.5}"#;
        match LivenessEvent::parse(raw).unwrap() {
            LivenessEvent::Heartbeat {
                worker,
                jid,
                expires,
            } => {
                assert_eq!(worker, "host-1234");
                assert_eq!(jid, "abc");
                assert!((expires - 1700000060.5).abs() < f64::EPSILON);
            }
            other => panic!("expected heartbeat, got {:?}", other),
        }
    }

    #[test]
    fn parses_lock_lost_and_canceled() {
        let lost = LivenessEvent::parse(
            r#"{"event":"lock_lost","worker":"host-1","jid":"j1"}"#,
        )
        .unwrap();
        assert!(matches!(lost, LivenessEvent::LockLost { .. }));

        let canceled = LivenessEvent::parse(
            r#"{"event":"canceled","worker":"host-1","jid":"j1"}"#,
        )
        .unwrap();
        assert!(matches!(canceled, LivenessEvent::Canceled { .. }));
    }

    #[test]
    fn unrecognized_event_kind_is_unknown() {
        let ev = LivenessEvent::parse(r#"{"event":"paused","worker":"host-1"}"#).unwrap();
        assert!(matches!(ev, LivenessEvent::Unknown));
    }

    #[test]
    fn channel_naming() {
        assert_eq!(worker_channel("host-9"), "ql:w:host-9");
        assert_eq!(worker_from_channel("ql:w:host-9"), Some("host-9"));
        assert_eq!(worker_from_channel("ql:other"), None);
    }
}
