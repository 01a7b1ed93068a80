//! Output rendering: message batches and the status roster.
//!
//! Both realizations share these formats; what differs between them is
//! only how the underlying rows are fetched.

use crate::backend::{Envelope, PeerSnapshot};
use crate::clock::elapsed_secs;

/// Seconds of apparent work after which a peer is flagged as possibly
/// stuck in the roster.
const STALE_WORK_SECS: i64 = 1800;

/// Renders a batch of messages grouped by sender.
///
/// Senders appear in order of their earliest message; messages within a
/// sender are ascending by enqueue time.
#[must_use]
pub fn render_batch(messages: &[Envelope]) -> String {
    if messages.is_empty() {
        return "No new messages.".to_string();
    }

    let mut sorted: Vec<&Envelope> = messages.iter().collect();
    sorted.sort_by(|a, b| {
        a.from_id
            .cmp(&b.from_id)
            .then(a.ts.partial_cmp(&b.ts).unwrap_or(std::cmp::Ordering::Equal))
    });

    // Senders ordered by the timestamp of their first message.
    let mut senders: Vec<&str> = Vec::new();
    for msg in &sorted {
        if !senders.contains(&msg.from_id.as_str()) {
            senders.push(&msg.from_id);
        }
    }
    senders.sort_by(|a, b| {
        let first = |sender: &str| {
            sorted
                .iter()
                .filter(|m| m.from_id == sender)
                .map(|m| m.ts)
                .fold(f64::INFINITY, f64::min)
        };
        first(a)
            .partial_cmp(&first(b))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut lines = vec![format!(
        "=== {} messages from {} agent(s) ===\n",
        sorted.len(),
        senders.len()
    )];
    for sender in senders {
        let group: Vec<&&Envelope> = sorted.iter().filter(|m| m.from_id == sender).collect();
        lines.push(format!("[{sender}] - {} message(s)", group.len()));
        for msg in group {
            lines.push(format!("  {} {}", msg.ts_str, msg.content));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Renders the online roster: this session first, then ascending id.
#[must_use]
pub fn render_roster(self_id: &str, peers: &[PeerSnapshot], now: f64) -> String {
    let mut ordered: Vec<&PeerSnapshot> = peers.iter().collect();
    ordered.sort_by_key(|p| (p.id != self_id, p.id.clone()));

    let lines: Vec<String> = ordered
        .iter()
        .map(|peer| {
            let mut parts: Vec<String> = Vec::new();
            if peer.id == self_id {
                parts.push("THIS".to_string());
            }
            parts.push(peer_state(peer, now));
            let location = peer
                .cwd
                .as_deref()
                .filter(|s| !s.is_empty())
                .or(peer.hostname.as_deref())
                .unwrap_or("UnknownPath");
            format!("Agent {} @ {}  [{}]", peer.id, location, parts.join(" | "))
        })
        .collect();

    if lines.is_empty() {
        "No active agents.".to_string()
    } else {
        lines.join("\n")
    }
}

/// Coarse activity state for one roster line.
fn peer_state(peer: &PeerSnapshot, now: f64) -> String {
    if peer.mode.as_deref() == Some("waiting") {
        if let Some(started) = peer.recv_started {
            let mut elapsed = elapsed_secs(now, started);
            if let Some(total) = peer.recv_wait_seconds {
                elapsed = elapsed.min(total.max(0));
                return format!("🎧 Waiting ({elapsed}s/{total}s)");
            }
            return format!("🎧 Waiting ({elapsed}s)");
        }
    }
    let since = peer.mode_since.or(peer.active_last_touch);
    match since {
        Some(since) => {
            let elapsed = elapsed_secs(now, since);
            if elapsed >= STALE_WORK_SECS {
                format!("❓ Working ({elapsed}s)")
            } else {
                format!("🛠 Working ({elapsed}s)")
            }
        }
        None => "🛠 Working (0s)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(from: &str, ts: f64, content: &str) -> Envelope {
        Envelope {
            msg_id: format!("{from}-{ts}"),
            ts,
            ts_str: "12:00:00".to_string(),
            from_id: from.to_string(),
            content: content.to_string(),
            attempt: 1,
        }
    }

    fn peer(id: &str) -> PeerSnapshot {
        PeerSnapshot {
            id: id.to_string(),
            cwd: Some(format!("/work/{id}")),
            mode: Some("working".to_string()),
            mode_since: Some(100.0),
            last_seen: 100.0,
            ..PeerSnapshot::default()
        }
    }

    #[test]
    fn batch_groups_by_sender_in_first_ts_order() {
        let msgs = vec![
            envelope("103", 30.0, "late sender first msg"),
            envelope("101", 10.0, "hello"),
            envelope("101", 20.0, "again"),
        ];
        let out = render_batch(&msgs);
        assert!(out.starts_with("=== 3 messages from 2 agent(s) ===\n"));
        let pos_101 = out.find("[101] - 2 message(s)").expect("101 header");
        let pos_103 = out.find("[103] - 1 message(s)").expect("103 header");
        assert!(pos_101 < pos_103, "earliest sender renders first");
        assert!(out.contains("  12:00:00 hello"));
    }

    #[test]
    fn empty_batch_renders_placeholder() {
        assert_eq!(render_batch(&[]), "No new messages.");
    }

    #[test]
    fn roster_puts_self_first_with_flag() {
        let peers = vec![peer("103"), peer("101"), peer("102")];
        let out = render_roster("102", &peers, 130.0);
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].starts_with("Agent 102 @ /work/102"));
        assert!(lines[0].contains("[THIS | 🛠 Working (30s)]"));
        assert!(lines[1].starts_with("Agent 101"));
        assert!(lines[2].starts_with("Agent 103"));
    }

    #[test]
    fn roster_renders_waiting_with_clamped_elapsed() {
        let mut waiting = peer("105");
        waiting.mode = Some("waiting".to_string());
        waiting.recv_started = Some(100.0);
        waiting.recv_wait_seconds = Some(60);
        // Elapsed beyond the budget clamps to the budget.
        let out = render_roster("105", &[waiting], 300.0);
        assert!(out.contains("🎧 Waiting (60s/60s)"), "got: {out}");
    }

    #[test]
    fn roster_flags_stale_work() {
        let mut stale = peer("107");
        stale.mode_since = Some(0.0);
        let out = render_roster("107", &[stale], 2000.0);
        assert!(out.contains("❓ Working (2000s)"));
    }

    #[test]
    fn empty_roster_renders_placeholder() {
        assert_eq!(render_roster("101", &[], 0.0), "No active agents.");
    }
}
