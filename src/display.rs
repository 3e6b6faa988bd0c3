//! Text helpers shared by the command layer and error messages.

use std::time::Duration;

use crate::coordinator::PlayerSnapshot;

const PROGRESS_SLOTS: usize = 18;
const QUEUE_PREVIEW: usize = 10;

/// `mm:ss`, or `h:mm:ss` once an hour is reached.
pub fn clock(duration: &Duration) -> String {
    let total = duration.as_secs();
    let (hours, rest) = (total / 3600, total % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

pub fn format_time(duration: Option<Duration>) -> String {
    match duration {
        Some(duration) => clock(&duration),
        None => "??:??".to_string(),
    }
}

/// Accepts `90`, `1:30` or `1:02:03`.
pub fn parse_timestamp(value: &str) -> Option<Duration> {
    let value = value.trim();

    if value.is_empty() {
        return None;
    }

    let mut seconds: u64 = 0;

    for part in value.split(':') {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }

        let part: u64 = part.parse().ok()?;
        seconds = seconds.checked_mul(60)?.checked_add(part)?;
    }

    Some(Duration::from_secs(seconds))
}

pub fn progress_bar(elapsed: Duration, duration: Option<Duration>) -> String {
    let duration = match duration {
        Some(duration) if !duration.is_zero() => duration,
        _ => return format!("🔘{}", "▬".repeat(PROGRESS_SLOTS - 1)),
    };

    let ratio = elapsed.as_secs_f64() / duration.as_secs_f64();
    let filled = ((ratio * PROGRESS_SLOTS as f64).floor() as usize).min(PROGRESS_SLOTS - 1);

    (0..PROGRESS_SLOTS)
        .map(|slot| if slot == filled { "🔘" } else { "▬" })
        .collect()
}

pub fn now_playing(snapshot: &PlayerSnapshot) -> String {
    let track = match &snapshot.current {
        Some(track) => track,
        None => return "Nothing playing. Use `play` to add a track.".to_string(),
    };

    let state = if snapshot.paused { " (paused)" } else { "" };

    format!(
        "**Now playing{state}:** [{}]({})\n{}\n`{} / {}` · volume {}%\nRequested by {} · {}",
        track.title,
        track.url,
        progress_bar(snapshot.elapsed, track.duration),
        clock(&snapshot.elapsed),
        format_time(track.duration),
        (snapshot.volume * 100.0).round() as u32,
        track.requester,
        track.source,
    )
}

pub fn queue_listing(snapshot: &PlayerSnapshot) -> String {
    if snapshot.current.is_none() && snapshot.queue.is_empty() {
        return "The queue is empty!".to_string();
    }

    let mut lines = Vec::with_capacity(QUEUE_PREVIEW + 2);

    if let Some(current) = &snapshot.current {
        lines.push(format!("**Now:** {} [{}]", current.title, current.source));
    }

    for (index, track) in snapshot.queue.iter().take(QUEUE_PREVIEW).enumerate() {
        lines.push(format!(
            "{}. {} ({}) · {} [{}]",
            index + 1,
            track.title,
            format_time(track.duration),
            track.requester,
            track.source
        ));
    }

    if snapshot.queue.len() > QUEUE_PREVIEW {
        lines.push(format!("...and {} more.", snapshot.queue.len() - QUEUE_PREVIEW));
    }

    if snapshot.autoplay {
        lines.push("Autoplay is on.".to_string());
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_switches_to_hours() {
        assert_eq!(clock(&Duration::from_secs(0)), "00:00");
        assert_eq!(clock(&Duration::from_secs(95)), "01:35");
        assert_eq!(clock(&Duration::from_secs(3723)), "1:02:03");
        assert_eq!(format_time(None), "??:??");
    }

    #[test]
    fn timestamps_parse_in_every_form() {
        assert_eq!(parse_timestamp("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_timestamp(" 1:30 "), Some(Duration::from_secs(90)));
        assert_eq!(parse_timestamp("1:02:03"), Some(Duration::from_secs(3723)));
    }

    #[test]
    fn malformed_timestamps_are_rejected() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("abc"), None);
        assert_eq!(parse_timestamp("1:"), None);
        assert_eq!(parse_timestamp("-5"), None);
        assert_eq!(parse_timestamp("1.5"), None);
    }

    #[test]
    fn progress_bar_clamps_past_the_end() {
        let bar = progress_bar(Duration::from_secs(500), Some(Duration::from_secs(200)));
        assert!(bar.ends_with("🔘"));
        assert_eq!(bar.chars().count(), PROGRESS_SLOTS);

        let bar = progress_bar(Duration::ZERO, Some(Duration::from_secs(200)));
        assert!(bar.starts_with("🔘"));
    }
}
