//! Text command glue
//!
//! Parses prefixed chat messages into [`Command`]s and runs them against the
//! [`SessionManager`], producing short plain-text replies.

use std::fmt::Write as _;

use chrono::Utc;

use crate::broadcast::Repeat;
use crate::gateway::{ChannelId, GuildId, UserId};
use crate::playback::{LoopMode, PlaybackState, Track};
use crate::session::{JoinOutcome, SessionManager};
use crate::{Error, Result};

/// A parsed chat command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Join the given channel, or the caller's current one
    Join(Option<ChannelId>),
    Leave,
    Status,
    Latency,
    Play {
        source: String,
        title: String,
    },
    Skip,
    Previous,
    Pause,
    Resume,
    /// Volume in percent
    Volume(u16),
    Loop(LoopMode),
    Broadcast {
        target: UserId,
        repeat: Repeat,
        channel: ChannelId,
        message: String,
    },
    StopBroadcast,
    Help,
}

impl Command {
    /// Parse `text` if it starts with `prefix` and names a known command
    ///
    /// Returns `None` for messages that are not commands, and an
    /// `InvalidRequest` error for known commands with bad arguments.
    #[must_use]
    pub fn parse(prefix: &str, text: &str) -> Option<Result<Self>> {
        let body = text.trim().strip_prefix(prefix)?;
        let (name, rest) = split_word(body);
        let name = name.to_lowercase();

        let command = match name.as_str() {
            "join" | "stay" => Self::parse_join(rest),
            "leave" | "unstay" => Ok(Self::Leave),
            "status" => Ok(Self::Status),
            "latency" | "ping" => Ok(Self::Latency),
            "play" => Self::parse_play(rest),
            "skip" | "next" => Ok(Self::Skip),
            "previous" | "prev" | "back" => Ok(Self::Previous),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "volume" | "vol" => Self::parse_volume(rest),
            "loop" => rest.parse().map(Self::Loop),
            "broadcast" | "tag" => Self::parse_broadcast(rest),
            "stopbroadcast" | "stoptag" => Ok(Self::StopBroadcast),
            "help" => Ok(Self::Help),
            _ => return None,
        };
        Some(command)
    }

    fn parse_join(rest: &str) -> Result<Self> {
        if rest.is_empty() {
            return Ok(Self::Join(None));
        }
        parse_channel(rest)
            .map(|channel| Self::Join(Some(channel)))
            .ok_or_else(|| invalid(format!("'{rest}' is not a channel")))
    }

    fn parse_play(rest: &str) -> Result<Self> {
        let (source, title) = split_word(rest);
        if source.is_empty() {
            return Err(invalid("usage: play <url or path> [title]"));
        }
        Ok(Self::Play {
            source: source.to_string(),
            title: title.to_string(),
        })
    }

    fn parse_volume(rest: &str) -> Result<Self> {
        let value = rest.trim_end_matches('%').trim();
        value
            .parse::<u16>()
            .map(Self::Volume)
            .map_err(|_| invalid("usage: volume <0-200>"))
    }

    fn parse_broadcast(rest: &str) -> Result<Self> {
        const USAGE: &str = "usage: broadcast <@user> <count|forever> <#channel> <message>";

        let (target, rest) = split_word(rest);
        let (count, rest) = split_word(rest);
        let (channel, message) = split_word(rest);

        let target = parse_user(target).ok_or_else(|| invalid(USAGE))?;
        let repeat: Repeat = count.parse()?;
        let channel = parse_channel(channel).ok_or_else(|| invalid(USAGE))?;
        if message.is_empty() {
            return Err(invalid(USAGE));
        }
        Ok(Self::Broadcast {
            target,
            repeat,
            channel,
            message: message.to_string(),
        })
    }
}

/// Run `command` on behalf of `user` in `guild`
///
/// # Errors
///
/// Whatever the underlying session operation reports; see [`error_reply`]
pub async fn execute(
    manager: &SessionManager,
    guild: GuildId,
    user: UserId,
    command: Command,
) -> Result<String> {
    let reply = match command {
        Command::Join(channel) => {
            let (channel, outcome) = manager.join_member_channel(guild, user, channel).await?;
            match outcome {
                JoinOutcome::Connected => format!("joined <#{channel}>"),
                JoinOutcome::Moved => format!("moved to <#{channel}>"),
                JoinOutcome::AlreadyThere => format!("already in <#{channel}>"),
            }
        }
        Command::Leave => {
            if manager.leave_session(guild).await {
                "left voice".to_string()
            } else {
                "not in a session".to_string()
            }
        }
        Command::Status => status_reply(manager, guild).await,
        Command::Latency => match manager.latency().await {
            Some(latency) => format!("gateway latency: {} ms", latency.as_millis()),
            None => "latency not measured yet".to_string(),
        },
        Command::Play { source, title } => {
            let display = Track::new(source.as_str(), title.as_str()).title;
            let enqueued = manager.enqueue_track(guild, source, title).await?;
            if enqueued.started {
                format!("now playing {display}")
            } else {
                format!("queued {display} at position {}", enqueued.position)
            }
        }
        Command::Skip => {
            manager.skip(guild).await?;
            "skipped".to_string()
        }
        Command::Previous => {
            manager.previous(guild).await?;
            "going back".to_string()
        }
        Command::Pause => state_reply(manager.pause(guild).await?),
        Command::Resume => state_reply(manager.resume(guild).await?),
        Command::Volume(percent) => {
            let applied = manager.set_volume(guild, f32::from(percent) / 100.0).await?;
            format!("volume {}%", percent_of(applied))
        }
        Command::Loop(mode) => {
            manager.set_loop_mode(guild, mode).await?;
            format!("loop mode {mode}")
        }
        Command::Broadcast {
            target,
            repeat,
            channel,
            message,
        } => {
            manager
                .start_broadcast(guild, target, message, channel, repeat)
                .await?;
            match repeat {
                Repeat::Times(n) => format!("broadcasting to <@{target}> in <#{channel}> {n} times"),
                Repeat::Forever => format!("broadcasting to <@{target}> in <#{channel}> until stopped"),
            }
        }
        Command::StopBroadcast => {
            if manager.stop_broadcast(guild).await {
                "broadcast stopped".to_string()
            } else {
                "no broadcast running".to_string()
            }
        }
        Command::Help => HELP.to_string(),
    };
    Ok(reply)
}

/// Reply text for a failed command
#[must_use]
pub fn error_reply(error: &Error) -> String {
    match error {
        Error::NotConnected => "not in a voice channel here, use join first".to_string(),
        Error::NoActiveTrack => "nothing is playing".to_string(),
        Error::NoHistory => "no previous track".to_string(),
        Error::QueueEmpty => "nothing to skip to".to_string(),
        Error::NoVoiceChannel => "join a voice channel or name one".to_string(),
        Error::PermissionDenied(_) => "missing permissions for that".to_string(),
        Error::RateLimited { .. } => "slow down, rate limited".to_string(),
        Error::InvalidRequest(reason) => reason.clone(),
        other => format!("failed: {other}"),
    }
}

/// Render a duration as `1h 02m 03s`, `4m 05s` or `6s`
#[must_use]
pub fn format_duration(duration: chrono::Duration) -> String {
    let total = duration.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

const HELP: &str = "join [#channel], leave, status, latency, play <url> [title], skip, \
previous, pause, resume, volume <0-200>, loop <off|single|all>, \
broadcast <@user> <count|forever> <#channel> <message>, stopbroadcast";

async fn status_reply(manager: &SessionManager, guild: GuildId) -> String {
    let status = manager.session_status(guild).await;
    let mut reply = match (status.channel_id, status.attached_for(Utc::now())) {
        (Some(channel), Some(elapsed)) => {
            format!("in <#{channel}> for {}", format_duration(elapsed))
        }
        (_, None) if status.desired_channel_id.is_some() => "reconnecting".to_string(),
        _ => "not in voice".to_string(),
    };

    if let Some(playback) = &status.playback {
        match &playback.current {
            Some(track) => {
                let _ = write!(reply, "; {} {}", playback.state, track.title);
            }
            None => reply.push_str("; idle"),
        }
        let _ = write!(
            reply,
            " ({} queued, loop {}, volume {}%)",
            playback.pending.len(),
            playback.loop_mode,
            percent_of(playback.volume)
        );
    }
    if let Some(campaign) = &status.broadcast {
        let _ = write!(
            reply,
            "; broadcasting to <@{}> in <#{}>, {} left",
            campaign.target, campaign.channel, campaign.remaining
        );
    }
    reply
}

fn state_reply(state: PlaybackState) -> String {
    match state {
        PlaybackState::Idle => "nothing is playing".to_string(),
        PlaybackState::Playing => "playing".to_string(),
        PlaybackState::Paused => "paused".to_string(),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn percent_of(volume: f32) -> u32 {
    (volume * 100.0).round().max(0.0) as u32
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidRequest(reason.into())
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (s, ""),
    }
}

fn parse_user(s: &str) -> Option<UserId> {
    let raw = s
        .strip_prefix("<@")
        .and_then(|s| s.strip_suffix('>'))
        .map_or(s, |s| s.strip_prefix('!').unwrap_or(s));
    raw.parse().ok().map(UserId)
}

fn parse_channel(s: &str) -> Option<ChannelId> {
    let raw = s
        .strip_prefix("<#")
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(s);
    raw.parse().ok().map(ChannelId)
}
