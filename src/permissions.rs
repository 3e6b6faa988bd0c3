use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, RoleId, UserId};

use crate::error::PlayerError;

/// An `allowed_roles` entry. Numbers match role ids, strings match role names
/// (or ids, when the string is all digits).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoleRef {
    Id(u64),
    Name(String),
}

impl RoleRef {
    pub fn matches(&self, role: &ActorRole) -> bool {
        match self {
            RoleRef::Id(id) => role.id.0 == *id,
            RoleRef::Name(name) => match name.parse::<u64>() {
                Ok(id) => role.id.0 == id,
                Err(_) => role.name == *name,
            },
        }
    }
}

impl fmt::Display for RoleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleRef::Id(id) => write!(f, "<@&{id}>"),
            RoleRef::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorRole {
    pub id: RoleId,
    pub name: String,
}

/// The member issuing a command, as far as authorization cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: UserId,
    pub administrator: bool,
    pub roles: Vec<ActorRole>,
}

impl Actor {
    pub fn member(id: UserId) -> Self {
        Self {
            id,
            administrator: false,
            roles: Vec::new(),
        }
    }
}

/// Gate for clear, stop, DJ management and playlist edits.
pub fn is_authorized(actor: &Actor, allowed_roles: &[RoleRef], temporary_djs: &HashSet<UserId>) -> bool {
    if actor.administrator || temporary_djs.contains(&actor.id) {
        return true;
    }

    if allowed_roles.is_empty() {
        return true;
    }

    actor
        .roles
        .iter()
        .any(|role| allowed_roles.iter().any(|allowed| allowed.matches(role)))
}

/// A guild member's voice state, reduced to what a skip vote needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoicePresence {
    pub user: UserId,
    pub channel: Option<ChannelId>,
    pub bot: bool,
}

/// Counts the humans in the bot's voice channel, provided the voter is one of them.
pub fn skip_vote_listeners(bot: UserId, voter: UserId, presences: &[VoicePresence]) -> Result<usize, PlayerError> {
    let channel_of = |user: UserId| {
        presences
            .iter()
            .find(|presence| presence.user == user)
            .and_then(|presence| presence.channel)
    };

    let channel = channel_of(bot).ok_or(PlayerError::NotConnected)?;

    if channel_of(voter) != Some(channel) {
        return Err(PlayerError::NotListening);
    }

    Ok(presences
        .iter()
        .filter(|presence| presence.channel == Some(channel))
        .filter(|presence| !presence.bot && presence.user != bot)
        .count())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(id: u64, name: &str) -> ActorRole {
        ActorRole {
            id: RoleId(id),
            name: name.to_string(),
        }
    }

    #[test]
    fn open_policy_until_roles_are_configured() {
        let actor = Actor::member(UserId(7));
        let mut djs = HashSet::new();

        assert!(is_authorized(&actor, &[], &djs));

        let allowed = [RoleRef::Name("DJ".to_string())];
        assert!(!is_authorized(&actor, &allowed, &djs));

        djs.insert(UserId(7));
        assert!(is_authorized(&actor, &allowed, &djs));
    }

    #[test]
    fn administrators_bypass_roles() {
        let actor = Actor {
            administrator: true,
            ..Actor::member(UserId(1))
        };

        assert!(is_authorized(&actor, &[RoleRef::Id(99)], &HashSet::new()));
    }

    #[test]
    fn roles_match_by_id_or_name() {
        let actor = Actor {
            roles: vec![role(42, "Music")],
            ..Actor::member(UserId(1))
        };
        let djs = HashSet::new();

        assert!(is_authorized(&actor, &[RoleRef::Id(42)], &djs));
        assert!(is_authorized(&actor, &[RoleRef::Name("42".to_string())], &djs));
        assert!(is_authorized(&actor, &[RoleRef::Name("Music".to_string())], &djs));
        assert!(!is_authorized(&actor, &[RoleRef::Name("music".to_string()), RoleRef::Id(7)], &djs));
    }

    #[test]
    fn role_refs_deserialize_from_numbers_and_strings() {
        let roles: Vec<RoleRef> = serde_json::from_str(r#"[123, "DJ"]"#).unwrap();
        assert_eq!(roles, [RoleRef::Id(123), RoleRef::Name("DJ".to_string())]);
    }

    fn presence(user: u64, channel: Option<u64>, bot: bool) -> VoicePresence {
        VoicePresence {
            user: UserId(user),
            channel: channel.map(ChannelId),
            bot,
        }
    }

    #[test]
    fn only_listeners_of_the_bot_channel_may_vote() {
        let bot = UserId(100);
        let presences = [
            presence(100, Some(1), true),
            presence(1, Some(1), false),
            presence(2, Some(1), false),
            presence(3, Some(2), false),
            presence(4, None, false),
            presence(200, Some(1), true),
        ];

        assert_eq!(skip_vote_listeners(bot, UserId(1), &presences).unwrap(), 2);
        assert!(matches!(skip_vote_listeners(bot, UserId(3), &presences), Err(PlayerError::NotListening)));
        assert!(matches!(skip_vote_listeners(bot, UserId(4), &presences), Err(PlayerError::NotListening)));
        assert!(matches!(skip_vote_listeners(bot, UserId(5), &presences), Err(PlayerError::NotListening)));
    }

    #[test]
    fn nobody_votes_while_the_bot_is_not_in_voice() {
        let presences = [presence(100, None, true), presence(1, Some(1), false)];

        assert!(matches!(
            skip_vote_listeners(UserId(100), UserId(1), &presences),
            Err(PlayerError::NotConnected)
        ));
        assert!(matches!(
            skip_vote_listeners(UserId(100), UserId(1), &presences[1..]),
            Err(PlayerError::NotConnected)
        ));
    }
}
