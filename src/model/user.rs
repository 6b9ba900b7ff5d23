use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::ids::*;
pub use crate::model::ids::UserId;

/// Users are the base entity of the platform. A user becomes a [`Member`]
/// (crate::model::guild::Member) of every guild it joins, but the account
/// itself lives outside any guild.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct User {
    /// the user's id
    pub id: UserId,
    /// the user's username, not unique across the platform
    pub username: String,
    /// the user's 4-digit tag; unique among all users sharing a username
    pub discriminator: String,
    /// the user's avatar hash
    pub avatar: Option<String>,
    /// whether the user is a bot account
    #[serde(default)]
    pub bot: bool,
    /// whether the email on this account has been verified
    #[serde(default)]
    pub verified: bool,
    /// the user's email; never exposed to other users
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// password hash; only ever read by the authentication layer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    /// salt the password was hashed with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_salt: Option<String>,
}

obj_id_impl!(User => UserId);

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl User {
    /// The shape of this user everyone else is allowed to see.
    pub fn public(&self) -> PublicUser {
        PublicUser {
            id: self.id,
            username: self.username.clone(),
            discriminator: self.discriminator.clone(),
            avatar: self.avatar.clone(),
            bot: self.bot,
        }
    }

    /// The shape of this user sent to the account owner itself (READY,
    /// `GET /users/@me`).
    pub fn private(&self) -> PrivateUser {
        PrivateUser {
            id: self.id,
            username: self.username.clone(),
            discriminator: self.discriminator.clone(),
            avatar: self.avatar.clone(),
            bot: self.bot,
            verified: self.verified,
            email: self.email.clone(),
        }
    }
}

/// A user as seen by anyone who is not that user.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PublicUser {
    pub id: UserId,
    pub username: String,
    pub discriminator: String,
    pub avatar: Option<String>,
    pub bot: bool,
}

obj_id_impl!(PublicUser => UserId);

/// A user as seen by itself; includes the private account fields.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PrivateUser {
    pub id: UserId,
    pub username: String,
    pub discriminator: String,
    pub avatar: Option<String>,
    pub bot: bool,
    pub verified: bool,
    pub email: Option<String>,
}

/// How many accounts may share one username; the discriminator is four
/// decimal digits and `0000` is reserved.
pub const MAX_PER_USERNAME: usize = 8000;

/// Pick a discriminator not present in `taken`. `taken` holds the
/// discriminators already used by accounts with the same username; returns
/// `None` once the username is saturated.
pub fn pick_discriminator(taken: &[String]) -> Option<String> {
    if taken.len() >= MAX_PER_USERNAME {
        return None;
    }
    let mut rng = rand::thread_rng();
    loop {
        let candidate = format!("{:04}", rng.gen_range(1..=9999));
        if !taken.iter().any(|t| *t == candidate) {
            return Some(candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User {
            id: UserId(1),
            username: "ava".into(),
            discriminator: "0420".into(),
            avatar: None,
            bot: false,
            verified: true,
            email: Some("ava@example.com".into()),
            password_hash: Some("x".into()),
            password_salt: Some("y".into()),
        }
    }

    #[test]
    fn public_form_hides_private_fields() {
        let json = serde_json::to_value(user().public()).unwrap();
        assert!(json.get("email").is_none());
        assert!(json.get("password_hash").is_none());
        assert_eq!(json["username"], "ava");
    }

    #[test]
    fn private_form_keeps_email_but_not_password() {
        let json = serde_json::to_value(user().private()).unwrap();
        assert_eq!(json["email"], "ava@example.com");
        assert!(json.get("password_hash").is_none());
    }

    #[test]
    fn discriminators_do_not_collide() {
        let taken: Vec<String> = (1..50).map(|n| format!("{:04}", n)).collect();
        for _ in 0..100 {
            let picked = pick_discriminator(&taken).unwrap();
            assert!(!taken.contains(&picked));
            assert_eq!(picked.len(), 4);
        }
    }

    #[test]
    fn saturated_username_yields_none() {
        let taken: Vec<String> = (0..MAX_PER_USERNAME).map(|n| format!("{:04}", n)).collect();
        assert!(pick_discriminator(&taken).is_none());
    }
}
