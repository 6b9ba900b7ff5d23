//! The server's shared state: the flat domain containers, the service
//! objects (snowflakes, sessions, dispatcher, presence tracker), and every
//! model mutation the REST surface performs. Mutations follow one shape:
//! validate, mutate the in-memory graph, mirror to the repository, then
//! dispatch the resulting events.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::cache::IdMap;
use crate::config::Config;
use crate::gateway::dispatch::{
    ChannelPinsUpdate, Dispatcher, Event, GuildBan, GuildDelete, GuildMemberRemove,
    GuildMemberUpdate, GuildRoleUpdate, MessageDelete, MessageDeleteBulk, TypingStart,
};
use crate::gateway::presence::PresenceTracker;
use crate::gateway::session::SessionRegistry;
use crate::http::ApiError;
use crate::model::channel::{Channel, ChannelKind, TextChannel, VoiceChannel, MAX_PINS};
use crate::model::guild::{Guild, GuildEdit, Member, MemberView};
use crate::model::ids::*;
use crate::model::invite::{Invite, InviteChannel, InviteCreateBody, InviteGuild, InviteView};
use crate::model::message::{
    extract_mentions, Message, MessageCreateBody, MessageKind, MessageView,
    BULK_DELETE_MAX_AGE_MILLIS, MAX_CONTENT_LEN,
};
use crate::model::permissions::{Role, RoleEdit};
use crate::model::presence::{Presence, PresenceUpdateRequest, PresenceView};
use crate::model::user::{PublicUser, User};
use crate::repo::{collections, Query, Repository};
use crate::utils::{random_invite_code, Clock};

/// How often the invite janitor wakes up.
const INVITE_JANITOR_PERIOD: std::time::Duration = std::time::Duration::from_secs(30 * 60);

pub struct ChatState {
    pub config: Config,
    pub repo: Arc<dyn Repository>,
    pub clock: Clock,
    pub snowflakes: Snowflakes,

    pub users: RwLock<IdMap<User>>,
    pub guilds: RwLock<IdMap<Guild>>,
    pub channels: RwLock<IdMap<Channel>>,
    pub messages: RwLock<IdMap<Message>>,
    pub invites: RwLock<HashMap<String, Invite>>,
    /// nonces already seen, per author
    pub used_nonces: RwLock<HashMap<UserId, HashSet<String>>>,

    pub sessions: SessionRegistry,
    pub dispatcher: Dispatcher,
    pub presences: PresenceTracker,

    conn_ids: AtomicU64,
}

impl ChatState {
    /// Build the state and hydrate the in-memory graph from the repository.
    pub async fn load(repo: Arc<dyn Repository>, config: Config) -> anyhow::Result<Arc<Self>> {
        let clock = Clock::new();
        let state = Self {
            config,
            repo,
            snowflakes: Snowflakes::new(clock.clone()),
            clock,
            users: RwLock::default(),
            guilds: RwLock::default(),
            channels: RwLock::default(),
            messages: RwLock::default(),
            invites: RwLock::default(),
            used_nonces: RwLock::default(),
            sessions: SessionRegistry::new(),
            dispatcher: Dispatcher::new(),
            presences: PresenceTracker::new(),
            conn_ids: AtomicU64::new(1),
        };

        state.hydrate().await?;
        Ok(Arc::new(state))
    }

    async fn hydrate(&self) -> anyhow::Result<()> {
        let repo = &self.repo;

        let mut users = self.users.write().await;
        for doc in repo.collection(collections::USERS).find(Query::all(), None).await? {
            match serde_json::from_value::<User>(doc) {
                Ok(user) => users.insert(user),
                Err(error) => log::warn!("[state] skipping bad user doc: {}", error),
            }
        }
        log::info!("[state] loaded {} users", users.len());
        drop(users);

        let mut members_by_guild: HashMap<GuildId, Vec<Member>> = HashMap::new();
        for doc in repo.collection(collections::MEMBERS).find(Query::all(), None).await? {
            match serde_json::from_value::<Member>(doc) {
                Ok(member) => members_by_guild.entry(member.guild_id).or_default().push(member),
                Err(error) => log::warn!("[state] skipping bad member doc: {}", error),
            }
        }

        let mut guilds = self.guilds.write().await;
        for doc in repo.collection(collections::GUILDS).find(Query::all(), None).await? {
            let mut guild: Guild = match serde_json::from_value(doc) {
                Ok(guild) => guild,
                Err(error) => {
                    log::warn!("[state] skipping bad guild doc: {}", error);
                    continue;
                }
            };
            for member in members_by_guild.remove(&guild.id).unwrap_or_default() {
                guild.members.insert(member);
            }
            // the owner is always a member
            if !guild.member_ids.contains(&guild.owner_id) {
                log::warn!("[state] guild {} owner was not a member, fixing", guild.id);
                guild.member_ids.insert(guild.owner_id);
            }
            // every member id resolves to a member record, backfilled if the
            // store lost one
            let missing: Vec<UserId> = guild.member_ids.iter()
                .filter(|id| guild.members.get(**id).is_none())
                .copied()
                .collect();
            for user_id in missing {
                let member = Member {
                    id: user_id,
                    guild_id: guild.id,
                    nick: None,
                    joined_at: self.clock.now(),
                    deaf: false,
                    mute: false,
                    roles: vec![],
                };
                repo.collection(collections::MEMBERS)
                    .insert_one(serde_json::to_value(&member)?)
                    .await?;
                guild.members.insert(member);
            }
            if guild.everyone_role().is_none() {
                guild.roles.insert(Role::everyone(guild.id));
            }
            guilds.insert(guild);
        }
        log::info!("[state] loaded {} guilds", guilds.len());
        drop(guilds);

        let mut channels = self.channels.write().await;
        for doc in repo.collection(collections::CHANNELS).find(Query::all(), None).await? {
            match serde_json::from_value::<Channel>(doc) {
                Ok(channel) => channels.insert(channel),
                Err(error) => log::warn!("[state] skipping bad channel doc: {}", error),
            }
        }
        log::info!("[state] loaded {} channels", channels.len());
        drop(channels);

        let mut messages = self.messages.write().await;
        for doc in repo.collection(collections::MESSAGES).find(Query::all(), Some("id")).await? {
            match serde_json::from_value::<Message>(doc) {
                Ok(message) => messages.insert(message),
                Err(error) => log::warn!("[state] skipping bad message doc: {}", error),
            }
        }
        log::info!("[state] loaded {} messages", messages.len());
        drop(messages);

        let now = self.clock.now();
        let mut invites = self.invites.write().await;
        let mut expired = 0usize;
        for doc in repo.collection(collections::INVITES).find(Query::all(), None).await? {
            match serde_json::from_value::<Invite>(doc) {
                Ok(invite) if invite.expired(now) => {
                    repo.collection(collections::INVITES)
                        .delete_one(Query::new().eq("code", invite.code.clone()))
                        .await?;
                    expired += 1;
                }
                Ok(invite) => {
                    invites.insert(invite.code.clone(), invite);
                }
                Err(error) => log::warn!("[state] skipping bad invite doc: {}", error),
            }
        }
        log::info!("[state] loaded {} invites ({} expired dropped)", invites.len(), expired);

        Ok(())
    }

    pub fn next_conn_id(&self) -> u64 {
        self.conn_ids.fetch_add(1, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // lookups

    pub async fn user(&self, id: UserId) -> Option<User> {
        self.users.read().await.get(id).cloned()
    }

    pub async fn public_user(&self, id: UserId) -> Option<PublicUser> {
        self.users.read().await.get(id).map(User::public)
    }

    pub async fn guild(&self, id: GuildId) -> Option<Guild> {
        self.guilds.read().await.get(id).cloned()
    }

    pub async fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.channels.read().await.get(id).cloned()
    }

    pub async fn message(&self, id: MessageId) -> Option<Message> {
        self.messages.read().await.get(id).cloned()
    }

    /// Resolve a bearer token to its user through the token store.
    pub async fn token_user(&self, token: &str) -> Option<User> {
        let doc = self.repo
            .collection(collections::TOKENS)
            .find_one(Query::new().eq("token", token))
            .await
            .ok()??;
        let user_id: UserId = doc.get("user_id")?.as_str()?.parse().ok()?;
        self.user(user_id).await
    }

    pub async fn user_guild_ids(&self, user_id: UserId) -> Vec<GuildId> {
        self.guilds.read().await.iter()
            .filter(|guild| guild.is_member(user_id))
            .map(|guild| guild.id)
            .collect()
    }

    pub async fn guild_channels(&self, guild_id: GuildId) -> Vec<Channel> {
        self.channels.read().await.iter()
            .filter(|channel| channel.guild_id() == guild_id)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // wire views

    pub async fn member_view(&self, member: &Member) -> Option<MemberView> {
        let user = self.public_user(member.id).await?;
        Some(member.view(user))
    }

    pub async fn presence_view(&self, guild_id: GuildId, user_id: UserId) -> Option<PresenceView> {
        let user = self.public_user(user_id).await?;
        let Presence { status, game } = self.presences.get(user_id).await;
        Some(PresenceView { user, guild_id, roles: vec![], game, status })
    }

    /// Presences of every online member of the guild.
    pub async fn guild_presences(&self, guild: &Guild) -> Vec<PresenceView> {
        let mut views = Vec::new();
        for member in guild.members.iter() {
            if self.presences.is_online(member.id).await {
                if let Some(view) = self.presence_view(guild.id, member.id).await {
                    views.push(view);
                }
            }
        }
        views
    }

    pub async fn online_member_views(&self, guild: &Guild) -> Vec<MemberView> {
        let mut views = Vec::new();
        for member in guild.members.iter() {
            if self.presences.is_online(member.id).await {
                if let Some(view) = self.member_view(member).await {
                    views.push(view);
                }
            }
        }
        views
    }

    pub async fn message_view(&self, message: &Message) -> Option<MessageView> {
        let author = self.public_user(message.author_id).await?;
        let mut mentions = Vec::new();
        for id in &message.mentions {
            if let Some(user) = self.public_user(*id).await {
                mentions.push(user);
            }
        }
        Some(MessageView {
            id: message.id,
            channel_id: message.channel_id,
            author,
            content: message.content.clone(),
            timestamp: message.created_at(),
            edited_timestamp: message.edited_at,
            tts: false,
            mention_everyone: message.mentions_everyone(),
            mentions,
            mention_roles: vec![],
            attachments: message.attachments.clone(),
            embeds: vec![],
            pinned: message.pinned,
            nonce: message.nonce.clone(),
            kind: message.kind,
        })
    }

    /// The full guild wire object, as sent in READY and GUILD_CREATE. For
    /// guilds larger than `large_threshold` only online members are listed.
    pub async fn guild_json(&self, guild: &Guild, large_threshold: usize) -> Value {
        let members = if guild.member_count() > large_threshold {
            self.online_member_views(guild).await
        } else {
            let mut views = Vec::new();
            for member in guild.members.iter() {
                if let Some(view) = self.member_view(member).await {
                    views.push(view);
                }
            }
            views
        };
        let channels: Vec<Value> = self.guild_channels(guild.id).await.iter()
            .map(|channel| serde_json::to_value(channel).expect("channels serialize"))
            .collect();
        let presences = self.guild_presences(guild).await;

        json!({
            "id": guild.id,
            "name": guild.name,
            "icon": guild.icon,
            "splash": guild.splash,
            "owner_id": guild.owner_id,
            "region": guild.region,
            "features": guild.features,
            "roles": guild.roles,
            "emojis": [],
            "member_count": guild.member_count(),
            "large": guild.large(),
            "unavailable": false,
            "joined_at": guild.id.timestamp(),
            "voice_states": [],
            "members": members,
            "channels": channels,
            "presences": presences,
        })
    }

    pub async fn invite_view(&self, invite: &Invite) -> Option<InviteView> {
        let channel = self.channel(invite.channel_id).await?;
        let guild = self.guild(channel.guild_id()).await?;
        let inviter = self.public_user(invite.inviter_id).await?;
        Some(InviteView {
            code: invite.code.clone(),
            guild: InviteGuild {
                id: guild.id,
                name: guild.name.clone(),
                icon: guild.icon.clone(),
                splash: guild.splash.clone(),
            },
            channel: InviteChannel {
                id: channel.channel_id(),
                name: channel.name().to_string(),
                kind: channel.kind(),
            },
            inviter,
            uses: invite.uses,
            expires_at: invite.expires_at,
            temporary: invite.temporary,
        })
    }

    // ------------------------------------------------------------------
    // fan-out

    /// Send an event to every viewer of a guild. Viewers whose user has no
    /// delivering connection left are unmarked.
    pub async fn dispatch_guild(&self, guild_id: GuildId, event: &Event) -> usize {
        let viewers: Vec<UserId> = match self.guilds.read().await.get(guild_id) {
            Some(guild) => guild.viewers.iter().copied().collect(),
            None => {
                log::warn!("[dispatch] {} for unknown guild {}", event.name(), guild_id);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for user_id in viewers {
            if self.dispatcher.dispatch_user(user_id, event).await == 0 {
                dead.push(user_id);
            } else {
                delivered += 1;
            }
        }

        if !dead.is_empty() {
            let mut guilds = self.guilds.write().await;
            if let Some(guild) = guilds.get_mut(guild_id) {
                for user_id in dead {
                    guild.unmark_viewer(user_id);
                }
            }
        }

        delivered
    }

    /// Channel dispatch is guild dispatch today; per-channel permission
    /// filtering slots in here without touching call sites.
    pub async fn dispatch_channel(&self, channel_id: ChannelId, event: &Event) -> usize {
        let Some(guild_id) = self.channel(channel_id).await.map(|c| c.guild_id()) else {
            log::warn!("[dispatch] {} for unknown channel {}", event.name(), channel_id);
            return 0;
        };
        self.dispatch_guild(guild_id, event).await
    }

    // ------------------------------------------------------------------
    // presence

    /// Merge a presence update for the user and fan PRESENCE_UPDATE out to
    /// every guild they are a member of.
    pub async fn presence_global_update(&self, user_id: UserId, update: PresenceUpdateRequest) {
        self.presences.merge(user_id, update).await;
        self.broadcast_presence(user_id).await;
    }

    /// The user's last connection dropped: broadcast offline.
    pub async fn presence_offline(&self, user_id: UserId) {
        self.presences.clear(user_id).await;
        self.broadcast_presence(user_id).await;
    }

    async fn broadcast_presence(&self, user_id: UserId) {
        for guild_id in self.user_guild_ids(user_id).await {
            if let Some(view) = self.presence_view(guild_id, user_id).await {
                self.dispatch_guild(guild_id, &Event::PresenceUpdate(view)).await;
            }
        }
    }

    /// TYPING_START carries no stored state; it is pure fan-out.
    pub async fn typing_start(&self, user_id: UserId, channel_id: ChannelId) {
        let event = Event::TypingStart(TypingStart {
            channel_id,
            user_id,
            timestamp: self.clock.now().timestamp(),
        });
        self.dispatch_channel(channel_id, &event).await;
    }

    // ------------------------------------------------------------------
    // messages

    pub async fn create_message(
        &self,
        author: &User,
        channel_id: ChannelId,
        body: MessageCreateBody,
    ) -> Result<MessageView, ApiError> {
        let channel = self.channel(channel_id).await.ok_or(ApiError::UnknownChannel)?;
        let text = channel.text().ok_or(ApiError::CannotSendInVoice)?;
        self.require_member(channel.guild_id(), author.id).await?;

        let content = body.content;
        if content.is_empty() && body.attachments.is_empty() {
            return Err(ApiError::EmptyMessage);
        }
        if content.chars().count() > MAX_CONTENT_LEN {
            return Err(ApiError::ContentTooLong);
        }

        if let Some(nonce) = &body.nonce {
            let mut nonces = self.used_nonces.write().await;
            let seen = nonces.entry(author.id).or_default();
            if !seen.insert(nonce.clone()) {
                return Err(ApiError::NonceConflict);
            }
        }

        let message = Message {
            id: self.snowflakes.generate(),
            channel_id: text.id,
            author_id: author.id,
            mentions: extract_mentions(&content),
            content,
            edited_at: None,
            pinned: false,
            attachments: body.attachments,
            nonce: body.nonce,
            kind: MessageKind::Default,
        };

        self.repo.collection(collections::MESSAGES)
            .insert_one(serde_json::to_value(&message)?)
            .await?;
        self.messages.write().await.insert(message.clone());

        {
            let mut channels = self.channels.write().await;
            if let Some(text) = channels.get_mut(channel_id).and_then(Channel::text_mut) {
                text.last_message_id = Some(message.id);
            }
        }
        self.persist_channel(channel_id).await?;

        let view = self.message_view(&message).await.ok_or(ApiError::UnknownUser)?;
        self.dispatch_channel(channel_id, &Event::MessageCreate(view.clone())).await;
        Ok(view)
    }

    pub async fn edit_message(
        &self,
        author: &User,
        channel_id: ChannelId,
        message_id: MessageId,
        content: String,
    ) -> Result<MessageView, ApiError> {
        let channel = self.channel(channel_id).await.ok_or(ApiError::UnknownChannel)?;
        self.require_member(channel.guild_id(), author.id).await?;

        if content.is_empty() {
            return Err(ApiError::EmptyMessage);
        }
        if content.chars().count() > MAX_CONTENT_LEN {
            return Err(ApiError::ContentTooLong);
        }

        let message = {
            let mut messages = self.messages.write().await;
            let message = messages.get_mut(message_id).ok_or(ApiError::UnknownMessage)?;
            if message.channel_id != channel_id {
                return Err(ApiError::UnknownMessage);
            }
            if message.author_id != author.id {
                return Err(ApiError::CannotEditOthersMessage);
            }
            message.content = content;
            message.edited_at = Some(self.clock.now());
            message.refresh_mentions();
            message.clone()
        };

        self.repo.collection(collections::MESSAGES)
            .replace_one(Query::new().eq("id", message_id.to_string()), serde_json::to_value(&message)?)
            .await?;

        let view = self.message_view(&message).await.ok_or(ApiError::UnknownUser)?;
        self.dispatch_channel(channel_id, &Event::MessageUpdate(view.clone())).await;
        Ok(view)
    }

    pub async fn delete_message(
        &self,
        author: &User,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), ApiError> {
        let channel = self.channel(channel_id).await.ok_or(ApiError::UnknownChannel)?;
        self.require_member(channel.guild_id(), author.id).await?;

        {
            let messages = self.messages.read().await;
            let message = messages.get(message_id).ok_or(ApiError::UnknownMessage)?;
            if message.channel_id != channel_id {
                return Err(ApiError::UnknownMessage);
            }
            if message.author_id != author.id {
                return Err(ApiError::Unauthorized);
            }
        }

        self.remove_message_records(&[message_id], channel_id).await?;
        self.dispatch_channel(channel_id, &Event::MessageDelete(MessageDelete {
            id: message_id,
            channel_id,
        })).await;
        Ok(())
    }

    /// Delete up to the whole id list at once. The entire request is
    /// refused if any message is older than the 14 day window.
    pub async fn bulk_delete(
        &self,
        user: &User,
        channel_id: ChannelId,
        ids: Vec<MessageId>,
    ) -> Result<(), ApiError> {
        let channel = self.channel(channel_id).await.ok_or(ApiError::UnknownChannel)?;
        let guild = self.guild(channel.guild_id()).await.ok_or(ApiError::UnknownGuild)?;
        if guild.owner_id != user.id {
            return Err(ApiError::MissingPermissions);
        }
        if ids.is_empty() {
            return Ok(());
        }

        let now = self.clock.now_millis();
        for id in &ids {
            let age = now.saturating_sub(id.timestamp().timestamp_millis() as u64);
            if age > BULK_DELETE_MAX_AGE_MILLIS {
                return Err(ApiError::MessageTooOld);
            }
        }

        let ids: Vec<MessageId> = {
            let messages = self.messages.read().await;
            ids.into_iter()
                .filter(|id| messages.get(*id).map_or(false, |m| m.channel_id == channel_id))
                .collect()
        };
        self.remove_message_records(&ids, channel_id).await?;

        self.dispatch_channel(channel_id, &Event::MessageDeleteBulk(MessageDeleteBulk {
            ids,
            channel_id,
        })).await;
        Ok(())
    }

    async fn remove_message_records(&self, ids: &[MessageId], channel_id: ChannelId) -> Result<(), ApiError> {
        {
            let mut messages = self.messages.write().await;
            for id in ids {
                messages.remove(*id);
            }
        }
        for id in ids {
            self.repo.collection(collections::MESSAGES)
                .delete_one(Query::new().eq("id", id.to_string()))
                .await?;
        }
        // deleted messages cannot stay pinned
        let mut unpinned = false;
        {
            let mut channels = self.channels.write().await;
            if let Some(text) = channels.get_mut(channel_id).and_then(Channel::text_mut) {
                let before = text.pins.len();
                text.pins.retain(|pin| !ids.contains(pin));
                unpinned = text.pins.len() != before;
            }
        }
        if unpinned {
            self.persist_channel(channel_id).await?;
        }
        Ok(())
    }

    /// Channel history, newest first, filtered by the `before`/`after`/
    /// `around` anchors.
    pub async fn channel_messages(
        &self,
        channel_id: ChannelId,
        limit: usize,
        before: Option<MessageId>,
        after: Option<MessageId>,
        around: Option<MessageId>,
    ) -> Vec<Message> {
        let messages = self.messages.read().await;
        let mut list: Vec<Message> = messages.iter()
            .filter(|m| m.channel_id == channel_id)
            .cloned()
            .collect();
        list.sort_by_key(|m| std::cmp::Reverse(m.id));

        if let Some(around) = around {
            // the window is half the limit on either side, in raw id units
            let half = (limit / 2) as u64;
            let low = MessageId(around.0.saturating_sub(half));
            let high = MessageId(around.0.saturating_add(half));
            list.retain(|m| m.id > low && m.id < high);
        } else if let Some(before) = before {
            list.retain(|m| m.id < before);
        } else if let Some(after) = after {
            list.retain(|m| m.id > after);
        }

        list.truncate(limit);
        list
    }

    // ------------------------------------------------------------------
    // pins

    pub async fn pin_message(
        &self,
        user: &User,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), ApiError> {
        let channel = self.channel(channel_id).await.ok_or(ApiError::UnknownChannel)?;
        self.require_member(channel.guild_id(), user.id).await?;

        {
            let messages = self.messages.read().await;
            let message = messages.get(message_id).ok_or(ApiError::UnknownMessage)?;
            if message.channel_id != channel_id {
                return Err(ApiError::PinChannelMismatch);
            }
        }

        {
            let mut channels = self.channels.write().await;
            let text = channels.get_mut(channel_id)
                .and_then(Channel::text_mut)
                .ok_or(ApiError::UnknownChannel)?;
            if text.pins.contains(&message_id) {
                return Ok(());
            }
            if text.pins.len() >= MAX_PINS {
                return Err(ApiError::PinLimit);
            }
            text.pins.push(message_id);
        }
        self.persist_channel(channel_id).await?;

        {
            let mut messages = self.messages.write().await;
            if let Some(message) = messages.get_mut(message_id) {
                message.pinned = true;
            }
        }
        self.repo.collection(collections::MESSAGES)
            .update_one(Query::new().eq("id", message_id.to_string()), json!({"pinned": true}))
            .await?;

        self.dispatch_channel(channel_id, &Event::ChannelPinsUpdate(ChannelPinsUpdate {
            channel_id,
            last_pin_timestamp: Some(self.clock.now()),
        })).await;
        Ok(())
    }

    pub async fn unpin_message(
        &self,
        user: &User,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), ApiError> {
        let channel = self.channel(channel_id).await.ok_or(ApiError::UnknownChannel)?;
        self.require_member(channel.guild_id(), user.id).await?;

        {
            let messages = self.messages.read().await;
            let message = messages.get(message_id).ok_or(ApiError::UnknownMessage)?;
            if message.channel_id != channel_id {
                return Err(ApiError::PinChannelMismatch);
            }
        }

        {
            let mut channels = self.channels.write().await;
            let text = channels.get_mut(channel_id)
                .and_then(Channel::text_mut)
                .ok_or(ApiError::UnknownChannel)?;
            text.pins.retain(|pin| *pin != message_id);
        }
        self.persist_channel(channel_id).await?;

        {
            let mut messages = self.messages.write().await;
            if let Some(message) = messages.get_mut(message_id) {
                message.pinned = false;
            }
        }
        self.repo.collection(collections::MESSAGES)
            .update_one(Query::new().eq("id", message_id.to_string()), json!({"pinned": false}))
            .await?;

        self.dispatch_channel(channel_id, &Event::ChannelPinsUpdate(ChannelPinsUpdate {
            channel_id,
            last_pin_timestamp: None,
        })).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // channels

    pub async fn create_channel(
        &self,
        user: &User,
        guild_id: GuildId,
        name: String,
        kind: ChannelKind,
    ) -> Result<Channel, ApiError> {
        let guild = self.guild(guild_id).await.ok_or(ApiError::UnknownGuild)?;
        if guild.owner_id != user.id {
            return Err(ApiError::Unauthorized);
        }
        if !crate::model::channel::valid_channel_name(&name) {
            return Err(ApiError::BadRequest("channel name must be 2-100 characters".into()));
        }

        let position = self.guild_channels(guild_id).await.len() as i32;
        let id: ChannelId = self.snowflakes.generate();
        let channel = match kind {
            ChannelKind::Text => Channel::Text(TextChannel {
                id,
                guild_id,
                name,
                position,
                topic: String::new(),
                last_message_id: None,
                pins: vec![],
            }),
            ChannelKind::Voice => Channel::Voice(VoiceChannel {
                id,
                guild_id,
                name,
                position,
                bitrate: 64_000,
                user_limit: 0,
            }),
        };

        self.repo.collection(collections::CHANNELS)
            .insert_one(serde_json::to_value(&channel)?)
            .await?;
        self.channels.write().await.insert(channel.clone());

        let value = serde_json::to_value(&channel)?;
        self.dispatch_guild(guild_id, &Event::ChannelCreate(value)).await;
        Ok(channel)
    }

    /// Apply an already type-checked edit; the HTTP layer picks the schema
    /// by pattern-matching the channel variant.
    pub async fn apply_channel_edit<F>(&self, channel_id: ChannelId, apply: F) -> Result<Channel, ApiError>
        where F: FnOnce(&mut Channel),
    {
        let channel = {
            let mut channels = self.channels.write().await;
            let channel = channels.get_mut(channel_id).ok_or(ApiError::UnknownChannel)?;
            apply(channel);
            channel.clone()
        };
        self.persist_channel(channel_id).await?;

        let value = serde_json::to_value(&channel)?;
        self.dispatch_guild(channel.guild_id(), &Event::ChannelUpdate(value)).await;
        Ok(channel)
    }

    pub async fn delete_channel(&self, user: &User, channel_id: ChannelId) -> Result<Channel, ApiError> {
        let channel = self.channel(channel_id).await.ok_or(ApiError::UnknownChannel)?;
        let guild = self.guild(channel.guild_id()).await.ok_or(ApiError::UnknownGuild)?;
        if guild.owner_id != user.id {
            return Err(ApiError::Unauthorized);
        }

        self.channels.write().await.remove(channel_id);
        self.repo.collection(collections::CHANNELS)
            .delete_one(Query::new().eq("id", channel_id.to_string()))
            .await?;

        // drop the channel's messages with it
        let ids: Vec<MessageId> = self.messages.read().await.iter()
            .filter(|m| m.channel_id == channel_id)
            .map(|m| m.id)
            .collect();
        {
            let mut messages = self.messages.write().await;
            for id in &ids {
                messages.remove(*id);
            }
        }
        for id in ids {
            self.repo.collection(collections::MESSAGES)
                .delete_one(Query::new().eq("id", id.to_string()))
                .await?;
        }

        let value = serde_json::to_value(&channel)?;
        self.dispatch_guild(guild.id, &Event::ChannelDelete(value)).await;
        Ok(channel)
    }

    async fn persist_channel(&self, channel_id: ChannelId) -> Result<(), ApiError> {
        if let Some(channel) = self.channel(channel_id).await {
            self.repo.collection(collections::CHANNELS)
                .replace_one(Query::new().eq("id", channel_id.to_string()), serde_json::to_value(&channel)?)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // guilds & membership

    pub async fn create_guild(&self, owner: &User, name: String, region: String, icon: Option<String>) -> Result<Value, ApiError> {
        let len = name.trim().chars().count();
        if !(2..=100).contains(&len) {
            return Err(ApiError::BadRequest("guild name must be 2-100 characters".into()));
        }

        let guild_id: GuildId = self.snowflakes.generate();
        let mut guild = Guild {
            id: guild_id,
            name,
            owner_id: owner.id,
            region,
            icon,
            splash: None,
            features: vec![],
            member_ids: [owner.id].into_iter().collect(),
            members: IdMap::default(),
            roles: [Role::everyone(guild_id)].into_iter().collect(),
            bans: HashSet::new(),
            viewers: HashSet::new(),
        };
        let owner_member = Member {
            id: owner.id,
            guild_id,
            nick: None,
            joined_at: self.clock.now(),
            deaf: false,
            mute: false,
            roles: vec![],
        };
        guild.members.insert(owner_member.clone());

        // a fresh guild starts with one text channel
        let channel = Channel::Text(TextChannel {
            id: self.snowflakes.generate(),
            guild_id,
            name: "general".into(),
            position: 0,
            topic: String::new(),
            last_message_id: None,
            pins: vec![],
        });

        if self.dispatcher.connection_count(owner.id).await > 0 {
            guild.mark_viewer(owner.id);
        }

        self.repo.collection(collections::GUILDS)
            .insert_one(serde_json::to_value(&guild)?)
            .await?;
        self.repo.collection(collections::MEMBERS)
            .insert_one(serde_json::to_value(&owner_member)?)
            .await?;
        self.repo.collection(collections::CHANNELS)
            .insert_one(serde_json::to_value(&channel)?)
            .await?;

        self.channels.write().await.insert(channel);
        self.guilds.write().await.insert(guild.clone());

        let guild_json = self.guild_json(&guild, usize::MAX).await;
        self.dispatch_guild(guild_id, &Event::GuildCreate(guild_json.clone())).await;
        Ok(guild_json)
    }

    pub async fn edit_guild(&self, user: &User, guild_id: GuildId, edit: GuildEdit) -> Result<Value, ApiError> {
        if !edit.validate() {
            return Err(ApiError::BadRequest("invalid guild edit".into()));
        }
        let guild = {
            let mut guilds = self.guilds.write().await;
            let guild = guilds.get_mut(guild_id).ok_or(ApiError::UnknownGuild)?;
            if guild.owner_id != user.id {
                return Err(ApiError::Unauthorized);
            }
            if let Some(new_owner) = edit.owner_id {
                if !guild.member_ids.contains(&new_owner) {
                    return Err(ApiError::UnknownMember);
                }
                guild.owner_id = new_owner;
            }
            if let Some(name) = edit.name { guild.name = name; }
            if let Some(region) = edit.region { guild.region = region; }
            if let Some(icon) = edit.icon { guild.icon = Some(icon); }
            if let Some(splash) = edit.splash { guild.splash = Some(splash); }
            guild.clone()
        };
        self.persist_guild(guild_id).await?;

        let guild_json = self.guild_json(&guild, usize::MAX).await;
        self.dispatch_guild(guild_id, &Event::GuildUpdate(guild_json.clone())).await;
        Ok(guild_json)
    }

    pub async fn delete_guild(&self, user: &User, guild_id: GuildId) -> Result<(), ApiError> {
        let guild = self.guild(guild_id).await.ok_or(ApiError::UnknownGuild)?;
        if guild.owner_id != user.id {
            return Err(ApiError::Unauthorized);
        }

        // tell everyone first, while the viewer set still exists
        self.dispatch_guild(guild_id, &Event::GuildDelete(GuildDelete {
            id: guild_id,
            unavailable: false,
        })).await;

        let channel_ids: Vec<ChannelId> = self.guild_channels(guild_id).await.iter()
            .map(Channel::channel_id)
            .collect();
        {
            let mut channels = self.channels.write().await;
            for id in &channel_ids {
                channels.remove(*id);
            }
        }
        {
            let mut messages = self.messages.write().await;
            let doomed: Vec<MessageId> = messages.iter()
                .filter(|m| channel_ids.contains(&m.channel_id))
                .map(|m| m.id)
                .collect();
            for id in doomed {
                messages.remove(id);
            }
        }
        self.guilds.write().await.remove(guild_id);

        let repo_guild_id = guild_id.to_string();
        self.repo.collection(collections::GUILDS)
            .delete_one(Query::new().eq("id", repo_guild_id.clone()))
            .await?;
        self.repo.collection(collections::MEMBERS)
            .delete_many(Query::new().eq("guild_id", repo_guild_id.clone()))
            .await?;
        for id in channel_ids {
            self.repo.collection(collections::CHANNELS)
                .delete_one(Query::new().eq("id", id.to_string()))
                .await?;
            self.repo.collection(collections::MESSAGES)
                .delete_many(Query::new().eq("channel_id", id.to_string()))
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn require_member(&self, guild_id: GuildId, user_id: UserId) -> Result<(), ApiError> {
        let guilds = self.guilds.read().await;
        let guild = guilds.get(guild_id).ok_or(ApiError::UnknownGuild)?;
        if guild.is_member(user_id) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }

    /// Add a user to a guild (invite acceptance). Banned users are refused.
    pub async fn add_member(&self, guild_id: GuildId, user: &User) -> Result<MemberView, ApiError> {
        let member = {
            let mut guilds = self.guilds.write().await;
            let guild = guilds.get_mut(guild_id).ok_or(ApiError::UnknownGuild)?;
            if guild.bans.contains(&user.id) {
                return Err(ApiError::Unauthorized);
            }
            if guild.is_member(user.id) {
                return Err(ApiError::BadRequest("already a member".into()));
            }
            let member = Member {
                id: user.id,
                guild_id,
                nick: None,
                joined_at: self.clock.now(),
                deaf: false,
                mute: false,
                roles: vec![],
            };
            guild.member_ids.insert(user.id);
            guild.members.insert(member.clone());
            // the joiner's live connections start receiving this guild
            member
        };
        self.persist_guild(guild_id).await?;
        self.repo.collection(collections::MEMBERS)
            .insert_one(serde_json::to_value(&member)?)
            .await?;

        let mut view = self.member_view(&member).await.ok_or(ApiError::UnknownUser)?;
        view.guild_id = Some(guild_id);
        self.dispatch_guild(guild_id, &Event::GuildMemberAdd(view.clone())).await;

        // the new member gets the whole guild and joins the viewer set
        if self.dispatcher.connection_count(user.id).await > 0 {
            {
                let mut guilds = self.guilds.write().await;
                if let Some(guild) = guilds.get_mut(guild_id) {
                    guild.mark_viewer(user.id);
                }
            }
            if let Some(guild) = self.guild(guild_id).await {
                let guild_json = self.guild_json(&guild, usize::MAX).await;
                self.dispatcher.dispatch_user(user.id, &Event::GuildCreate(guild_json)).await;
            }
        }
        Ok(view)
    }

    /// Remove a member (kick or voluntary leave). The removed user gets a
    /// GUILD_DELETE; everyone else a GUILD_MEMBER_REMOVE.
    pub async fn remove_member(&self, guild_id: GuildId, user_id: UserId) -> Result<(), ApiError> {
        {
            let mut guilds = self.guilds.write().await;
            let guild = guilds.get_mut(guild_id).ok_or(ApiError::UnknownGuild)?;
            if !guild.member_ids.remove(&user_id) {
                return Err(ApiError::UnknownMember);
            }
            guild.members.remove(user_id);
            guild.unmark_viewer(user_id);
        }
        self.persist_guild(guild_id).await?;
        self.repo.collection(collections::MEMBERS)
            .delete_many(Query::new().eq("guild_id", guild_id.to_string()).eq("user_id", user_id.to_string()))
            .await?;

        let user = self.public_user(user_id).await.ok_or(ApiError::UnknownUser)?;
        self.dispatch_guild(guild_id, &Event::GuildMemberRemove(GuildMemberRemove {
            guild_id,
            user,
        })).await;
        self.dispatcher.dispatch_user(user_id, &Event::GuildDelete(GuildDelete {
            id: guild_id,
            unavailable: false,
        })).await;
        Ok(())
    }

    pub async fn edit_member_nick(
        &self,
        actor: &User,
        guild_id: GuildId,
        user_id: UserId,
        nick: Option<String>,
    ) -> Result<(), ApiError> {
        let member = {
            let mut guilds = self.guilds.write().await;
            let guild = guilds.get_mut(guild_id).ok_or(ApiError::UnknownGuild)?;
            // members rename themselves; the owner renames anyone
            if actor.id != user_id && actor.id != guild.owner_id {
                return Err(ApiError::MissingPermissions);
            }
            let member = guild.members.get_mut(user_id).ok_or(ApiError::UnknownMember)?;
            member.nick = nick;
            member.clone()
        };
        self.repo.collection(collections::MEMBERS)
            .update_one(
                Query::new().eq("guild_id", guild_id.to_string()).eq("user_id", user_id.to_string()),
                json!({"nick": member.nick}),
            )
            .await?;

        let user = self.public_user(user_id).await.ok_or(ApiError::UnknownUser)?;
        self.dispatch_guild(guild_id, &Event::GuildMemberUpdate(GuildMemberUpdate {
            guild_id,
            roles: member.roles.clone(),
            user,
            nick: member.nick.clone(),
        })).await;
        Ok(())
    }

    /// Ban: record the ban, kick the member if present, and clean up the
    /// banned user's recent messages when a day window was supplied.
    pub async fn ban_user(
        &self,
        actor: &User,
        guild_id: GuildId,
        user_id: UserId,
        delete_message_days: Option<u32>,
    ) -> Result<(), ApiError> {
        let was_member = {
            let mut guilds = self.guilds.write().await;
            let guild = guilds.get_mut(guild_id).ok_or(ApiError::UnknownGuild)?;
            if guild.owner_id != actor.id {
                return Err(ApiError::MissingPermissions);
            }
            if !guild.bans.insert(user_id) {
                return Err(ApiError::BadRequest("user already banned".into()));
            }
            guild.is_member(user_id)
        };
        self.persist_guild(guild_id).await?;

        let user = self.public_user(user_id).await.ok_or(ApiError::UnknownUser)?;
        self.dispatch_guild(guild_id, &Event::GuildBanAdd(GuildBan {
            user,
            guild_id,
        })).await;

        if was_member {
            self.remove_member(guild_id, user_id).await?;
        }

        if let Some(days) = delete_message_days {
            self.ban_message_cleanup(guild_id, user_id, days).await?;
        }
        Ok(())
    }

    async fn ban_message_cleanup(&self, guild_id: GuildId, user_id: UserId, days: u32) -> Result<(), ApiError> {
        let cutoff = self.clock.now_millis()
            .saturating_sub(u64::from(days) * 24 * 60 * 60 * 1000);
        let channel_ids: Vec<ChannelId> = self.guild_channels(guild_id).await.iter()
            .filter(|c| matches!(c, Channel::Text(_)))
            .map(Channel::channel_id)
            .collect();

        for channel_id in channel_ids {
            let doomed: Vec<MessageId> = self.messages.read().await.iter()
                .filter(|m| {
                    m.channel_id == channel_id
                        && m.author_id == user_id
                        && (m.id.timestamp().timestamp_millis() as u64) >= cutoff
                })
                .map(|m| m.id)
                .collect();
            if doomed.is_empty() {
                continue;
            }
            self.remove_message_records(&doomed, channel_id).await?;
            self.dispatch_channel(channel_id, &Event::MessageDeleteBulk(MessageDeleteBulk {
                ids: doomed,
                channel_id,
            })).await;
        }
        Ok(())
    }

    pub async fn unban_user(&self, actor: &User, guild_id: GuildId, user_id: UserId) -> Result<(), ApiError> {
        {
            let mut guilds = self.guilds.write().await;
            let guild = guilds.get_mut(guild_id).ok_or(ApiError::UnknownGuild)?;
            if guild.owner_id != actor.id {
                return Err(ApiError::MissingPermissions);
            }
            if !guild.bans.remove(&user_id) {
                return Err(ApiError::BadRequest("user is not banned".into()));
            }
        }
        self.persist_guild(guild_id).await?;

        let user = self.public_user(user_id).await.ok_or(ApiError::UnknownUser)?;
        self.dispatch_guild(guild_id, &Event::GuildBanRemove(GuildBan {
            user,
            guild_id,
        })).await;
        Ok(())
    }

    pub async fn edit_role(
        &self,
        actor: &User,
        guild_id: GuildId,
        role_id: RoleId,
        edit: RoleEdit,
    ) -> Result<Role, ApiError> {
        let role = {
            let mut guilds = self.guilds.write().await;
            let guild = guilds.get_mut(guild_id).ok_or(ApiError::UnknownGuild)?;
            if guild.owner_id != actor.id {
                return Err(ApiError::MissingPermissions);
            }
            let role = guild.roles.get_mut(role_id).ok_or(ApiError::UnknownRole)?;
            role.apply(edit);
            role.clone()
        };
        self.persist_guild(guild_id).await?;

        self.dispatch_guild(guild_id, &Event::GuildRoleUpdate(GuildRoleUpdate {
            guild_id,
            role: role.clone(),
        })).await;
        Ok(role)
    }

    async fn persist_guild(&self, guild_id: GuildId) -> Result<(), ApiError> {
        if let Some(guild) = self.guild(guild_id).await {
            self.repo.collection(collections::GUILDS)
                .replace_one(Query::new().eq("id", guild_id.to_string()), serde_json::to_value(&guild)?)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // invites

    pub async fn create_invite(
        &self,
        inviter: &User,
        channel_id: ChannelId,
        body: InviteCreateBody,
    ) -> Result<InviteView, ApiError> {
        let channel = self.channel(channel_id).await.ok_or(ApiError::UnknownChannel)?;
        self.require_member(channel.guild_id(), inviter.id).await?;

        let expires_at = if body.max_age > 0 {
            Some(self.clock.now() + chrono::Duration::seconds(body.max_age as i64))
        } else {
            None
        };
        let uses = if body.max_uses <= 0 { -1 } else { body.max_uses };

        // retry-on-collision gives us uniqueness at issuance
        let code = {
            let invites = self.invites.read().await;
            let mut code = random_invite_code();
            while invites.contains_key(&code) {
                code = random_invite_code();
            }
            code
        };

        let invite = Invite {
            code: code.clone(),
            channel_id,
            inviter_id: inviter.id,
            expires_at,
            uses,
            temporary: body.temporary,
        };
        self.repo.collection(collections::INVITES)
            .insert_one(serde_json::to_value(&invite)?)
            .await?;
        self.invites.write().await.insert(code, invite.clone());

        self.invite_view(&invite).await.ok_or(ApiError::UnknownChannel)
    }

    pub async fn invite(&self, code: &str) -> Option<Invite> {
        self.invites.read().await.get(code).cloned()
    }

    /// Accept an invite: atomically decrement the remaining uses, then join
    /// the guild.
    pub async fn accept_invite(&self, user: &User, code: &str) -> Result<InviteView, ApiError> {
        let now = self.clock.now();
        let invite = {
            let mut invites = self.invites.write().await;
            let invite = invites.get_mut(code).ok_or(ApiError::UnknownInvite)?;
            if !invite.consume(now) {
                return Err(ApiError::UnknownInvite);
            }
            invite.clone()
        };
        self.repo.collection(collections::INVITES)
            .replace_one(Query::new().eq("code", code), serde_json::to_value(&invite)?)
            .await?;

        let channel = self.channel(invite.channel_id).await.ok_or(ApiError::UnknownInvite)?;
        self.add_member(channel.guild_id(), user).await?;

        self.invite_view(&invite).await.ok_or(ApiError::UnknownInvite)
    }

    pub async fn delete_invite(&self, user: &User, code: &str) -> Result<(), ApiError> {
        let invite = self.invite(code).await.ok_or(ApiError::UnknownInvite)?;
        let channel = self.channel(invite.channel_id).await.ok_or(ApiError::UnknownInvite)?;
        let guild = self.guild(channel.guild_id()).await.ok_or(ApiError::UnknownGuild)?;
        if invite.inviter_id != user.id && guild.owner_id != user.id {
            return Err(ApiError::MissingPermissions);
        }

        self.invites.write().await.remove(code);
        self.repo.collection(collections::INVITES)
            .delete_one(Query::new().eq("code", code))
            .await?;
        Ok(())
    }

    /// Background task: drop expired invites every 30 minutes. Uses the
    /// same clock as invite validation.
    pub async fn invite_janitor(self: Arc<Self>) {
        loop {
            tokio::time::sleep(INVITE_JANITOR_PERIOD).await;

            let now = self.clock.now();
            let expired: Vec<String> = self.invites.read().await.values()
                .filter(|invite| invite.expired(now))
                .map(|invite| invite.code.clone())
                .collect();

            let total = self.invites.read().await.len();
            for code in &expired {
                self.invites.write().await.remove(code);
                if let Err(error) = self.repo.collection(collections::INVITES)
                    .delete_one(Query::new().eq("code", code.clone()))
                    .await
                {
                    log::warn!("[janitor] failed to delete invite {}: {}", code, error);
                }
            }
            log::info!("[janitor] deleted {}/{} invites", expired.len(), total);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::model::presence::{Game, Status};
    use crate::repo::MemoryRepository;

    use super::*;

    async fn state() -> Arc<ChatState> {
        ChatState::load(Arc::new(MemoryRepository::new()), Config::default())
            .await
            .unwrap()
    }

    async fn seed_user(state: &ChatState, id: u64, name: &str) -> User {
        let user = User {
            id: UserId(id),
            username: name.into(),
            discriminator: "0001".into(),
            avatar: None,
            bot: false,
            verified: true,
            email: None,
            password_hash: None,
            password_salt: None,
        };
        state.users.write().await.insert(user.clone());
        user
    }

    #[tokio::test]
    async fn create_guild_then_message_flow() {
        let state = state().await;
        let owner = seed_user(&state, 1, "owner").await;

        let guild_json = state
            .create_guild(&owner, "room".into(), "local".into(), None)
            .await
            .unwrap();
        let guild_id: GuildId = guild_json["id"].as_str().unwrap().parse().unwrap();

        let channels = state.guild_channels(guild_id).await;
        assert_eq!(channels.len(), 1);
        let channel_id = channels[0].channel_id();

        let view = state
            .create_message(&owner, channel_id, MessageCreateBody {
                content: "hello <@1>".into(),
                nonce: None,
                attachments: vec![],
            })
            .await
            .unwrap();
        assert_eq!(view.content, "hello <@1>");
        assert_eq!(view.mentions.len(), 1);

        // last_message_id follows
        let channel = state.channel(channel_id).await.unwrap();
        assert_eq!(channel.text().unwrap().last_message_id, Some(view.id));

        // persisted
        let count = state.repo.collection(collections::MESSAGES).count(Query::all()).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn duplicate_nonce_is_rejected_per_author() {
        let state = state().await;
        let owner = seed_user(&state, 1, "owner").await;
        let other = seed_user(&state, 2, "other").await;

        let guild_json = state.create_guild(&owner, "room".into(), "local".into(), None).await.unwrap();
        let guild_id: GuildId = guild_json["id"].as_str().unwrap().parse().unwrap();
        let channel_id = state.guild_channels(guild_id).await[0].channel_id();
        state.add_member(guild_id, &other).await.unwrap();

        let body = || MessageCreateBody {
            content: "x".into(),
            nonce: Some("a".into()),
            attachments: vec![],
        };
        state.create_message(&owner, channel_id, body()).await.unwrap();
        let err = state.create_message(&owner, channel_id, body()).await.unwrap_err();
        assert!(matches!(err, ApiError::NonceConflict));
        // a different author may reuse the nonce
        state.create_message(&other, channel_id, body()).await.unwrap();
    }

    #[tokio::test]
    async fn message_length_boundaries() {
        let state = state().await;
        let owner = seed_user(&state, 1, "owner").await;
        let guild_json = state.create_guild(&owner, "room".into(), "local".into(), None).await.unwrap();
        let guild_id: GuildId = guild_json["id"].as_str().unwrap().parse().unwrap();
        let channel_id = state.guild_channels(guild_id).await[0].channel_id();

        let at_limit = "x".repeat(MAX_CONTENT_LEN);
        assert!(state.create_message(&owner, channel_id, MessageCreateBody {
            content: at_limit,
            nonce: None,
            attachments: vec![],
        }).await.is_ok());

        let over = "x".repeat(MAX_CONTENT_LEN + 1);
        let err = state.create_message(&owner, channel_id, MessageCreateBody {
            content: over,
            nonce: None,
            attachments: vec![],
        }).await.unwrap_err();
        assert!(matches!(err, ApiError::ContentTooLong));

        let err = state.create_message(&owner, channel_id, MessageCreateBody {
            content: String::new(),
            nonce: None,
            attachments: vec![],
        }).await.unwrap_err();
        assert!(matches!(err, ApiError::EmptyMessage));
    }

    #[tokio::test]
    async fn messages_are_rejected_on_voice_channels() {
        let state = state().await;
        let owner = seed_user(&state, 1, "owner").await;
        let guild_json = state.create_guild(&owner, "room".into(), "local".into(), None).await.unwrap();
        let guild_id: GuildId = guild_json["id"].as_str().unwrap().parse().unwrap();

        let voice = state
            .create_channel(&owner, guild_id, "lounge".into(), ChannelKind::Voice)
            .await
            .unwrap();
        let err = state.create_message(&owner, voice.channel_id(), MessageCreateBody {
            content: "hi".into(),
            nonce: None,
            attachments: vec![],
        }).await.unwrap_err();
        assert!(matches!(err, ApiError::CannotSendInVoice));
    }

    #[tokio::test]
    async fn pin_cap_is_enforced() {
        let state = state().await;
        let owner = seed_user(&state, 1, "owner").await;
        let guild_json = state.create_guild(&owner, "room".into(), "local".into(), None).await.unwrap();
        let guild_id: GuildId = guild_json["id"].as_str().unwrap().parse().unwrap();
        let channel_id = state.guild_channels(guild_id).await[0].channel_id();

        let mut ids = Vec::new();
        for n in 0..=MAX_PINS {
            let view = state.create_message(&owner, channel_id, MessageCreateBody {
                content: format!("m{}", n),
                nonce: None,
                attachments: vec![],
            }).await.unwrap();
            ids.push(view.id);
        }
        for id in ids.iter().take(MAX_PINS) {
            state.pin_message(&owner, channel_id, *id).await.unwrap();
        }
        let err = state.pin_message(&owner, channel_id, ids[MAX_PINS]).await.unwrap_err();
        assert!(matches!(err, ApiError::PinLimit));
    }

    #[tokio::test]
    async fn bulk_delete_refuses_old_messages() {
        let state = state().await;
        let owner = seed_user(&state, 1, "owner").await;
        let guild_json = state.create_guild(&owner, "room".into(), "local".into(), None).await.unwrap();
        let guild_id: GuildId = guild_json["id"].as_str().unwrap().parse().unwrap();
        let channel_id = state.guild_channels(guild_id).await[0].channel_id();

        let fresh = state.create_message(&owner, channel_id, MessageCreateBody {
            content: "new".into(),
            nonce: None,
            attachments: vec![],
        }).await.unwrap();

        // forge an id 15 days in the past
        let old_millis = state.clock.now_millis() - 15 * 24 * 60 * 60 * 1000;
        let old_id = MessageId((old_millis - EPOCH_MILLIS) << COUNTER_BITS);
        state.messages.write().await.insert(Message {
            id: old_id,
            channel_id,
            author_id: owner.id,
            content: "old".into(),
            edited_at: None,
            pinned: false,
            attachments: vec![],
            mentions: vec![],
            nonce: None,
            kind: MessageKind::Default,
        });

        let err = state.bulk_delete(&owner, channel_id, vec![fresh.id, old_id]).await.unwrap_err();
        assert!(matches!(err, ApiError::MessageTooOld));
        // nothing was deleted
        assert!(state.message(fresh.id).await.is_some());
        assert!(state.message(old_id).await.is_some());

        state.bulk_delete(&owner, channel_id, vec![fresh.id]).await.unwrap();
        assert!(state.message(fresh.id).await.is_none());
    }

    #[tokio::test]
    async fn invites_join_members_and_run_out() {
        let state = state().await;
        let owner = seed_user(&state, 1, "owner").await;
        let joiner = seed_user(&state, 2, "joiner").await;
        let third = seed_user(&state, 3, "third").await;

        let guild_json = state.create_guild(&owner, "room".into(), "local".into(), None).await.unwrap();
        let guild_id: GuildId = guild_json["id"].as_str().unwrap().parse().unwrap();
        let channel_id = state.guild_channels(guild_id).await[0].channel_id();

        let invite = state.create_invite(&owner, channel_id, InviteCreateBody {
            max_age: 0,
            max_uses: 1,
            temporary: false,
        }).await.unwrap();

        state.accept_invite(&joiner, &invite.code).await.unwrap();
        assert!(state.guild(guild_id).await.unwrap().is_member(joiner.id));

        // single use is spent
        let err = state.accept_invite(&third, &invite.code).await.unwrap_err();
        assert!(matches!(err, ApiError::UnknownInvite));
    }

    #[tokio::test]
    async fn banned_user_cannot_rejoin() {
        let state = state().await;
        let owner = seed_user(&state, 1, "owner").await;
        let target = seed_user(&state, 2, "target").await;

        let guild_json = state.create_guild(&owner, "room".into(), "local".into(), None).await.unwrap();
        let guild_id: GuildId = guild_json["id"].as_str().unwrap().parse().unwrap();
        state.add_member(guild_id, &target).await.unwrap();

        state.ban_user(&owner, guild_id, target.id, None).await.unwrap();
        let guild = state.guild(guild_id).await.unwrap();
        assert!(!guild.is_member(target.id));
        assert!(guild.bans.contains(&target.id));

        let err = state.add_member(guild_id, &target).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));

        state.unban_user(&owner, guild_id, target.id).await.unwrap();
        state.add_member(guild_id, &target).await.unwrap();
    }

    #[tokio::test]
    async fn ban_cleanup_deletes_recent_messages_only() {
        let state = state().await;
        let owner = seed_user(&state, 1, "owner").await;
        let target = seed_user(&state, 2, "target").await;

        let guild_json = state.create_guild(&owner, "room".into(), "local".into(), None).await.unwrap();
        let guild_id: GuildId = guild_json["id"].as_str().unwrap().parse().unwrap();
        let channel_id = state.guild_channels(guild_id).await[0].channel_id();
        state.add_member(guild_id, &target).await.unwrap();

        let recent = state.create_message(&target, channel_id, MessageCreateBody {
            content: "recent".into(),
            nonce: None,
            attachments: vec![],
        }).await.unwrap();

        // a message 3 days old survives a 1-day cleanup window
        let old_millis = state.clock.now_millis() - 3 * 24 * 60 * 60 * 1000;
        let old_id = MessageId((old_millis - EPOCH_MILLIS) << COUNTER_BITS);
        state.messages.write().await.insert(Message {
            id: old_id,
            channel_id,
            author_id: target.id,
            content: "old".into(),
            edited_at: None,
            pinned: false,
            attachments: vec![],
            mentions: vec![],
            nonce: None,
            kind: MessageKind::Default,
        });

        state.ban_user(&owner, guild_id, target.id, Some(1)).await.unwrap();
        assert!(state.message(recent.id).await.is_none());
        assert!(state.message(old_id).await.is_some());
    }

    #[tokio::test]
    async fn presence_merge_rule_is_most_recent_wins() {
        let state = state().await;
        let user = seed_user(&state, 1, "u").await;

        state.presence_global_update(user.id, PresenceUpdateRequest {
            status: None,
            game: Some(Game { name: Some("chess".into()), kind: 0, url: None }),
        }).await;
        state.presence_global_update(user.id, PresenceUpdateRequest {
            status: Some(Status::Idle),
            game: None,
        }).await;

        let presence = state.presences.get(user.id).await;
        assert_eq!(presence.status, Status::Idle);
        assert_eq!(presence.game.name.as_deref(), Some("chess"));
    }

    #[tokio::test]
    async fn channel_history_anchors() {
        let state = state().await;
        let owner = seed_user(&state, 1, "owner").await;
        let guild_json = state.create_guild(&owner, "room".into(), "local".into(), None).await.unwrap();
        let guild_id: GuildId = guild_json["id"].as_str().unwrap().parse().unwrap();
        let channel_id = state.guild_channels(guild_id).await[0].channel_id();

        let mut ids = Vec::new();
        for n in 0..10 {
            let view = state.create_message(&owner, channel_id, MessageCreateBody {
                content: format!("m{}", n),
                nonce: None,
                attachments: vec![],
            }).await.unwrap();
            ids.push(view.id);
        }

        let newest = state.channel_messages(channel_id, 3, None, None, None).await;
        assert_eq!(newest.len(), 3);
        assert_eq!(newest[0].id, ids[9]);

        let before = state.channel_messages(channel_id, 50, Some(ids[5]), None, None).await;
        assert!(before.iter().all(|m| m.id < ids[5]));
        assert_eq!(before.len(), 5);

        let after = state.channel_messages(channel_id, 50, None, Some(ids[5]), None).await;
        assert!(after.iter().all(|m| m.id > ids[5]));
        assert_eq!(after.len(), 4);
    }
}
