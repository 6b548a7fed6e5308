//! Shared test utilities

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use serenity::model::permissions::Permissions;

use plural_proxy::cache::{EntityCache, EntityKind};
use plural_proxy::db::member::NewMember;
use plural_proxy::db::{
    self, Account, AccountConfig, AccountRepo, Group, GroupRepo, Member, MemberRepo, ProxyTag,
    Userproxy,
};
use plural_proxy::discord::{
    Auth, DiscordApi, DiscordApiError, Emoji, FileUpload, Message, MessagePayload, Snowflake,
    User, Webhook,
};
use plural_proxy::dispatch::{DispatchOptions, Dispatcher};
use plural_proxy::{DbPool, Error, Result};

pub const APP_ID: Snowflake = Snowflake(1000);
pub const GUILD: Snowflake = Snowflake(30);
pub const CHANNEL: Snowflake = Snowflake(20);
pub const AUTHOR: Snowflake = Snowflake(40);
pub const USERPROXY_BOT: Snowflake = Snowflake(777);

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// A Discord API error with the given status
#[must_use]
pub fn api_error(status: u16) -> Error {
    Error::Discord(DiscordApiError {
        status,
        code: 0,
        message: format!("mock {status}"),
        retry_after: None,
    })
}

/// A REST call seen by [`MockDiscord`]
#[derive(Debug, Clone)]
pub enum Call {
    CreateMessage {
        channel: Snowflake,
        dedicated: bool,
        payload: MessagePayload,
    },
    DeleteMessage {
        channel: Snowflake,
        message: Snowflake,
        dedicated: bool,
    },
    ExecuteWebhook {
        webhook: Snowflake,
        thread: Option<Snowflake>,
        payload: MessagePayload,
    },
    DeleteWebhookMessage {
        webhook: Snowflake,
        message: Snowflake,
    },
    ListWebhooks(Snowflake),
    CreateWebhook {
        channel: Snowflake,
        name: String,
    },
    CreateEmoji(String),
    DeleteEmoji(Snowflake),
    GetMember(Snowflake),
    Download(String),
}

/// In-memory Discord with failure switches
pub struct MockDiscord {
    next_id: AtomicU64,
    calls: Mutex<Vec<Call>>,
    webhooks: Mutex<Vec<Webhook>>,
    pub fail_delete: AtomicBool,
    pub fail_webhook_post: AtomicBool,
    pub fail_dedicated_post: AtomicBool,
    pub forbid_webhook_delete: AtomicBool,
    pub fail_list_webhooks: AtomicBool,
    pub emoji_created: AtomicUsize,
    pub emoji_deleted: AtomicUsize,
}

impl Default for MockDiscord {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(5000),
            calls: Mutex::new(Vec::new()),
            webhooks: Mutex::new(Vec::new()),
            fail_delete: AtomicBool::new(false),
            fail_webhook_post: AtomicBool::new(false),
            fail_dedicated_post: AtomicBool::new(false),
            forbid_webhook_delete: AtomicBool::new(false),
            fail_list_webhooks: AtomicBool::new(false),
            emoji_created: AtomicUsize::new(0),
            emoji_deleted: AtomicUsize::new(0),
        }
    }
}

impl MockDiscord {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_id(&self) -> Snowflake {
        Snowflake(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn posted(&self, channel: Snowflake, payload: &MessagePayload) -> Message {
        Message {
            id: self.next_id(),
            channel_id: channel,
            content: payload.content.clone(),
            ..Message::default()
        }
    }

    /// Payloads posted through webhooks
    pub fn webhook_posts(&self) -> Vec<MessagePayload> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::ExecuteWebhook { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }

    /// Payloads posted with `create_message`, with whether a dedicated bot sent them
    pub fn created_messages(&self) -> Vec<(bool, MessagePayload)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::CreateMessage {
                    dedicated, payload, ..
                } => Some((dedicated, payload)),
                _ => None,
            })
            .collect()
    }

    /// Messages deleted with `delete_message`
    pub fn deleted_messages(&self) -> Vec<Snowflake> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::DeleteMessage { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl DiscordApi for MockDiscord {
    fn application_id(&self) -> Snowflake {
        APP_ID
    }

    async fn create_message(
        &self,
        auth: Auth<'_>,
        channel_id: Snowflake,
        payload: &MessagePayload,
        _files: &[FileUpload],
    ) -> Result<Message> {
        let dedicated = matches!(auth, Auth::Dedicated { .. });
        self.record(Call::CreateMessage {
            channel: channel_id,
            dedicated,
            payload: payload.clone(),
        });

        if dedicated && self.fail_dedicated_post.load(Ordering::SeqCst) {
            return Err(api_error(500));
        }
        Ok(self.posted(channel_id, payload))
    }

    async fn delete_message(
        &self,
        auth: Auth<'_>,
        channel_id: Snowflake,
        message_id: Snowflake,
        _reason: Option<&str>,
    ) -> Result<()> {
        self.record(Call::DeleteMessage {
            channel: channel_id,
            message: message_id,
            dedicated: matches!(auth, Auth::Dedicated { .. }),
        });

        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(api_error(403));
        }
        Ok(())
    }

    async fn execute_webhook(
        &self,
        webhook: &Webhook,
        thread_id: Option<Snowflake>,
        payload: &MessagePayload,
        _files: &[FileUpload],
    ) -> Result<Message> {
        self.record(Call::ExecuteWebhook {
            webhook: webhook.id,
            thread: thread_id,
            payload: payload.clone(),
        });

        if self.fail_webhook_post.load(Ordering::SeqCst) {
            return Err(api_error(500));
        }
        let mut message = self.posted(webhook.channel_id.unwrap_or_default(), payload);
        message.webhook_id = Some(webhook.id);
        Ok(message)
    }

    async fn delete_webhook_message(
        &self,
        webhook: &Webhook,
        message_id: Snowflake,
        _thread_id: Option<Snowflake>,
    ) -> Result<()> {
        self.record(Call::DeleteWebhookMessage {
            webhook: webhook.id,
            message: message_id,
        });

        if self.forbid_webhook_delete.load(Ordering::SeqCst) {
            return Err(api_error(403));
        }
        Ok(())
    }

    async fn list_webhooks(&self, channel_id: Snowflake) -> Result<Vec<Webhook>> {
        self.record(Call::ListWebhooks(channel_id));
        if self.fail_list_webhooks.load(Ordering::SeqCst) {
            return Err(api_error(502));
        }
        Ok(self
            .webhooks
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.channel_id == Some(channel_id))
            .cloned()
            .collect())
    }

    async fn create_webhook(&self, channel_id: Snowflake, name: &str) -> Result<Webhook> {
        self.record(Call::CreateWebhook {
            channel: channel_id,
            name: name.to_string(),
        });

        let webhook = Webhook {
            id: self.next_id(),
            token: Some("webhook-token".to_string()),
            name: Some(name.to_string()),
            application_id: Some(APP_ID),
            channel_id: Some(channel_id),
        };
        self.webhooks.lock().unwrap().push(webhook.clone());
        Ok(webhook)
    }

    async fn create_application_emoji(
        &self,
        _auth: Auth<'_>,
        name: &str,
        _image: &str,
    ) -> Result<Emoji> {
        self.record(Call::CreateEmoji(name.to_string()));
        self.emoji_created.fetch_add(1, Ordering::SeqCst);
        Ok(Emoji {
            id: self.next_id(),
            name: name.to_string(),
            animated: false,
        })
    }

    async fn delete_application_emoji(&self, _auth: Auth<'_>, emoji_id: Snowflake) -> Result<()> {
        self.record(Call::DeleteEmoji(emoji_id));
        self.emoji_deleted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_guild_member(
        &self,
        _guild_id: Snowflake,
        user_id: Snowflake,
    ) -> Result<serde_json::Value> {
        self.record(Call::GetMember(user_id));
        Ok(json!({"user": {"id": user_id.to_string(), "username": "bot", "bot": true}, "roles": []}))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        self.record(Call::Download(url.to_string()));
        Ok(vec![0x89, b'P', b'N', b'G'])
    }
}

/// Permissions the worker needs, granted to `@everyone`
#[must_use]
pub fn proxy_permissions() -> Permissions {
    Permissions::VIEW_CHANNEL
        | Permissions::SEND_MESSAGES
        | Permissions::MANAGE_MESSAGES
        | Permissions::MANAGE_WEBHOOKS
}

/// Cache a guild, its `@everyone` role, a text channel and the worker's member
pub fn seed_guild(cache: &EntityCache, everyone: Permissions) {
    cache
        .put(EntityKind::Guild, &GUILD.to_string(), None, &json!({"id": GUILD.to_string(), "owner_id": "1"}), None)
        .unwrap();
    cache
        .put(
            EntityKind::Role,
            &GUILD.to_string(),
            Some(GUILD),
            &json!({"id": GUILD.to_string(), "permissions": everyone.bits().to_string()}),
            None,
        )
        .unwrap();
    cache
        .put(
            EntityKind::Channel,
            &CHANNEL.to_string(),
            Some(GUILD),
            &json!({"id": CHANNEL.to_string(), "type": 0, "guild_id": GUILD.to_string(), "last_message_id": "10"}),
            None,
        )
        .unwrap();
    cache
        .put(
            EntityKind::Member,
            &EntityCache::member_key(GUILD, APP_ID),
            Some(GUILD),
            &json!({"user": {"id": APP_ID.to_string(), "username": "plural", "bot": true}, "roles": []}),
            None,
        )
        .unwrap();
}

/// A registered account with one group and two personas
pub struct Fixture {
    pub pool: DbPool,
    pub cache: EntityCache,
    pub api: Arc<MockDiscord>,
    pub dispatcher: Arc<Dispatcher>,
    pub account: Account,
    pub group: Group,
    /// Tag `s;`
    pub p1: Member,
    /// Tag `u;`, with a dedicated bot in the guild
    pub p2: Member,
}

/// Build a dispatcher over a seeded store and a fresh mock
#[must_use]
pub fn fixture() -> Fixture {
    let pool = setup_test_db();
    let cache = EntityCache::new(pool.clone());
    seed_guild(&cache, proxy_permissions());

    let account = AccountRepo::new(pool.clone())
        .create(AccountConfig::default(), &[AUTHOR])
        .unwrap();
    let group = GroupRepo::new(pool.clone())
        .create(&account.id, "main", None, &[])
        .unwrap();

    let members = MemberRepo::new(pool.clone());
    let p1 = members
        .create(
            &group.id,
            NewMember {
                name: "P1".into(),
                proxy_tags: vec![ProxyTag::new("s;", "")],
                ..NewMember::default()
            },
        )
        .unwrap();
    let p2 = members
        .create(
            &group.id,
            NewMember {
                name: "P2".into(),
                proxy_tags: vec![ProxyTag::new("u;", "")],
                userproxy: Some(Userproxy {
                    bot_id: USERPROXY_BOT,
                    token: "userproxy-token".into(),
                    public_key: String::new(),
                    guilds: HashSet::from([GUILD]),
                }),
                ..NewMember::default()
            },
        )
        .unwrap();

    let api = MockDiscord::new();
    let dispatcher = Arc::new(Dispatcher::new(
        api.clone(),
        &pool,
        cache.clone(),
        &DispatchOptions::default(),
    ));

    Fixture {
        pool,
        cache,
        api,
        dispatcher,
        account,
        group,
        p1,
        p2,
    }
}

/// A guild message from [`AUTHOR`] in [`CHANNEL`]
#[must_use]
pub fn message(id: u64, content: &str) -> Message {
    Message {
        id: Snowflake(id),
        channel_id: CHANNEL,
        guild_id: Some(GUILD),
        author: Some(User {
            id: AUTHOR,
            username: "alice".into(),
            ..User::default()
        }),
        content: content.to_string(),
        kind: Some(0),
        ..Message::default()
    }
}
