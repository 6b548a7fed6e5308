//! Persona resolution for a message event
//!
//! Resolution order: reproxy override, locked autoproxy, recently used
//! personas, every other visible persona, then the latch/front autoproxy
//! persona. Every decision is appended to the event's debug trace.

use std::collections::{HashMap, HashSet};

use crate::cache::EntityCache;
use crate::db::{
    Account, AccountRepo, Autoproxy, AutoproxyMode, AutoproxyRepo, DbPool, DebugTrace, Group,
    GroupRepo, LedgerRepo, Member, MemberRepo,
};
use crate::discord::{Message, Snowflake};
use crate::Result;

use super::{ResolvedProxy, TagMatch, TagMatcher};

/// Reason recorded for reproxy overrides
pub const REPROXY_REASON: &str = "Reproxy command";

/// Chooses the persona for a message
pub struct Resolver {
    accounts: AccountRepo,
    groups: GroupRepo,
    members: MemberRepo,
    autoproxies: AutoproxyRepo,
    ledger: LedgerRepo,
    cache: EntityCache,
    matcher: TagMatcher,
}

/// Autoproxy records in scope for one event
struct Scope {
    guild_id: Snowflake,
    guild: Option<Autoproxy>,
    global: Option<Autoproxy>,
    /// Record currently in effect; may fall back from guild to global
    active: Option<Autoproxy>,
    /// Autoproxy personas seen while matching, keyed by record scope
    seen: HashMap<Option<Snowflake>, Member>,
}

impl Scope {
    fn note_seen(&mut self, member: &Member) {
        for record in [&self.guild, &self.global].into_iter().flatten() {
            if record.member_id.as_deref() == Some(member.id.as_str()) {
                self.seen.insert(record.guild_id, member.clone());
            }
        }
    }

    fn fall_back_to_global(&mut self) {
        self.active.clone_from(&self.global);
    }

    fn active_is_guild(&self) -> bool {
        self.active.as_ref().is_some_and(Autoproxy::is_guild)
    }
}

impl Resolver {
    /// Create a resolver over the shared store
    #[must_use]
    pub fn new(pool: &DbPool, cache: EntityCache, matcher: TagMatcher) -> Self {
        Self {
            accounts: AccountRepo::new(pool.clone()),
            groups: GroupRepo::new(pool.clone()),
            members: MemberRepo::new(pool.clone()),
            autoproxies: AutoproxyRepo::new(pool.clone()),
            ledger: LedgerRepo::new(pool.clone()),
            cache,
            matcher,
        }
    }

    /// Resolve the persona for a message, applying autoproxy escapes and latching
    ///
    /// # Errors
    ///
    /// Returns error if a store read or write fails
    pub fn resolve(&self, message: &Message, trace: &mut DebugTrace) -> Result<Option<ResolvedProxy>> {
        let Some(mut proxy) = self.select(message, trace)? else {
            return Ok(None);
        };

        if let Some(autoproxy) = proxy.autoproxy.as_mut() {
            if message.content.starts_with('\\') {
                if message.content.starts_with("\\\\") {
                    self.autoproxies
                        .set_member(&autoproxy.account_id, autoproxy.guild_id, None)?;
                    autoproxy.member_id = None;
                }

                trace.push("Message starts with backslash, skipping proxy.");
                return Ok(None);
            }

            if autoproxy.mode == AutoproxyMode::Latch
                && autoproxy.member_id.as_deref() != Some(proxy.member.id.as_str())
            {
                self.autoproxies.set_member(
                    &autoproxy.account_id,
                    autoproxy.guild_id,
                    Some(&proxy.member.id),
                )?;
                autoproxy.member_id = Some(proxy.member.id.clone());
            }
        }

        Ok(Some(proxy))
    }

    /// Pick a persona without side effects on autoproxy state, except auto-creation
    #[allow(clippy::too_many_lines)]
    fn select(&self, message: &Message, trace: &mut DebugTrace) -> Result<Option<ResolvedProxy>> {
        let (Some(author), Some(guild_id)) = (message.author.as_ref(), message.guild_id) else {
            return Ok(None);
        };

        let Some(account) = self.accounts.find_by_user(author.id)? else {
            trace.push("User has not registered with /plu/ral.");
            return Ok(None);
        };

        let records = self.autoproxies.for_guild(&account.id, guild_id)?;
        let guild = records.iter().find(|r| r.guild_id == Some(guild_id)).cloned();
        let global = records.iter().find(|r| r.guild_id.is_none()).cloned();
        let mut scope = Scope {
            guild_id,
            active: guild.clone().or_else(|| global.clone()),
            guild,
            global,
            seen: HashMap::new(),
        };

        if let Some(active) = &scope.active {
            if active.mode == AutoproxyMode::Off {
                trace.push("Autoproxy mode is \"disabled\". All proxying is disabled.");
                return Ok(None);
            }

            let scope_name = if active.is_guild() { "Server" } else { "Global" };
            let target = match active.member_id.as_deref() {
                Some(id) => self.members.find(id)?,
                None => None,
            };
            trace.push(match target {
                Some(member) => format!("{scope_name} Autoproxy found for {}", member.name),
                None => format!("{scope_name} Autoproxy found with no member"),
            });
        } else {
            trace.push("No autoproxy found");
        }

        if let Some(member_id) = message.reproxy_member.as_deref() {
            trace.push("Reproxy command used.");
            if let Some(proxy) = self.reproxy(message, &account, member_id, &scope)? {
                return Ok(Some(proxy));
            }
            trace.push("Reproxy member not found.");
        }

        let groups = self.groups.visible_to(&account.id, author.id)?;
        if groups.is_empty() {
            trace.push("No groups found for account.");
            return Ok(None);
        }

        let stack: Vec<Snowflake> = self.cache.channel_stack(message.channel_id)?;
        let channel_stack: HashSet<Snowflake> = stack.iter().copied().collect();

        if let Some(proxy) = self.locked(message, &account, &groups, &channel_stack, &scope, trace)? {
            return Ok(Some(proxy));
        }

        let has_attachments = !message.attachments.is_empty();
        let recent = self.members.find_many(&self.ledger.recent(author.id)?)?;

        for member in &recent {
            scope.note_seen(member);

            let Some(matched) =
                self.matcher
                    .check_member(&member.proxy_tags, &message.content, has_attachments, trace)
            else {
                continue;
            };

            let Some(group) = group_of(&groups, member) else {
                trace.push(format!(
                    "Member `{}` not in any group. This should not happen.",
                    member.name
                ));
                continue;
            };

            if !group.admits(&channel_stack) {
                if scope.active_is_guild() && scope.global.is_some() {
                    trace.push(
                        "Autoproxy member restricted to other channels. Falling back to global autoproxy.",
                    );
                    scope.fall_back_to_global();
                }
                continue;
            }

            self.auto_create(&account, group, member, &mut scope, trace)?;
            return Ok(Some(tagged(account, member, group, matched, scope.active)));
        }

        let recent_ids: HashSet<&str> = recent.iter().map(|m| m.id.as_str()).collect();

        for group in &groups {
            if !group.admits(&channel_stack) {
                if !trace.has_prefix("Channel Stack: ") {
                    trace.push(format!("Channel Stack: {}", format_stack(&stack)));
                }
                trace.push(format!("Group `{}` is restricted to other channels.", group.name));

                let target_in_group = scope
                    .active
                    .as_ref()
                    .and_then(|a| a.member_id.as_ref())
                    .is_some_and(|id| group.members.contains(id));
                if scope.active_is_guild() && scope.global.is_some() && target_in_group {
                    trace.push(
                        "Server autoproxy member restricted to other channels. Falling back to global autoproxy.",
                    );
                    scope.fall_back_to_global();
                }
                continue;
            }

            if group.members.iter().all(|id| recent_ids.contains(id.as_str())) {
                continue;
            }

            for member in self
                .members
                .list_by_group(&group.id)?
                .into_iter()
                .filter(|m| !recent_ids.contains(m.id.as_str()))
            {
                scope.note_seen(&member);

                if let Some(matched) = self.matcher.check_member(
                    &member.proxy_tags,
                    &message.content,
                    has_attachments,
                    trace,
                ) {
                    self.auto_create(&account, group, &member, &mut scope, trace)?;
                    return Ok(Some(tagged(account, &member, group, matched, scope.active)));
                }
            }
        }

        Ok(Self::fallback(message, account, &groups, &channel_stack, scope, trace))
    }

    fn reproxy(
        &self,
        message: &Message,
        account: &Account,
        member_id: &str,
        scope: &Scope,
    ) -> Result<Option<ResolvedProxy>> {
        let Some(member) = self.members.find(member_id)? else {
            return Ok(None);
        };
        let Some(group) = self.groups.find(&member.group_id)? else {
            return Ok(None);
        };

        let tag_index = message
            .reproxy_tag
            .filter(|index| *index < member.proxy_tags.len());

        Ok(Some(ResolvedProxy {
            account: account.clone(),
            member,
            group,
            content: message.content.clone(),
            reason: REPROXY_REASON.to_string(),
            tag_index,
            autoproxy: scope.active.clone(),
        }))
    }

    fn locked(
        &self,
        message: &Message,
        account: &Account,
        groups: &[Group],
        channel_stack: &HashSet<Snowflake>,
        scope: &Scope,
        trace: &mut DebugTrace,
    ) -> Result<Option<ResolvedProxy>> {
        let Some(active) = scope.active.as_ref().filter(|a| a.mode == AutoproxyMode::Locked) else {
            return Ok(None);
        };
        let Some(member_id) = active.member_id.as_deref() else {
            return Ok(None);
        };
        let Some(member) = self.members.find(member_id)? else {
            return Ok(None);
        };

        let Some(group) = group_of(groups, &member) else {
            trace.push(format!(
                "Member `{}` not in any group. This should not happen.",
                member.name
            ));
            return Ok(None);
        };

        if !group.admits(channel_stack) {
            return Ok(None);
        }

        Ok(Some(ResolvedProxy {
            account: account.clone(),
            member,
            group: group.clone(),
            content: message.content.clone(),
            reason: "Locked autoproxy".to_string(),
            tag_index: None,
            autoproxy: Some(active.clone()),
        }))
    }

    /// A restricted group's persona matched while only a global autoproxy for
    /// someone else exists: pin this guild to the matched persona
    fn auto_create(
        &self,
        account: &Account,
        group: &Group,
        member: &Member,
        scope: &mut Scope,
        trace: &mut DebugTrace,
    ) -> Result<()> {
        let Some(active) = scope.active.as_ref() else {
            return Ok(());
        };

        if !group.is_restricted()
            || active.is_guild()
            || active.member_id.as_deref() == Some(member.id.as_str())
            || scope.guild.is_some()
        {
            return Ok(());
        }

        trace.push(
            "Matched member in restricted group and different from autoproxy. Auto-creating server autoproxy.",
        );

        let created = Autoproxy {
            account_id: account.id.clone(),
            guild_id: Some(scope.guild_id),
            mode: AutoproxyMode::Latch,
            member_id: Some(member.id.clone()),
            expires_at: None,
        };
        self.autoproxies.upsert(&created)?;
        tracing::debug!(account = %account.id, guild = %scope.guild_id, "auto-created server autoproxy");

        scope.guild = Some(created.clone());
        scope.active = Some(created);
        Ok(())
    }

    fn fallback(
        message: &Message,
        account: Account,
        groups: &[Group],
        channel_stack: &HashSet<Snowflake>,
        mut scope: Scope,
        trace: &mut DebugTrace,
    ) -> Option<ResolvedProxy> {
        let active = scope.active.take();

        if let Some(active) = active
            .as_ref()
            .filter(|a| matches!(a.mode, AutoproxyMode::Latch | AutoproxyMode::Front))
            && let Some(member) = scope.seen.remove(&active.guild_id)
        {
            match group_of(groups, &member) {
                None => trace.push(format!(
                    "Member `{}` not in any group. This should not happen.",
                    member.name
                )),
                Some(group) if group.admits(channel_stack) => {
                    let scope_name = if active.is_guild() { "Server" } else { "Global" };
                    return Some(ResolvedProxy {
                        account,
                        group: group.clone(),
                        member,
                        content: message.content.clone(),
                        reason: format!("{scope_name} Autoproxy"),
                        tag_index: None,
                        autoproxy: Some(active.clone()),
                    });
                }
                Some(_) => {}
            }
        }

        if active.as_ref().and_then(|a| a.member_id.as_ref()).is_none() {
            trace.push("No proxy tags found in message.");
        } else {
            trace.push("Autoproxy is enabled but member not found.");
        }

        None
    }
}

fn group_of<'a>(groups: &'a [Group], member: &Member) -> Option<&'a Group> {
    groups.iter().find(|g| g.members.contains(&member.id))
}

fn tagged(
    account: Account,
    member: &Member,
    group: &Group,
    matched: TagMatch,
    autoproxy: Option<Autoproxy>,
) -> ResolvedProxy {
    ResolvedProxy {
        account,
        member: member.clone(),
        group: group.clone(),
        content: matched.content,
        reason: matched.reason,
        tag_index: Some(matched.index),
        autoproxy,
    }
}

fn format_stack(stack: &[Snowflake]) -> String {
    let ids: Vec<String> = stack.iter().map(ToString::to_string).collect();
    format!("{{{}}}", ids.join(", "))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::EntityKind;
    use crate::db::member::NewMember;
    use crate::db::{AccountConfig, ProxyTag, init_memory};
    use serde_json::json;

    const AUTHOR: Snowflake = Snowflake(40);
    const GUILD: Snowflake = Snowflake(30);
    const CHANNEL: Snowflake = Snowflake(20);

    struct Fixture {
        pool: DbPool,
        resolver: Resolver,
        account: Account,
        group: Group,
        p1: Member,
        p2: Member,
    }

    fn fixture() -> Fixture {
        let pool = init_memory().unwrap();
        let cache = EntityCache::new(pool.clone());
        cache
            .put(EntityKind::Channel, "20", Some(GUILD), &json!({"id": "20", "type": 0, "parent_id": "19"}), None)
            .unwrap();

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
                    proxy_tags: vec![ProxyTag::new("", "-p2")],
                    ..NewMember::default()
                },
            )
            .unwrap();

        let resolver = Resolver::new(&pool, cache, TagMatcher::new(Duration::from_millis(50)));
        Fixture {
            pool,
            resolver,
            account,
            group,
            p1,
            p2,
        }
    }

    fn message(content: &str) -> Message {
        serde_json::from_value(json!({
            "id": "10",
            "channel_id": CHANNEL.to_string(),
            "guild_id": GUILD.to_string(),
            "type": 0,
            "content": content,
            "author": {"id": AUTHOR.to_string(), "username": "alice"}
        }))
        .unwrap()
    }

    fn set_autoproxy(f: &Fixture, guild: Option<Snowflake>, mode: AutoproxyMode, member: Option<&Member>) {
        AutoproxyRepo::new(f.pool.clone())
            .upsert(&Autoproxy {
                account_id: f.account.id.clone(),
                guild_id: guild,
                mode,
                member_id: member.map(|m| m.id.clone()),
                expires_at: None,
            })
            .unwrap();
    }

    fn resolve(f: &Fixture, content: &str) -> (Option<ResolvedProxy>, DebugTrace) {
        let mut trace = DebugTrace::new();
        let result = f.resolver.resolve(&message(content), &mut trace).unwrap();
        (result, trace)
    }

    #[test]
    fn unregistered_author() {
        let f = fixture();
        let mut msg = message("s;hi");
        msg.author.as_mut().unwrap().id = Snowflake(1);
        let mut trace = DebugTrace::new();

        assert!(f.resolver.resolve(&msg, &mut trace).unwrap().is_none());
        assert!(trace.has_prefix("User has not registered"));
    }

    #[test]
    fn tag_match() {
        let f = fixture();
        let (result, trace) = resolve(&f, "s;hello");
        let result = result.unwrap();

        assert_eq!(result.member.id, f.p1.id);
        assert_eq!(result.group.id, f.group.id);
        assert_eq!(result.content, "hello");
        assert!(result.reason.contains("`s;`"));
        assert_eq!(result.tag_index, Some(0));
        assert!(trace.has_prefix("No autoproxy found"));
    }

    #[test]
    fn no_match_without_autoproxy() {
        let f = fixture();
        let (result, trace) = resolve(&f, "just talking");
        assert!(result.is_none());
        assert!(trace.has_prefix("No proxy tags found"));
    }

    #[test]
    fn mention_before_tag_falls_to_autoproxy() {
        let f = fixture();
        set_autoproxy(&f, None, AutoproxyMode::Front, Some(&f.p2));

        let result = resolve(&f, "<@123> s;hi").0.unwrap();
        assert_eq!(result.member.id, f.p2.id);
        assert_eq!(result.reason, "Global Autoproxy");
        assert_eq!(result.content, "<@123> s;hi");
    }

    #[test]
    fn off_disables_everything() {
        let f = fixture();
        set_autoproxy(&f, Some(GUILD), AutoproxyMode::Off, None);

        let (result, trace) = resolve(&f, "s;hello");
        assert!(result.is_none());
        assert!(trace.mentions("All proxying is disabled"));
    }

    #[test]
    fn latch_remembers_matched_persona() {
        let f = fixture();
        set_autoproxy(&f, Some(GUILD), AutoproxyMode::Latch, Some(&f.p2));

        let result = resolve(&f, "plain").0.unwrap();
        assert_eq!(result.member.id, f.p2.id);
        assert_eq!(result.reason, "Server Autoproxy");

        let result = resolve(&f, "s;switch").0.unwrap();
        assert_eq!(result.member.id, f.p1.id);
        assert_eq!(
            result.autoproxy.unwrap().member_id.as_deref(),
            Some(f.p1.id.as_str())
        );

        let result = resolve(&f, "plain again").0.unwrap();
        assert_eq!(result.member.id, f.p1.id);
        assert_eq!(result.reason, "Server Autoproxy");
    }

    #[test]
    fn front_does_not_latch() {
        let f = fixture();
        set_autoproxy(&f, None, AutoproxyMode::Front, Some(&f.p2));

        resolve(&f, "s;tagged").0.unwrap();
        let result = resolve(&f, "plain").0.unwrap();
        assert_eq!(result.member.id, f.p2.id);
    }

    #[test]
    fn locked_ignores_tags() {
        let f = fixture();
        set_autoproxy(&f, None, AutoproxyMode::Locked, Some(&f.p2));

        let result = resolve(&f, "s;hello").0.unwrap();
        assert_eq!(result.member.id, f.p2.id);
        assert_eq!(result.reason, "Locked autoproxy");
        assert_eq!(result.content, "s;hello");
    }

    #[test]
    fn backslash_escapes() {
        let f = fixture();
        set_autoproxy(&f, None, AutoproxyMode::Front, Some(&f.p2));

        let (result, trace) = resolve(&f, "\\not proxied");
        assert!(result.is_none());
        assert!(trace.has_prefix("Message starts with backslash"));
        assert!(resolve(&f, "plain").0.is_some());

        assert!(resolve(&f, "\\\\reset").0.is_none());
        let (result, trace) = resolve(&f, "plain");
        assert!(result.is_none());
        assert!(trace.mentions("Global Autoproxy found with no member"));
    }

    #[test]
    fn reproxy_override() {
        let f = fixture();
        let mut msg = message("anything");
        msg.reproxy_member = Some(f.p2.id.clone());
        msg.reproxy_tag = Some(0);
        let mut trace = DebugTrace::new();

        let result = f.resolver.resolve(&msg, &mut trace).unwrap().unwrap();
        assert_eq!(result.member.id, f.p2.id);
        assert_eq!(result.reason, REPROXY_REASON);
        assert_eq!(result.tag_index, Some(0));
        assert_eq!(result.content, "anything");
    }

    #[test]
    fn recent_personas_checked_first() {
        let f = fixture();
        let members = MemberRepo::new(f.pool.clone());
        let shadow = members
            .create(
                &f.group.id,
                NewMember {
                    name: "Shadow".into(),
                    proxy_tags: vec![ProxyTag::new("s;", "")],
                    ..NewMember::default()
                },
            )
            .unwrap();
        LedgerRepo::new(f.pool.clone()).record(AUTHOR, &shadow.id).unwrap();

        let result = resolve(&f, "s;hi").0.unwrap();
        assert_eq!(result.member.id, shadow.id);
    }

    #[test]
    fn restricted_group_skipped() {
        let f = fixture();
        let restricted = GroupRepo::new(f.pool.clone())
            .create(&f.account.id, "elsewhere", None, &[Snowflake(999)])
            .unwrap();
        MemberRepo::new(f.pool.clone())
            .create(
                &restricted.id,
                NewMember {
                    name: "Away".into(),
                    proxy_tags: vec![ProxyTag::new("a;", "")],
                    ..NewMember::default()
                },
            )
            .unwrap();

        let (result, trace) = resolve(&f, "a;hi");
        assert!(result.is_none());
        assert!(trace.mentions("Channel Stack: {20, 19}"));
        assert!(trace.mentions("Group `elsewhere` is restricted to other channels."));
    }

    #[test]
    fn restricted_match_auto_creates_server_autoproxy() {
        let f = fixture();
        let restricted = GroupRepo::new(f.pool.clone())
            .create(&f.account.id, "here", None, &[Snowflake(19)])
            .unwrap();
        let local = MemberRepo::new(f.pool.clone())
            .create(
                &restricted.id,
                NewMember {
                    name: "Local".into(),
                    proxy_tags: vec![ProxyTag::new("l;", "")],
                    ..NewMember::default()
                },
            )
            .unwrap();
        set_autoproxy(&f, None, AutoproxyMode::Front, Some(&f.p2));

        let (result, trace) = resolve(&f, "l;hi");
        let result = result.unwrap();
        assert_eq!(result.member.id, local.id);
        assert!(trace.mentions("Auto-creating server autoproxy"));

        let records = AutoproxyRepo::new(f.pool.clone())
            .for_guild(&f.account.id, GUILD)
            .unwrap();
        let server = records.iter().find(|r| r.guild_id == Some(GUILD)).unwrap();
        assert_eq!(server.member_id.as_deref(), Some(local.id.as_str()));
    }
}
