//! Effective channel permissions from cached snapshots

use serenity::model::permissions::Permissions;

use crate::Result;
use crate::cache::EntityCache;
use crate::db::DebugTrace;
use crate::discord::{Channel, Guild, GuildMember, PermissionOverwrite, Role, Snowflake};

/// Overwrite target kinds
const OVERWRITE_ROLE: u8 = 0;
const OVERWRITE_MEMBER: u8 = 1;

/// Permissions of `user_id` in `channel_id`
///
/// Any missing snapshot yields no permissions and a trace entry.
///
/// # Errors
///
/// Returns error if the cache cannot be read
pub fn effective_permissions(
    cache: &EntityCache,
    guild_id: Snowflake,
    channel_id: Snowflake,
    user_id: Snowflake,
    trace: &mut DebugTrace,
) -> Result<Permissions> {
    let Some(guild) = cache.get_guild(guild_id)? else {
        trace.push(format!("Guild {guild_id} not found in cache"));
        return Ok(Permissions::empty());
    };

    let Some(mut channel) = cache.get_channel(channel_id)? else {
        trace.push(format!("Channel {channel_id} not found in cache"));
        return Ok(Permissions::empty());
    };

    let Some(member) = cache.get_member(guild_id, user_id)? else {
        trace.push(format!("Member {user_id} not found in cache"));
        return Ok(Permissions::empty());
    };

    if channel.is_thread() {
        let Some(parent) = channel.parent_id else {
            trace.push(format!("Thread {channel_id} has no parent channel"));
            return Ok(Permissions::empty());
        };
        let Some(parent) = cache.get_channel(parent)? else {
            trace.push(format!("Parent channel {parent} not found in cache"));
            return Ok(Permissions::empty());
        };
        channel = parent;
    }

    let roles = cache.guild_roles(guild_id)?;
    Ok(compute(&guild, &channel, &member, &roles, user_id))
}

/// Permission resolution over already-loaded snapshots
///
/// `channel` must not be a thread; callers substitute the parent first.
#[must_use]
pub fn compute(
    guild: &Guild,
    channel: &Channel,
    member: &GuildMember,
    roles: &[Role],
    user_id: Snowflake,
) -> Permissions {
    if guild.owner_id == Some(user_id) {
        return Permissions::all();
    }

    let mut permissions = base_permissions(guild.id, member, roles);
    if permissions.contains(Permissions::ADMINISTRATOR) {
        return Permissions::all();
    }

    apply_overwrites(
        &mut permissions,
        &channel.permission_overwrites,
        guild.id,
        member,
        user_id,
    );
    permissions
}

/// `@everyone` plus every held role
fn base_permissions(guild_id: Snowflake, member: &GuildMember, roles: &[Role]) -> Permissions {
    roles
        .iter()
        .filter(|role| role.id == guild_id || member.roles.contains(&role.id))
        .fold(Permissions::empty(), |acc, role| {
            acc | Permissions::from_bits_truncate(role.permissions)
        })
}

fn apply_overwrites(
    permissions: &mut Permissions,
    overwrites: &[PermissionOverwrite],
    guild_id: Snowflake,
    member: &GuildMember,
    user_id: Snowflake,
) {
    // @everyone
    if let Some(everyone) = overwrites.iter().find(|o| o.id == guild_id) {
        permissions.remove(Permissions::from_bits_truncate(everyone.deny));
        permissions.insert(Permissions::from_bits_truncate(everyone.allow));
    }

    let (mut allow, mut deny) = (0u64, 0u64);
    for overwrite in overwrites.iter().filter(|o| {
        o.kind == OVERWRITE_ROLE && o.id != guild_id && member.roles.contains(&o.id)
    }) {
        allow |= overwrite.allow;
        deny |= overwrite.deny;
    }
    permissions.remove(Permissions::from_bits_truncate(deny));
    permissions.insert(Permissions::from_bits_truncate(allow));

    if let Some(own) = overwrites
        .iter()
        .find(|o| o.kind == OVERWRITE_MEMBER && o.id == user_id)
    {
        permissions.remove(Permissions::from_bits_truncate(own.deny));
        permissions.insert(Permissions::from_bits_truncate(own.allow));
    }
}
