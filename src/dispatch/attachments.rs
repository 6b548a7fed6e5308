//! Attachment size budget and re-upload

use futures::future::try_join_all;

use crate::Result;
use crate::db::DebugTrace;
use crate::discord::{Attachment, DiscordApi, FileUpload};

const MIB: u64 = 1_048_576;

/// Hard cap on attachment bytes re-uploaded per message
pub const MAX_PROXY_UPLOAD: u64 = 20 * MIB;

/// Upload limit for a guild's boost tier
#[must_use]
pub const fn filesize_limit(premium_tier: Option<u8>) -> u64 {
    match premium_tier {
        Some(2) => 50 * MIB,
        Some(3) => 100 * MIB,
        _ => 10 * MIB,
    }
}

/// Whether `size` bytes fit both the guild limit and the proxy cap
pub fn within_budget(size: u64, limit: u64, trace: &mut DebugTrace) -> bool {
    if size > limit {
        #[allow(clippy::cast_precision_loss)]
        let megabytes = size as f64 / MIB as f64;
        trace.push(format!(
            "Attachments exceed {} MB. ({megabytes:.2} MB)",
            limit / MIB
        ));
        return false;
    }

    if size > MAX_PROXY_UPLOAD {
        trace.push("Only 20MB of attachments can be proxied at a time.");
        return false;
    }

    true
}

/// Declared size of all attachments
#[must_use]
pub fn declared_size(attachments: &[Attachment]) -> u64 {
    attachments.iter().map(|a| a.size).sum()
}

/// Downloaded size of all files
#[must_use]
pub fn downloaded_size(files: &[FileUpload]) -> u64 {
    files.iter().map(|f| f.data.len() as u64).sum()
}

/// Download every attachment for re-upload
///
/// Empty downloads are dropped.
///
/// # Errors
///
/// Returns error if any download fails
pub async fn download_all(api: &dyn DiscordApi, attachments: &[Attachment]) -> Result<Vec<FileUpload>> {
    let downloads = try_join_all(attachments.iter().map(|a| api.download(&a.url))).await?;

    Ok(attachments
        .iter()
        .zip(downloads)
        .filter(|(_, data)| !data.is_empty())
        .map(|(attachment, data)| FileUpload {
            filename: attachment.filename.clone(),
            data,
            description: attachment.description.clone(),
            content_type: attachment.content_type.clone(),
            duration_secs: attachment.duration_secs,
            waveform: attachment.waveform.clone(),
        })
        .collect())
}
