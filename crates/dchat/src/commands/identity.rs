use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::Config;
use crate::output::Output;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WhoamiResult {
    local_id: String,
    nickname: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CidResult {
    local_id: String,
    peer_id: String,
    conversation_id: String,
}

/// Show current identity
pub fn whoami(config: &Config, output: &Output) -> Result<()> {
    let result = WhoamiResult {
        local_id: config.local_id.clone().unwrap_or_default(),
        nickname: config.nickname.clone().unwrap_or_default(),
    };
    output.success("whoami", result);
    Ok(())
}

pub fn set_nickname(name: &str, config: &mut Config, output: &Output) -> Result<()> {
    config.set_nickname(name)?;
    whoami(config, output)
}

/// Forget the stored identity
pub fn reset(config: &mut Config, output: &Output) -> Result<()> {
    config.clear_identity()?;
    output.success_message("reset", "Identity cleared");
    Ok(())
}

/// Direct conversation id shared with `peer`
pub fn conversation_id(peer: &str, config: &Config, output: &Output) -> Result<()> {
    let local_id = config.local_id.clone().context("No local identity")?;
    let conversation_id = dchat_core::resolve_direct(&local_id, peer)?;
    output.success(
        "cid",
        CidResult {
            local_id,
            peer_id: peer.to_string(),
            conversation_id,
        },
    );
    Ok(())
}
