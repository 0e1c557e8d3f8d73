#![forbid(unsafe_code)]

//! Process and path hardening for the gateway.

use std::path::{Component, Path};

use anyhow::{Result, bail};
use nix::unistd::Uid;

use crate::error::GatewayError;

/// Refuses to start when either the real or the effective uid is root.
pub fn ensure_not_root(process: &str) -> Result<()> {
    check_uids(process, Uid::current(), Uid::effective())
}

fn check_uids(process: &str, real: Uid, effective: Uid) -> Result<()> {
    if real.is_root() || effective.is_root() {
        bail!("refusing to start {process} as root; the download cache would end up root-owned");
    }
    Ok(())
}

/// Accepts only a single, normal path component (no `..`, no separators, no
/// absolute roots). Anything else is reported as not found.
pub fn ensure_plain_file_name(name: &str) -> Result<(), GatewayError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => Ok(()),
        _ => Err(GatewayError::NotFound("file not found".to_string())),
    }
}
