#![forbid(unsafe_code)]

//! Process and path safety checks shared by the front ends.

use std::path::{Component, Path};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to start as root: every download spawns an external program that
/// would inherit the same uid.
pub fn ensure_unprivileged(process: &str) -> Result<()> {
    check_uid(Uid::current(), process)
}

fn check_uid(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("refusing to start {process} as root: downloads would run as root too");
    }
    Ok(())
}

/// Whether `name` is a single plain file name that stays inside the storage
/// directory once joined onto it.
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains('\\')
}
