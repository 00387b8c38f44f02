//! USER / `--chown` resolution against a root filesystem's
//! `/etc/passwd` and `/etc/group`.

use crate::fs::Snapshot;
use crate::image::ResolvedUser;

struct PasswdEntry<'a> {
    name: &'a str,
    uid: u32,
    gid: u32,
}

fn passwd_entries(text: &str) -> impl Iterator<Item = PasswdEntry<'_>> {
    text.lines().filter_map(|line| {
        let mut fields = line.split(':');
        let name = fields.next()?;
        let _password = fields.next()?;
        let uid = fields.next()?.parse().ok()?;
        let gid = fields.next()?.parse().ok()?;
        Some(PasswdEntry { name, uid, gid })
    })
}

fn group_entries(text: &str) -> impl Iterator<Item = (&str, u32)> {
    text.lines().filter_map(|line| {
        let mut fields = line.split(':');
        let name = fields.next()?;
        let _password = fields.next()?;
        let gid = fields.next()?.parse().ok()?;
        Some((name, gid))
    })
}

fn read_text<'a>(rootfs: &'a Snapshot, path: &str) -> &'a str {
    rootfs
        .read_file(path)
        .and_then(|b| std::str::from_utf8(b).ok())
        .unwrap_or("")
}

/// Resolve a `user[:group]` spec to numeric ids.
///
/// Numeric users without a passwd entry get gid 0. A name that is not in
/// `/etc/passwd` (or a group not in `/etc/group`) is an error, except
/// `root`, which always resolves to 0.
pub fn resolve_ids(spec: &str, rootfs: &Snapshot) -> Result<(u32, u32), String> {
    let (user, group) = match spec.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (spec, None),
    };
    let passwd = read_text(rootfs, "/etc/passwd");

    let (uid, primary_gid) = if let Ok(uid) = user.parse::<u32>() {
        let gid = passwd_entries(passwd)
            .find(|e| e.uid == uid)
            .map(|e| e.gid)
            .unwrap_or(0);
        (uid, gid)
    } else if let Some(entry) = passwd_entries(passwd).find(|e| e.name == user) {
        (entry.uid, entry.gid)
    } else if user == "root" {
        (0, 0)
    } else {
        return Err(format!("user '{}' not found in /etc/passwd", user));
    };

    let gid = match group {
        None => primary_gid,
        Some(g) => match g.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => group_entries(read_text(rootfs, "/etc/group"))
                .find(|(name, _)| *name == g)
                .map(|(_, gid)| gid)
                .or_else(|| (g == "root").then_some(0))
                .ok_or_else(|| format!("group '{}' not found in /etc/group", g))?,
        },
    };

    Ok((uid, gid))
}

/// Resolve the image USER; undeclared means root.
pub fn resolve_user(spec: Option<&str>, rootfs: &Snapshot) -> Result<ResolvedUser, String> {
    match spec.filter(|s| !s.is_empty()) {
        None => Ok(ResolvedUser::root()),
        Some(spec) => {
            let (uid, gid) = resolve_ids(spec, rootfs)?;
            Ok(ResolvedUser {
                name: spec.to_string(),
                uid,
                gid,
            })
        }
    }
}
