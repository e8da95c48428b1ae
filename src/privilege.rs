//! 脚本运行身份：解析 run-as 用户，并只对子进程降权。

use nix::unistd::{Gid, Uid, User, geteuid, getgrouplist, setgid, setgroups, setuid};
use std::ffi::CString;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PrivilegeError {
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    #[error("invalid user name '{0}'")]
    InvalidName(String),
    #[error("failed to look up user '{user}': {source}")]
    Lookup { user: String, source: nix::Error },
}

/// 子进程的目标身份。
#[derive(Clone, Debug)]
pub struct Identity {
    pub user: String,
    pub uid: Uid,
    pub gid: Gid,
    pub groups: Vec<Gid>,
}

/// 解析脚本应使用的身份。
///
/// 只有以 root 运行时才切换身份（未指定 `run_as` 时使用 `default_user`）；
/// 非 root 且指定了 `run_as` 时仅记录警告，脚本以当前身份运行。
pub fn resolve_identity(
    run_as: Option<&str>,
    default_user: &str,
) -> Result<Option<Identity>, PrivilegeError> {
    if !geteuid().is_root() {
        if let Some(user) = run_as {
            warn!(
                user,
                "not running as root, script runs as the current user instead"
            );
        }
        return Ok(None);
    }

    let name = run_as.unwrap_or(default_user);
    let user = User::from_name(name)
        .map_err(|source| PrivilegeError::Lookup {
            user: name.to_string(),
            source,
        })?
        .ok_or_else(|| PrivilegeError::UnknownUser(name.to_string()))?;
    let c_name = CString::new(name).map_err(|_| PrivilegeError::InvalidName(name.to_string()))?;
    let groups = getgrouplist(&c_name, user.gid).map_err(|source| PrivilegeError::Lookup {
        user: name.to_string(),
        source,
    })?;

    info!(
        user = name,
        uid = user.uid.as_raw(),
        gid = user.gid.as_raw(),
        groups = ?groups.iter().map(|gid| gid.as_raw()).collect::<Vec<_>>(),
        "script will run as"
    );
    Ok(Some(Identity {
        user: name.to_string(),
        uid: user.uid,
        gid: user.gid,
        groups,
    }))
}

/// 在 fork 之后、exec 之前为子进程设置身份，服务进程自身凭据不变。
pub fn apply_identity(command: &mut Command, identity: Identity) {
    debug!(user = %identity.user, "script identity applied");
    let Identity {
        uid, gid, groups, ..
    } = identity;
    // SAFETY: the closure runs in the forked child and only issues the
    // setgroups/setgid/setuid syscalls on data prepared before the fork.
    unsafe {
        command.pre_exec(move || {
            setgroups(&groups)?;
            setgid(gid)?;
            setuid(uid)?;
            Ok(())
        });
    }
}
