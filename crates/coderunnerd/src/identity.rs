//! OS identity resolution: principal username -> (uid, gid, home), backing
//! C5's "resolve the principal to (UID, GID, home)" contract.
//! A thin, safe wrapper over `getpwnam_r`, grounded in the uid/gid-centric
//! privilege APIs (`setresuid`/`setresgid`/`setgroups`) that
//! `other_examples/.../wormhole-attach-main.rs` pulls in via `nix`; this
//! crate uses `libc` directly for the same syscalls since only the lookup
//! and the drop sequence are needed, not a full process-isolation stack.

use std::ffi::CStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("unknown OS user: {0}")]
    UnknownUser(String),
    #[error("password database lookup failed")]
    LookupFailed,
}

#[derive(Debug, Clone, Copy)]
pub struct OsIdentity {
    pub uid: u32,
    pub gid: u32,
}

/// Resolve `username` to its OS uid/gid via `getpwnam_r` (reentrant, so safe
/// to call from multiple executor-runner worker tasks concurrently).
pub fn resolve(username: &str) -> Result<OsIdentity, IdentityError> {
    let c_username = std::ffi::CString::new(username).map_err(|_| IdentityError::LookupFailed)?;
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0_i8; 16 * 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    // SAFETY: `buf` outlives the call and is large enough for typical NSS
    // backends; `pwd`/`result` are valid out-parameters per getpwnam_r(3).
    let rc = unsafe {
        libc::getpwnam_r(
            c_username.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };

    if rc != 0 || result.is_null() {
        return Err(IdentityError::UnknownUser(username.to_string()));
    }

    Ok(OsIdentity {
        uid: pwd.pw_uid,
        gid: pwd.pw_gid,
    })
}

/// Best-effort home directory lookup for the scrubbed child environment
/// ("Environment is scrubbed... HOME, USER, LOGNAME, PATH").
pub fn home_dir(username: &str) -> Option<String> {
    let c_username = std::ffi::CString::new(username).ok()?;
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0_i8; 16 * 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwnam_r(
            c_username.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    // SAFETY: pw_dir is a NUL-terminated string owned by `buf` above.
    let dir = unsafe { CStr::from_ptr(pwd.pw_dir) };
    dir.to_str().ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_unknown_user() {
        let err = resolve("definitely-not-a-real-user-12345").unwrap_err();
        assert!(matches!(err, IdentityError::UnknownUser(_)));
    }

    #[test]
    fn resolve_finds_root() {
        let identity = resolve("root").unwrap();
        assert_eq!(identity.uid, 0);
        assert_eq!(identity.gid, 0);
    }
}
