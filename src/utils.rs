// SPDX-License-Identifier: AGPL-3.0-or-later

//! Small stand-alone helpers with no natural home in a single subsystem.

use std::fmt::Write;

use rand::Rng;

/// Resolves every group a uid belongs to (primary + supplementary), the
/// way the policy engine needs it to evaluate every `<policy group="...">`
/// list a connecting peer's credentials put it in, not just its primary
/// gid. Looks up the user's name and primary gid via `getpwuid_r`, then
/// asks `getgrouplist` for the full membership list, growing the buffer
/// and retrying once if it was too small.
///
/// Returns just `[primary_gid]` if the uid cannot be resolved (e.g. the
/// peer's uid has no passwd entry visible to this process) rather than
/// failing outright — a missing name lookup should narrow a connection's
/// group-based policy matches, not break the connection.
pub fn groups_for_uid(uid: u32, primary_gid: u32) -> Vec<u32> {
    let Some(name) = username_for_uid(uid) else { return vec![primary_gid] };

    let mut ngroups: libc::c_int = 16;
    loop {
        let mut groups: Vec<libc::gid_t> = vec![0; ngroups as usize];
        let mut count = ngroups;
        // SAFETY: `name` is a valid NUL-terminated C string for the call's
        // duration; `groups` has room for `count` elements and `getgrouplist`
        // writes at most that many, updating `count` to the true total even
        // on the too-small-buffer retry path.
        let rc = unsafe {
            libc::getgrouplist(
                name.as_ptr(),
                primary_gid as libc::gid_t,
                groups.as_mut_ptr(),
                &mut count,
            )
        };
        if rc >= 0 {
            groups.truncate(count as usize);
            return groups.into_iter().map(|g| g as u32).collect();
        }
        if count <= ngroups {
            // getgrouplist failed without telling us a larger size to try.
            return vec![primary_gid];
        }
        ngroups = count;
    }
}

fn username_for_uid(uid: u32) -> Option<std::ffi::CString> {
    let buf_len = match unsafe { libc::sysconf(libc::_SC_GETPW_R_SIZE_MAX) } {
        n if n > 0 => n as usize,
        _ => 16384,
    };
    let mut buf = vec![0u8; buf_len];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    // SAFETY: `pwd`/`buf` outlive the call, `buf_len` matches `buf`'s
    // length, and `result` is only read after the call returns.
    let rc = unsafe {
        libc::getpwuid_r(
            uid as libc::uid_t,
            &mut pwd,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    // SAFETY: `result` is non-null, set by `getpwuid_r` to point at `pwd`,
    // whose `pw_name` field points into `buf`, which we still own.
    let name = unsafe { std::ffi::CStr::from_ptr(pwd.pw_name) };
    Some(name.to_owned())
}

/// Generates a 16-byte server GUID and returns its lowercase hex encoding,
/// the form sent in the auth handshake's `OK <guid>` response. Each
/// daemon process picks one at startup; it never changes for the life of
/// the process.
pub fn generate_guid() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);

    let mut hex = String::with_capacity(32);
    for byte in &bytes {
        write!(&mut hex, "{byte:02x}").expect("writing to String cannot fail");
    }
    hex
}
