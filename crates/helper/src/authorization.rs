//! Authorization for mutating requests
//!
//! A peer holds the configure right when its uid is explicitly allowed
//! (root by default) or when it belongs to the configured authorization
//! group, either as primary or supplementary group. Credentials come from
//! `SO_PEERCRED` on the accepted socket, so they cannot be forged by the
//! client.

use crate::error::{HelperError, Result};
use nix::unistd::{Gid, Group, Uid, User, getgrouplist};
use std::ffi::CString;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

impl From<tokio::net::unix::UCred> for PeerCredentials {
    fn from(cred: tokio::net::unix::UCred) -> Self {
        Self {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthorizationPolicy {
    allowed_uids: Vec<u32>,
    group: Option<u32>,
}

impl AuthorizationPolicy {
    /// Root plus members of `group`
    pub fn new(group: Option<u32>) -> Self {
        Self {
            allowed_uids: vec![0],
            group,
        }
    }

    /// Resolve the authorization group by name
    pub fn from_group_name(name: Option<&str>) -> Result<Self> {
        let gid = match name {
            Some(name) => Some(
                Group::from_name(name)?
                    .ok_or_else(|| HelperError::UnknownGroup(name.to_string()))?
                    .gid
                    .as_raw(),
            ),
            None => None,
        };
        Ok(Self::new(gid))
    }

    /// A policy nobody satisfies, root included
    pub fn deny_all() -> Self {
        Self {
            allowed_uids: Vec::new(),
            group: None,
        }
    }

    pub fn allow_uid(mut self, uid: u32) -> Self {
        self.allowed_uids.push(uid);
        self
    }

    pub fn group(&self) -> Option<u32> {
        self.group
    }

    pub fn is_authorized(&self, peer: &PeerCredentials) -> bool {
        if self.allowed_uids.contains(&peer.uid) {
            return true;
        }
        let Some(group) = self.group else {
            return false;
        };
        peer.gid == group || supplementary_groups(peer.uid, peer.gid).contains(&group)
    }
}

fn supplementary_groups(uid: u32, gid: u32) -> Vec<u32> {
    let user = match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user,
        Ok(None) => return Vec::new(),
        Err(e) => {
            debug!(uid, "User lookup failed: {}", e);
            return Vec::new();
        }
    };
    let Ok(name) = CString::new(user.name) else {
        return Vec::new();
    };

    match getgrouplist(&name, Gid::from_raw(gid)) {
        Ok(groups) => groups.into_iter().map(|g| g.as_raw()).collect(),
        Err(e) => {
            debug!(uid, "Group list lookup failed: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(uid: u32, gid: u32) -> PeerCredentials {
        PeerCredentials {
            uid,
            gid,
            pid: None,
        }
    }

    #[test]
    fn test_root_is_authorized_by_default() {
        let policy = AuthorizationPolicy::new(None);
        assert!(policy.is_authorized(&peer(0, 0)));
        assert!(!policy.is_authorized(&peer(4242, 4242)));
    }

    #[test]
    fn test_primary_group_grants_right() {
        let policy = AuthorizationPolicy::new(Some(3100));
        assert!(policy.is_authorized(&peer(4242, 3100)));
        assert!(!policy.is_authorized(&peer(4242, 3101)));
    }

    #[test]
    fn test_explicit_uid_and_deny_all() {
        assert!(!AuthorizationPolicy::deny_all().is_authorized(&peer(0, 0)));
        let policy = AuthorizationPolicy::deny_all().allow_uid(1000);
        assert!(policy.is_authorized(&peer(1000, 1000)));
    }

    #[test]
    fn test_unknown_group_name() {
        let result = AuthorizationPolicy::from_group_name(Some("fleet-netd-no-such-group"));
        assert!(matches!(result, Err(HelperError::UnknownGroup(_))));
        assert_eq!(AuthorizationPolicy::from_group_name(None).unwrap().group(), None);
    }
}
