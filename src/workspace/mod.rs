//! Workspace membership, invite codes, and atomic JSON snapshot persistence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

const INVITE_CODE_LEN: usize = 8;
const INVITE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789"; // no 0/O/1/I

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub owner_user_id: String,
    pub invite_code: String,
    pub members: Vec<Member>,
    pub created_at_unix: u64,
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace not found")]
    NotFound,
    #[error("invite code not found")]
    InviteCodeNotFound,
    #[error("not a member")]
    NotMember,
    #[error("owner cannot leave without transferring ownership")]
    OwnerCannotLeave,
    #[error("forbidden")]
    Forbidden,
}

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    workspaces: Vec<Workspace>,
}

/// Outcome of `join`: distinguishes a fresh join from a no-op rejoin so
/// callers can surface idempotence without treating it as a failure.
#[derive(Debug, Clone)]
pub enum JoinOutcome {
    Joined(Workspace),
    AlreadyMember(Workspace),
}

impl JoinOutcome {
    pub fn into_workspace(self) -> Workspace {
        match self {
            JoinOutcome::Joined(w) | JoinOutcome::AlreadyMember(w) => w,
        }
    }

    pub fn already_member(&self) -> bool {
        matches!(self, JoinOutcome::AlreadyMember(_))
    }
}

struct Inner {
    workspaces: HashMap<String, Workspace>,
    invite_index: HashMap<String, String>, // code -> workspace id
}

#[derive(Clone)]
pub struct WorkspaceDirectory {
    inner: Arc<RwLock<Inner>>,
    snapshot_path: PathBuf,
}

impl WorkspaceDirectory {
    pub fn new(snapshot_path: PathBuf) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                workspaces: HashMap::new(),
                invite_index: HashMap::new(),
            })),
            snapshot_path,
        }
    }

    /// Loads a previously persisted snapshot, if the file exists.
    pub async fn load(&self) -> anyhow::Result<()> {
        if !self.snapshot_path.exists() {
            return Ok(());
        }
        let contents = fs::read_to_string(&self.snapshot_path).await?;
        let snapshot: Snapshot = serde_json::from_str(&contents)?;
        let mut inner = self.inner.write().await;
        for workspace in snapshot.workspaces {
            inner
                .invite_index
                .insert(workspace.invite_code.clone(), workspace.id.clone());
            inner.workspaces.insert(workspace.id.clone(), workspace);
        }
        Ok(())
    }

    /// Serializes the full in-memory state and writes it atomically: a temp
    /// file is written and synced, then renamed over the target path.
    async fn persist(&self, inner: &Inner) -> anyhow::Result<()> {
        let snapshot = Snapshot {
            workspaces: inner.workspaces.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        if let Some(parent) = self.snapshot_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path = self.snapshot_path.with_extension("tmp");
        fs::write(&temp_path, json.as_bytes()).await?;
        fs::rename(&temp_path, &self.snapshot_path).await?;
        Ok(())
    }

    pub async fn create(&self, owner_user_id: &str, name: &str) -> Workspace {
        let mut inner = self.inner.write().await;
        let code = Self::unique_invite_code(&inner);
        let workspace = Workspace {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            owner_user_id: owner_user_id.to_string(),
            invite_code: code.clone(),
            members: vec![Member {
                user_id: owner_user_id.to_string(),
                role: Role::Owner,
            }],
            created_at_unix: now_unix(),
        };
        inner.invite_index.insert(code, workspace.id.clone());
        inner.workspaces.insert(workspace.id.clone(), workspace.clone());
        let _ = self.persist(&inner).await;
        workspace
    }

    fn unique_invite_code(inner: &Inner) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let code: String = (0..INVITE_CODE_LEN)
                .map(|_| INVITE_ALPHABET[rng.gen_range(0..INVITE_ALPHABET.len())] as char)
                .collect();
            if !inner.invite_index.contains_key(&code) {
                return code;
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<Workspace> {
        self.inner.read().await.workspaces.get(id).cloned()
    }

    pub async fn get_by_invite_code(&self, code: &str) -> Option<Workspace> {
        let inner = self.inner.read().await;
        let id = inner.invite_index.get(code)?;
        inner.workspaces.get(id).cloned()
    }

    pub async fn list_for_user(&self, user_id: &str) -> Vec<Workspace> {
        self.inner
            .read()
            .await
            .workspaces
            .values()
            .filter(|w| w.members.iter().any(|m| m.user_id == user_id))
            .cloned()
            .collect()
    }

    /// Idempotent: joining with an invite code a user already holds
    /// membership under succeeds without altering state, distinguished in
    /// the return value rather than as an error.
    pub async fn join(&self, invite_code: &str, user_id: &str) -> Result<JoinOutcome, WorkspaceError> {
        let mut inner = self.inner.write().await;
        let workspace_id = inner
            .invite_index
            .get(invite_code)
            .cloned()
            .ok_or(WorkspaceError::InviteCodeNotFound)?;
        let workspace = inner
            .workspaces
            .get_mut(&workspace_id)
            .ok_or(WorkspaceError::NotFound)?;

        if workspace.members.iter().any(|m| m.user_id == user_id) {
            return Ok(JoinOutcome::AlreadyMember(workspace.clone()));
        }

        workspace.members.push(Member {
            user_id: user_id.to_string(),
            role: Role::Member,
        });
        let result = workspace.clone();
        self.persist(&inner).await.ok();
        Ok(JoinOutcome::Joined(result))
    }

    pub async fn leave(&self, workspace_id: &str, user_id: &str) -> Result<(), WorkspaceError> {
        let mut inner = self.inner.write().await;
        let workspace = inner
            .workspaces
            .get_mut(workspace_id)
            .ok_or(WorkspaceError::NotFound)?;
        if workspace.owner_user_id == user_id {
            return Err(WorkspaceError::OwnerCannotLeave);
        }
        let before = workspace.members.len();
        workspace.members.retain(|m| m.user_id != user_id);
        if workspace.members.len() == before {
            return Err(WorkspaceError::NotMember);
        }
        self.persist(&inner).await.ok();
        Ok(())
    }

    pub async fn delete(&self, workspace_id: &str, requester: &str) -> Result<(), WorkspaceError> {
        let mut inner = self.inner.write().await;
        let workspace = inner
            .workspaces
            .get(workspace_id)
            .ok_or(WorkspaceError::NotFound)?;
        if workspace.owner_user_id != requester {
            return Err(WorkspaceError::Forbidden);
        }
        let code = workspace.invite_code.clone();
        inner.workspaces.remove(workspace_id);
        inner.invite_index.remove(&code);
        self.persist(&inner).await.ok();
        Ok(())
    }

    pub async fn regenerate_invite_code(
        &self,
        workspace_id: &str,
        requester: &str,
    ) -> Result<String, WorkspaceError> {
        let mut inner = self.inner.write().await;
        let can_manage = {
            let workspace = inner
                .workspaces
                .get(workspace_id)
                .ok_or(WorkspaceError::NotFound)?;
            workspace.members.iter().any(|m| {
                m.user_id == requester && matches!(m.role, Role::Owner | Role::Admin)
            })
        };
        if !can_manage {
            return Err(WorkspaceError::Forbidden);
        }

        let new_code = Self::unique_invite_code(&inner);
        let old_code = {
            let workspace = inner.workspaces.get_mut(workspace_id).unwrap();
            let old = workspace.invite_code.clone();
            workspace.invite_code = new_code.clone();
            old
        };
        inner.invite_index.remove(&old_code);
        inner.invite_index.insert(new_code.clone(), workspace_id.to_string());
        self.persist(&inner).await.ok();
        Ok(new_code)
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dir() -> (WorkspaceDirectory, TempDir) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("workspaces.json");
        (WorkspaceDirectory::new(path), tmp)
    }

    #[tokio::test]
    async fn create_then_join_by_invite_code() {
        let (wd, _tmp) = dir();
        let workspace = wd.create("owner-1", "team").await;
        let outcome = wd.join(&workspace.invite_code, "user-2").await.unwrap();
        assert!(!outcome.already_member());
        assert_eq!(outcome.into_workspace().members.len(), 2);
    }

    #[tokio::test]
    async fn rejoining_is_idempotent() {
        let (wd, _tmp) = dir();
        let workspace = wd.create("owner-1", "team").await;
        wd.join(&workspace.invite_code, "user-2").await.unwrap();

        let second = wd.join(&workspace.invite_code, "user-2").await.unwrap();
        assert!(second.already_member());
        assert_eq!(second.into_workspace().members.len(), 2);
    }

    #[tokio::test]
    async fn owner_cannot_leave() {
        let (wd, _tmp) = dir();
        let workspace = wd.create("owner-1", "team").await;
        let result = wd.leave(&workspace.id, "owner-1").await;
        assert!(matches!(result, Err(WorkspaceError::OwnerCannotLeave)));
    }

    #[tokio::test]
    async fn persists_and_reloads_snapshot() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("workspaces.json");
        let wd = WorkspaceDirectory::new(path.clone());
        wd.create("owner-1", "team").await;

        let reloaded = WorkspaceDirectory::new(path);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.list_for_user("owner-1").await.len(), 1);
    }

    #[tokio::test]
    async fn invite_codes_are_unique_across_workspaces() {
        let (wd, _tmp) = dir();
        let a = wd.create("owner-1", "a").await;
        let b = wd.create("owner-2", "b").await;
        assert_ne!(a.invite_code, b.invite_code);
    }

    #[tokio::test]
    async fn workspace_isolation_excludes_non_members() {
        let (wd, _tmp) = dir();
        let a = wd.create("owner-1", "a").await;
        wd.create("owner-2", "b").await;
        let listed = wd.list_for_user("owner-1").await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, a.id);
    }
}
