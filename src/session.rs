//! Session Store: one JSON file per session under a sessions directory
//! (spec §4.5). No TOML/YAML config crate is introduced — plain
//! `serde_json`, matching the teacher's `config.rs` philosophy of a
//! minimal, dependency-free persistence shape.

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::OnceCell;

use crate::error::AgentError;
use crate::model::{Message, Session};

pub struct SessionStore {
    dir: PathBuf,
    dir_ready: OnceCell<()>,
}

impl SessionStore {
    /// `sessions_dir` defaults to `<workspace>/.floyd/sessions` but is
    /// overridable (spec §6).
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: sessions_dir.into(),
            dir_ready: OnceCell::new(),
        }
    }

    pub fn for_workspace(workspace: impl AsRef<Path>) -> Self {
        Self::new(workspace.as_ref().join(".floyd").join("sessions"))
    }

    /// All callers await this single shared future, so concurrent
    /// first-time callers never race to create the directory.
    async fn ensure_dir(&self) -> Result<(), AgentError> {
        self.dir_ready
            .get_or_try_init(|| async {
                fs::create_dir_all(&self.dir).await?;
                Ok::<(), AgentError>(())
            })
            .await?;
        Ok(())
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn create(&self, working_directory: impl Into<String>, title: Option<String>) -> Result<Session, AgentError> {
        self.ensure_dir().await?;
        let session = Session::new(working_directory, title);
        self.save(&session).await?;
        Ok(session)
    }

    /// Atomic write: write to a sibling temp file, then rename.
    pub async fn save(&self, session: &Session) -> Result<(), AgentError> {
        self.ensure_dir().await?;
        let serialized = serde_json::to_string_pretty(session)?;
        let target = self.path_for(&session.id);
        let tmp_path = target.with_extension("json.tmp");
        fs::write(&tmp_path, serialized).await?;
        fs::rename(&tmp_path, &target).await?;
        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<Session, AgentError> {
        self.ensure_dir().await?;
        let contents = fs::read_to_string(self.path_for(id)).await?;
        let session = serde_json::from_str(&contents)?;
        Ok(session)
    }

    /// Sessions sorted by `updated_at` descending; files that fail to
    /// parse are skipped rather than surfaced as an error.
    pub async fn list(&self) -> Result<Vec<Session>, AgentError> {
        self.ensure_dir().await?;
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut sessions = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path).await {
                Ok(contents) => match serde_json::from_str::<Session>(&contents) {
                    Ok(session) => sessions.push(session),
                    Err(e) => log::warn!("session file {path:?} is corrupt ({e}); skipping"),
                },
                Err(e) => log::warn!("could not read session file {path:?} ({e}); skipping"),
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    pub async fn delete(&self, id: &str) -> Result<(), AgentError> {
        self.ensure_dir().await?;
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update_title(&self, id: &str, title: Option<String>) -> Result<Session, AgentError> {
        let mut session = self.load(id).await?;
        session.title = title;
        session.touch();
        self.save(&session).await?;
        Ok(session)
    }

    /// Appends a message, touches `updated_at`, and persists — the
    /// single mutation primitive the Engine drives the history-append
    /// invariant through (spec §5's "session persistence happens at
    /// every history mutation").
    pub async fn append_message(&self, session: &mut Session, message: Message) -> Result<(), AgentError> {
        session.messages.push(message);
        session.touch();
        self.save(session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;

    #[tokio::test]
    async fn create_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::for_workspace(dir.path());
        let session = store.create("/tmp/ws", Some("t".into())).await.unwrap();
        let loaded = store.load(&session.id).await.unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.title.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn list_sorts_by_updated_at_descending() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::for_workspace(dir.path());
        let older = store.create("/tmp/ws", None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = store.create("/tmp/ws", None).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(listed[1].id, older.id);
    }

    #[tokio::test]
    async fn list_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::for_workspace(dir.path());
        let good = store.create("/tmp/ws", None).await.unwrap();

        let sessions_dir = dir.path().join(".floyd").join("sessions");
        tokio::fs::write(sessions_dir.join("bad.json"), "{ not json")
            .await
            .unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, good.id);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::for_workspace(dir.path());
        let session = store.create("/tmp/ws", None).await.unwrap();
        store.delete(&session.id).await.unwrap();
        store.delete(&session.id).await.unwrap();
        assert!(store.load(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn append_message_persists_and_touches() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::for_workspace(dir.path());
        let mut session = store.create("/tmp/ws", None).await.unwrap();
        let before = session.updated_at;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .append_message(&mut session, Message::user("hello"))
            .await
            .unwrap();

        assert!(session.updated_at > before);
        let reloaded = store.load(&session.id).await.unwrap();
        assert_eq!(reloaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_time_callers_do_not_race_on_dir_creation() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(SessionStore::for_workspace(dir.path()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.ensure_dir().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(dir.path().join(".floyd").join("sessions").is_dir());
    }
}
