//! SQLite-backed state store.
//!
//! Holds everything that outlives a single command: the session row (current
//! database, active collection), the ordered chat history, the registry of
//! vector collections, and per-collection sources, chunks, and embedding
//! BLOBs. The restored SQL Server database itself lives in the database
//! server; only its name is recorded here.
//!
//! Collection names carry a fixed-width millisecond-timestamp prefix, so
//! lexicographic order is creation order and the eviction policy ("drop the
//! oldest once over the cap") is a simple `ORDER BY name` delete.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;

use crate::config::Config;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::session::{ChatMessage, Role, Session};

/// A chunk ready for insertion: text plus its embedding vector.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
    pub embedding: Vec<f32>,
}

/// A chunk loaded back for retrieval scoring.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub text: String,
    pub embedding: Vec<f32>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(config: &Config) -> Result<Store> {
        let db_path = &config.state.path;

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Store { pool })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                current_db TEXT,
                collection TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS turns (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                collection TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                added_at INTEGER NOT NULL,
                PRIMARY KEY (collection, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                source TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                hash TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunk_vectors (
                chunk_id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                dims INTEGER NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_collection ON chunks(collection)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_collection ON chunk_vectors(collection)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── Sessions ────────────────────────────────────────────────────────

    /// Load the most recent session, creating one if the store is empty.
    pub async fn load_or_create_session(&self) -> Result<Session> {
        let row = sqlx::query(
            "SELECT id, current_db, collection FROM sessions ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(Session {
                id: row.get("id"),
                current_db: row.get("current_db"),
                collection: row.get("collection"),
            });
        }

        let session = Session::new(uuid::Uuid::new_v4().to_string());
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO sessions (id, current_db, collection, created_at, updated_at) VALUES (?, NULL, NULL, ?, ?)",
        )
        .bind(&session.id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    pub async fn set_current_db(&self, session: &mut Session, db_name: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET current_db = ?, updated_at = ? WHERE id = ?")
            .bind(db_name)
            .bind(chrono::Utc::now().timestamp())
            .bind(&session.id)
            .execute(&self.pool)
            .await?;
        session.current_db = Some(db_name.to_string());
        Ok(())
    }

    pub async fn set_collection(&self, session: &mut Session, collection: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET collection = ?, updated_at = ? WHERE id = ?")
            .bind(collection)
            .bind(chrono::Utc::now().timestamp())
            .bind(&session.id)
            .execute(&self.pool)
            .await?;
        session.collection = Some(collection.to_string());
        Ok(())
    }

    /// Destroy the session and start a fresh one. Drops the session's
    /// collection data; the restored database is left to the server.
    pub async fn reset_session(&self, session: Session) -> Result<Session> {
        if let Some(collection) = &session.collection {
            self.drop_collection(collection).await?;
        }
        sqlx::query("DELETE FROM turns WHERE session_id = ?")
            .bind(&session.id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(&session.id)
            .execute(&self.pool)
            .await?;

        self.load_or_create_session().await
    }

    // ── Chat history ────────────────────────────────────────────────────

    pub async fn append_turn(&self, session_id: &str, role: Role, content: &str) -> Result<()> {
        let next_seq: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(seq), -1) + 1 FROM turns WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;

        sqlx::query(
            "INSERT INTO turns (session_id, seq, role, content, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(next_seq)
        .bind(role.as_str())
        .bind(content)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn turns(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query("SELECT role, content FROM turns WHERE session_id = ? ORDER BY seq")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let role: String = row.get("role");
            let role = Role::parse(&role)
                .ok_or_else(|| anyhow::anyhow!("Unknown role in turn history: {}", role))?;
            messages.push(ChatMessage {
                role,
                content: row.get("content"),
            });
        }
        Ok(messages)
    }

    // ── Collections ─────────────────────────────────────────────────────

    /// Register a new collection, then enforce the process-wide cap by
    /// deleting the lexicographically-first collections and their data.
    pub async fn create_collection(
        &self,
        name: &str,
        session_id: &str,
        max_collections: usize,
    ) -> Result<()> {
        sqlx::query("INSERT INTO collections (name, session_id, created_at) VALUES (?, ?, ?)")
            .bind(name)
            .bind(session_id)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;

        loop {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM collections")
                .fetch_one(&self.pool)
                .await?;
            if count as usize <= max_collections {
                break;
            }
            let oldest: String =
                sqlx::query_scalar("SELECT name FROM collections ORDER BY name LIMIT 1")
                    .fetch_one(&self.pool)
                    .await?;
            tracing::info!(collection = %oldest, "collection cap exceeded, evicting oldest");
            self.drop_collection(&oldest).await?;
        }

        Ok(())
    }

    pub async fn collection_names(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar("SELECT name FROM collections ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    pub async fn drop_collection(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_vectors WHERE collection = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE collection = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sources WHERE collection = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ── Sources ─────────────────────────────────────────────────────────

    pub async fn has_source(&self, collection: &str, name: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sources WHERE collection = ? AND name = ?")
                .bind(collection)
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    pub async fn source_count(&self, collection: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// Sources in insertion order: (name, kind).
    pub async fn sources(&self, collection: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT name, kind FROM sources WHERE collection = ? ORDER BY added_at, name",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("name"), row.get("kind")))
            .collect())
    }

    pub async fn add_source(&self, collection: &str, name: &str, kind: &str) -> Result<()> {
        sqlx::query("INSERT INTO sources (collection, name, kind, added_at) VALUES (?, ?, ?, ?)")
            .bind(collection)
            .bind(name)
            .bind(kind)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Chunks & vectors ────────────────────────────────────────────────

    pub async fn insert_chunks(
        &self,
        collection: &str,
        source: &str,
        chunks: &[StoredChunk],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, collection, source, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(collection)
            .bind(source)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO chunk_vectors (chunk_id, collection, dims, embedding) VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(collection)
            .bind(chunk.embedding.len() as i64)
            .bind(vec_to_blob(&chunk.embedding))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn load_embedded_chunks(&self, collection: &str) -> Result<Vec<EmbeddedChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.text AS text, v.embedding AS embedding
            FROM chunks c
            JOIN chunk_vectors v ON v.chunk_id = c.id
            WHERE c.collection = ?
            ORDER BY c.source, c.chunk_index
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                EmbeddedChunk {
                    text: row.get("text"),
                    embedding: blob_to_vec(&blob),
                }
            })
            .collect())
    }
}

/// Collection name with a fixed-width millisecond-timestamp prefix so that
/// lexicographic order matches creation order.
pub fn collection_name(session_id: &str) -> String {
    format!("{:014}_{}", chrono::Utc::now().timestamp_millis(), session_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerConfig, StateConfig};

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            state: StateConfig {
                path: dir.join("state.sqlite"),
            },
            mssql: Default::default(),
            backup: Default::default(),
            model: crate::config::ModelConfig {
                endpoint: "https://example.openai.azure.com".to_string(),
                deployment: "gpt-4o".to_string(),
                api_version: "2024-02-15-preview".to_string(),
                api_key_env: "AZURE_OPENAI_API_KEY".to_string(),
                temperature: 0.2,
                timeout_secs: 60,
                max_retries: 2,
                max_result_rows: 50,
            },
            embedding: Default::default(),
            rag: Default::default(),
            server: ServerConfig {
                bind: "127.0.0.1:0".to_string(),
            },
        }
    }

    async fn open_store(dir: &tempfile::TempDir) -> Store {
        let store = Store::connect(&test_config(dir.path())).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn session_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut session = store.load_or_create_session().await.unwrap();
        assert!(session.current_db.is_none());

        store.set_current_db(&mut session, "userdb_ab12cd34").await.unwrap();
        let reloaded = store.load_or_create_session().await.unwrap();
        assert_eq!(reloaded.id, session.id);
        assert_eq!(reloaded.current_db.as_deref(), Some("userdb_ab12cd34"));
    }

    #[tokio::test]
    async fn turns_preserve_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let session = store.load_or_create_session().await.unwrap();

        store.append_turn(&session.id, Role::User, "first").await.unwrap();
        store.append_turn(&session.id, Role::Assistant, "second").await.unwrap();
        store.append_turn(&session.id, Role::User, "third").await.unwrap();

        let turns = store.turns(&session.id).await.unwrap();
        let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
        assert_eq!(turns[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn collection_cap_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store.create_collection("00000000000001_a", "a", 2).await.unwrap();
        store.create_collection("00000000000002_b", "b", 2).await.unwrap();
        store.create_collection("00000000000003_c", "c", 2).await.unwrap();

        let names = store.collection_names().await.unwrap();
        assert_eq!(names, vec!["00000000000002_b", "00000000000003_c"]);
    }

    #[tokio::test]
    async fn eviction_removes_collection_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store.create_collection("00000000000001_a", "a", 1).await.unwrap();
        store.add_source("00000000000001_a", "notes.md", "file").await.unwrap();
        store
            .insert_chunks(
                "00000000000001_a",
                "notes.md",
                &[StoredChunk {
                    id: "c1".to_string(),
                    chunk_index: 0,
                    text: "hello".to_string(),
                    hash: "h".to_string(),
                    embedding: vec![0.1, 0.2],
                }],
            )
            .await
            .unwrap();

        store.create_collection("00000000000002_b", "b", 1).await.unwrap();

        assert_eq!(store.source_count("00000000000001_a").await.unwrap(), 0);
        assert!(store
            .load_embedded_chunks("00000000000001_a")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn chunks_roundtrip_with_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store.create_collection("00000000000009_s", "s", 20).await.unwrap();
        store
            .insert_chunks(
                "00000000000009_s",
                "doc.txt",
                &[
                    StoredChunk {
                        id: "c1".to_string(),
                        chunk_index: 0,
                        text: "alpha".to_string(),
                        hash: "h1".to_string(),
                        embedding: vec![1.0, 0.0],
                    },
                    StoredChunk {
                        id: "c2".to_string(),
                        chunk_index: 1,
                        text: "beta".to_string(),
                        hash: "h2".to_string(),
                        embedding: vec![0.0, 1.0],
                    },
                ],
            )
            .await
            .unwrap();

        let loaded = store.load_embedded_chunks("00000000000009_s").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].text, "alpha");
        assert_eq!(loaded[0].embedding, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn reset_creates_fresh_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut session = store.load_or_create_session().await.unwrap();
        store.set_current_db(&mut session, "userdb_1").await.unwrap();
        store.append_turn(&session.id, Role::User, "hi").await.unwrap();
        let old_id = session.id.clone();

        let fresh = store.reset_session(session).await.unwrap();
        assert_ne!(fresh.id, old_id);
        assert!(fresh.current_db.is_none());
        assert!(store.turns(&fresh.id).await.unwrap().is_empty());
    }

    #[test]
    fn collection_names_sort_by_creation() {
        let a = collection_name("s");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = collection_name("s");
        assert!(a < b);
    }
}
