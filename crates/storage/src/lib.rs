use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use shared::{
    conversation::{
        direct_pair_key, list_for_user, Conversation, ConversationKind, GroupSettings, ListFilter,
    },
    domain::{ConversationId, Message, MessageId, Nonce, ReadReceipt, UserId, UserProfile},
    error::MembershipError,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, SqliteConnection,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Result of an append. `inserted` is false when the nonce was already used
/// by the same sender in the same conversation.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub message: Message,
    pub inserted: bool,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn upsert_user(&self, profile: &UserProfile) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, display_name) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name",
        )
        .bind(profile.id.as_str())
        .bind(&profile.display_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn user_profile(&self, user_id: &UserId) -> Result<Option<UserProfile>> {
        let row = sqlx::query("SELECT id, display_name FROM users WHERE id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| profile_from_row(&r)))
    }

    /// Profiles in the order of `user_ids`; unknown users fall back to their id.
    pub async fn profiles_for(&self, user_ids: &[UserId]) -> Result<Vec<UserProfile>> {
        let mut profiles = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let profile = self
                .user_profile(user_id)
                .await?
                .unwrap_or_else(|| UserProfile {
                    id: user_id.clone(),
                    display_name: user_id.to_string(),
                });
            profiles.push(profile);
        }
        Ok(profiles)
    }

    /// Lookup-or-create keyed on the unordered participant pair. Returns the
    /// canonical conversation and whether it was created by this call.
    pub async fn find_or_create_direct(
        &self,
        a: &UserId,
        b: &UserId,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, bool)> {
        let key = direct_pair_key(a, b);
        let mut tx = self.pool.begin().await?;

        if let Some(existing) = load_direct_on(&mut *tx, &key).await? {
            tx.commit().await?;
            return Ok((existing, false));
        }

        let conversation =
            Conversation::new_direct(ConversationId::generate(), a.clone(), b.clone(), now)?;
        conversation.validate()?;
        let inserted = sqlx::query(
            "INSERT INTO conversations (id, kind, direct_key, last_activity, is_active, document)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(direct_key) DO NOTHING",
        )
        .bind(conversation.id.as_str())
        .bind(kind_label(conversation.kind))
        .bind(&key)
        .bind(conversation.last_activity)
        .bind(conversation.is_active)
        .bind(serde_json::to_string(&conversation)?)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            replace_members_on(&mut *tx, &conversation).await?;
            tx.commit().await?;
            return Ok((conversation, true));
        }

        let existing = load_direct_on(&mut *tx, &key)
            .await?
            .ok_or_else(|| anyhow!("direct conversation {key} vanished during create"))?;
        tx.commit().await?;
        Ok((existing, false))
    }

    pub async fn create_group(
        &self,
        creator: &UserId,
        members: Vec<UserId>,
        name: &str,
        settings: GroupSettings,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        let conversation = Conversation::new_group(
            ConversationId::generate(),
            creator.clone(),
            members,
            name,
            settings,
            now,
        )?;
        let mut tx = self.pool.begin().await?;
        write_conversation_on(&mut *tx, &conversation).await?;
        tx.commit().await?;
        Ok(conversation)
    }

    /// Loads, changes and writes the document in one write transaction, so
    /// concurrent appends and receipts are never overwritten by a stale copy.
    /// Returns `None` for an unknown conversation. A rejected change or an
    /// invariant violation leaves the stored document untouched.
    pub async fn update_conversation<F>(
        &self,
        conversation_id: &ConversationId,
        apply: F,
    ) -> Result<Option<Conversation>>
    where
        F: FnOnce(&mut Conversation) -> Result<(), MembershipError>,
    {
        let mut tx = self.pool.begin().await?;
        lock_conversation_on(&mut *tx, conversation_id).await?;
        let Some(mut conversation) = load_conversation_on(&mut *tx, conversation_id).await? else {
            return Ok(None);
        };
        apply(&mut conversation)?;
        write_conversation_on(&mut *tx, &conversation).await?;
        tx.commit().await?;
        Ok(Some(conversation))
    }

    pub async fn load_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>> {
        let mut conn = self.pool.acquire().await?;
        load_conversation_on(&mut *conn, conversation_id).await
    }

    pub async fn list_conversations_for_user(
        &self,
        user_id: &UserId,
        filter: &ListFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT c.document
             FROM conversations c
             JOIN conversation_members m ON m.conversation_id = c.id
             WHERE m.user_id = ? AND c.is_active = 1",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let conversations = rows
            .iter()
            .map(|r| decode_document(&r.get::<String, _>(0)))
            .collect::<Result<Vec<_>>>()?;
        Ok(list_for_user(&conversations, user_id, filter, now)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Idempotent on (conversation, sender, nonce): a repeated nonce returns the
    /// message stored by the first append.
    pub async fn append_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        content: &str,
        nonce: Option<&Nonce>,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome> {
        let mut tx = self.pool.begin().await?;
        lock_conversation_on(&mut *tx, conversation_id).await?;

        if let Some(nonce) = nonce {
            let existing = sqlx::query(
                "SELECT id FROM messages WHERE conversation_id = ? AND sender_id = ? AND nonce = ?",
            )
            .bind(conversation_id.as_str())
            .bind(sender_id.as_str())
            .bind(nonce.as_str())
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = existing {
                let message_id = MessageId::new(row.get::<String, _>(0));
                let message = load_message_on(&mut *tx, &message_id)
                    .await?
                    .ok_or_else(|| anyhow!("message {message_id} vanished during append"))?;
                tx.commit().await?;
                return Ok(AppendOutcome {
                    message,
                    inserted: false,
                });
            }
        }

        let mut conversation = load_conversation_on(&mut *tx, conversation_id)
            .await?
            .ok_or_else(|| anyhow!("conversation {conversation_id} not found"))?;

        let message = Message {
            id: MessageId::generate(),
            conversation_id: conversation_id.clone(),
            sender_id: sender_id.clone(),
            content: content.to_string(),
            timestamp: now,
            read_by: Vec::new(),
            nonce: nonce.cloned(),
        };
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_id, content, nonce, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.as_str())
        .bind(conversation_id.as_str())
        .bind(sender_id.as_str())
        .bind(content)
        .bind(nonce.map(Nonce::as_str))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        conversation.record_message(&message.id, now);
        write_conversation_on(&mut *tx, &conversation).await?;
        tx.commit().await?;

        Ok(AppendOutcome {
            message,
            inserted: true,
        })
    }

    pub async fn load_message(&self, message_id: &MessageId) -> Result<Option<Message>> {
        let mut conn = self.pool.acquire().await?;
        load_message_on(&mut *conn, message_id).await
    }

    /// Newest `limit` messages strictly before `before`, returned oldest first.
    pub async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<&MessageId>,
    ) -> Result<Vec<Message>> {
        let before_seq = match before {
            Some(message_id) => {
                let seq = sqlx::query_scalar::<_, i64>(
                    "SELECT seq FROM messages WHERE id = ? AND conversation_id = ?",
                )
                .bind(message_id.as_str())
                .bind(conversation_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
                match seq {
                    Some(seq) => seq,
                    None => return Ok(Vec::new()),
                }
            }
            None => i64::MAX,
        };

        let rows = sqlx::query(
            "WITH page AS (
                 SELECT seq, id, conversation_id, sender_id, content, nonce, created_at
                 FROM messages
                 WHERE conversation_id = ? AND seq < ?
                 ORDER BY seq DESC
                 LIMIT ?
             )
             SELECT page.seq, page.id, page.conversation_id, page.sender_id, page.content,
                    page.nonce, page.created_at, r.user_id AS reader_id, r.read_at
             FROM page
             LEFT JOIN message_reads r ON r.message_id = page.id
             ORDER BY page.seq ASC, r.read_at ASC",
        )
        .bind(conversation_id.as_str())
        .bind(before_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(collect_messages(&rows))
    }

    pub async fn last_message(&self, conversation_id: &ConversationId) -> Result<Option<Message>> {
        let page = self.list_messages(conversation_id, 1, None).await?;
        Ok(page.into_iter().next())
    }

    /// Records a read receipt and moves the reader's last-read pointer forward.
    /// A receipt for an older message never rewinds the pointer.
    /// Returns `None` for an unknown message and `Some(false)` when the reader
    /// was already recorded.
    pub async fn mark_message_read(
        &self,
        message_id: &MessageId,
        reader: &UserId,
        read_at: DateTime<Utc>,
    ) -> Result<Option<bool>> {
        let mut tx = self.pool.begin().await?;
        // Writing first takes the database lock before anything is read.
        let newly_read = sqlx::query(
            "INSERT INTO message_reads (message_id, user_id, read_at)
             SELECT id, ?, ? FROM messages WHERE id = ?
             ON CONFLICT(message_id, user_id) DO NOTHING",
        )
        .bind(reader.as_str())
        .bind(read_at)
        .bind(message_id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;
        let Some(message) = load_message_on(&mut *tx, message_id).await? else {
            return Ok(None);
        };

        if newly_read {
            if let Some(mut conversation) =
                load_conversation_on(&mut *tx, &message.conversation_id).await?
            {
                let current = conversation
                    .overlay(reader)
                    .and_then(|state| state.last_read_message_id.clone());
                let advances = match current {
                    Some(current) => {
                        let current_seq = message_seq_on(&mut *tx, &current).await?;
                        let read_seq = message_seq_on(&mut *tx, message_id).await?;
                        read_seq > current_seq
                    }
                    None => true,
                };
                if advances && conversation.record_read(reader, message_id).is_ok() {
                    write_conversation_on(&mut *tx, &conversation).await?;
                }
            }
        }
        tx.commit().await?;
        Ok(Some(newly_read))
    }

    /// Messages from other participants that `user_id` has not read.
    pub async fn unread_count(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<u32> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM messages m
             WHERE m.conversation_id = ? AND m.sender_id != ?
               AND NOT EXISTS (
                   SELECT 1 FROM message_reads r WHERE r.message_id = m.id AND r.user_id = ?
               )",
        )
        .bind(conversation_id.as_str())
        .bind(user_id.as_str())
        .bind(user_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

async fn load_direct_on(conn: &mut SqliteConnection, key: &str) -> Result<Option<Conversation>> {
    let row = sqlx::query("SELECT document FROM conversations WHERE direct_key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|r| decode_document(&r.get::<String, _>(0)))
        .transpose()
}

/// Takes the database write lock before the document is read, so the
/// read-modify-write that follows cannot interleave with another writer.
async fn lock_conversation_on(
    conn: &mut SqliteConnection,
    conversation_id: &ConversationId,
) -> Result<()> {
    sqlx::query("UPDATE conversations SET id = id WHERE id = ?")
        .bind(conversation_id.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn message_seq_on(conn: &mut SqliteConnection, message_id: &MessageId) -> Result<Option<i64>> {
    let seq = sqlx::query_scalar::<_, i64>("SELECT seq FROM messages WHERE id = ?")
        .bind(message_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(seq)
}

async fn load_conversation_on(
    conn: &mut SqliteConnection,
    conversation_id: &ConversationId,
) -> Result<Option<Conversation>> {
    let row = sqlx::query("SELECT document FROM conversations WHERE id = ?")
        .bind(conversation_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|r| decode_document(&r.get::<String, _>(0)))
        .transpose()
}

async fn write_conversation_on(
    conn: &mut SqliteConnection,
    conversation: &Conversation,
) -> Result<()> {
    conversation.validate()?;

    let direct_key = match conversation.kind {
        ConversationKind::Direct => Some(direct_pair_key(
            &conversation.participants[0],
            &conversation.participants[1],
        )),
        ConversationKind::Group => None,
    };
    sqlx::query(
        "INSERT INTO conversations (id, kind, direct_key, last_activity, is_active, document)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            last_activity = excluded.last_activity,
            is_active = excluded.is_active,
            document = excluded.document",
    )
    .bind(conversation.id.as_str())
    .bind(kind_label(conversation.kind))
    .bind(direct_key)
    .bind(conversation.last_activity)
    .bind(conversation.is_active)
    .bind(serde_json::to_string(conversation)?)
    .execute(&mut *conn)
    .await?;

    replace_members_on(conn, conversation).await
}

async fn replace_members_on(
    conn: &mut SqliteConnection,
    conversation: &Conversation,
) -> Result<()> {
    sqlx::query("DELETE FROM conversation_members WHERE conversation_id = ?")
        .bind(conversation.id.as_str())
        .execute(&mut *conn)
        .await?;
    for participant in &conversation.participants {
        sqlx::query("INSERT INTO conversation_members (conversation_id, user_id) VALUES (?, ?)")
            .bind(conversation.id.as_str())
            .bind(participant.as_str())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn load_message_on(
    conn: &mut SqliteConnection,
    message_id: &MessageId,
) -> Result<Option<Message>> {
    let rows = sqlx::query(
        "SELECT m.seq, m.id, m.conversation_id, m.sender_id, m.content, m.nonce, m.created_at,
                r.user_id AS reader_id, r.read_at
         FROM messages m
         LEFT JOIN message_reads r ON r.message_id = m.id
         WHERE m.id = ?
         ORDER BY r.read_at ASC",
    )
    .bind(message_id.as_str())
    .fetch_all(&mut *conn)
    .await?;
    Ok(collect_messages(&rows).into_iter().next())
}

/// Folds message rows left-joined with their read receipts into messages.
fn collect_messages(rows: &[SqliteRow]) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::new();
    for r in rows {
        let id = MessageId::new(r.get::<String, _>("id"));
        let is_new = messages.last().map_or(true, |last| last.id != id);
        if is_new {
            messages.push(Message {
                id,
                conversation_id: ConversationId::new(r.get::<String, _>("conversation_id")),
                sender_id: UserId::new(r.get::<String, _>("sender_id")),
                content: r.get::<String, _>("content"),
                timestamp: r.get::<DateTime<Utc>, _>("created_at"),
                read_by: Vec::new(),
                nonce: r.get::<Option<String>, _>("nonce").map(Nonce::new),
            });
        }
        if let (Some(reader), Some(read_at)) = (
            r.get::<Option<String>, _>("reader_id"),
            r.get::<Option<DateTime<Utc>>, _>("read_at"),
        ) {
            if let Some(message) = messages.last_mut() {
                message.read_by.push(ReadReceipt {
                    user_id: UserId::new(reader),
                    read_at,
                });
            }
        }
    }
    messages
}

fn profile_from_row(r: &SqliteRow) -> UserProfile {
    UserProfile {
        id: UserId::new(r.get::<String, _>(0)),
        display_name: r.get::<String, _>(1),
    }
}

fn decode_document(raw: &str) -> Result<Conversation> {
    serde_json::from_str(raw).context("corrupt conversation document")
}

fn kind_label(kind: ConversationKind) -> &'static str {
    match kind {
        ConversationKind::Direct => "direct",
        ConversationKind::Group => "group",
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
