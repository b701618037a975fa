//! Database layer using SQLite
//!
//! Provides persistent storage for users, servers, members, channels, DM
//! channels, messages, voice states, invites, and published E2E keys.
//! Message content columns are opaque client-encrypted blobs; when an
//! at-rest cipher is configured they are additionally wrapped before
//! insertion and unwrapped on read.

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::crypto::AtRestCipher;
use crate::models::{
    now_ms, Channel, ChannelKind, DmChannel, DmChannelWithUsers, Invite, KeyType, MemberWithUser,
    Message, MessageKind, MessageWithAuthor, PresenceStatus, PublicUser, Server, ServerMember,
    User, UserPublicKey, VoiceState, VoiceStateWithUser,
};
use crate::permissions::Role;

/// Database connection pool and operations
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    cipher: Option<AtRestCipher>,
}

impl Database {
    /// Open (or create) the database at `path`. `:memory:` is supported for
    /// tests. The optional cipher enables at-rest wrapping of message blobs.
    pub async fn new(path: &str, cipher: Option<AtRestCipher>) -> Result<Self> {
        let is_memory = path == ":memory:";
        let db_url = if is_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        // Every pooled connection to `:memory:` would be its own empty
        // database, so the in-memory pool is pinned to one connection.
        let max_connections = if is_memory { 1 } else { 5 };

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .idle_timeout(std::time::Duration::from_secs(300))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    use sqlx::Executor;
                    conn.execute("PRAGMA busy_timeout = 5000").await?;
                    conn.execute("PRAGMA journal_mode = WAL").await?;
                    conn.execute("PRAGMA foreign_keys = ON").await?;
                    Ok(())
                })
            })
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        let db = Self { pool, cipher };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY NOT NULL,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                display_name TEXT NOT NULL DEFAULT '',
                avatar_url TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'offline',
                bio TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create users table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_public_keys (
                id TEXT PRIMARY KEY NOT NULL,
                user_id TEXT NOT NULL,
                key_type TEXT NOT NULL,
                public_key TEXT NOT NULL,
                key_id INTEGER NOT NULL DEFAULT 0,
                signature TEXT NOT NULL DEFAULT '',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create user_public_keys table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                icon_url TEXT NOT NULL DEFAULT '',
                owner_id TEXT NOT NULL,
                invite_code TEXT NOT NULL UNIQUE,
                is_private INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted_at INTEGER,
                FOREIGN KEY (owner_id) REFERENCES users (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create servers table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS server_members (
                id TEXT PRIMARY KEY NOT NULL,
                server_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'member',
                nickname TEXT NOT NULL DEFAULT '',
                joined_at INTEGER NOT NULL,
                UNIQUE (server_id, user_id),
                FOREIGN KEY (server_id) REFERENCES servers (id),
                FOREIGN KEY (user_id) REFERENCES users (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create server_members table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY NOT NULL,
                server_id TEXT NOT NULL,
                name TEXT NOT NULL,
                topic TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL DEFAULT 'text',
                position INTEGER NOT NULL DEFAULT 0,
                is_private INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted_at INTEGER,
                FOREIGN KEY (server_id) REFERENCES servers (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create channels table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dm_channels (
                id TEXT PRIMARY KEY NOT NULL,
                user1_id TEXT NOT NULL,
                user2_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (user1_id, user2_id),
                FOREIGN KEY (user1_id) REFERENCES users (id),
                FOREIGN KEY (user2_id) REFERENCES users (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create dm_channels table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY NOT NULL,
                channel_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                nonce TEXT NOT NULL DEFAULT '',
                encryption_header TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL DEFAULT 'text',
                attachment_url TEXT,
                reply_to_id TEXT,
                is_edited INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted_at INTEGER,
                FOREIGN KEY (author_id) REFERENCES users (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create messages table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_channel_created \
             ON messages (channel_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create message index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS voice_states (
                id TEXT PRIMARY KEY NOT NULL,
                user_id TEXT NOT NULL UNIQUE,
                channel_id TEXT NOT NULL,
                server_id TEXT NOT NULL,
                joined_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create voice_states table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS invites (
                id TEXT PRIMARY KEY NOT NULL,
                code TEXT NOT NULL UNIQUE,
                server_id TEXT NOT NULL,
                creator_id TEXT NOT NULL,
                max_uses INTEGER NOT NULL DEFAULT 0,
                uses INTEGER NOT NULL DEFAULT 0,
                expires_at INTEGER,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (server_id) REFERENCES servers (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create invites table")?;

        Ok(())
    }

    // ── Users ──

    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<User> {
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            display_name: username.to_string(),
            avatar_url: String::new(),
            status: PresenceStatus::Online,
            bio: String::new(),
            created_at: now_ms(),
            updated_at: now_ms(),
        };

        sqlx::query(
            "INSERT INTO users (id, username, email, password_hash, display_name, avatar_url, status, bio, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user.id.to_string())
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.display_name)
        .bind(&user.avatar_url)
        .bind(user.status.as_str())
        .bind(&user.bio)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert user")?;

        Ok(user)
    }

    pub async fn get_user_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ? AND deleted_at IS NULL")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query user by id")?;

        row.map(|r| parse_user(&r)).transpose()
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = ? AND deleted_at IS NULL")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query user by email")?;

        row.map(|r| parse_user(&r)).transpose()
    }

    pub async fn username_or_email_taken(&self, username: &str, email: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM users WHERE username = ? OR email = ?")
            .bind(username)
            .bind(email)
            .fetch_one(&self.pool)
            .await
            .context("Failed to check username/email uniqueness")?;
        Ok(row.get::<i64, _>("count") > 0)
    }

    /// Partial profile update; `None` fields are left unchanged.
    pub async fn update_user_profile(
        &self,
        user_id: Uuid,
        display_name: Option<String>,
        avatar_url: Option<String>,
        bio: Option<String>,
        status: Option<PresenceStatus>,
    ) -> Result<Option<User>> {
        let Some(mut user) = self.get_user_by_id(user_id).await? else {
            return Ok(None);
        };

        if let Some(display_name) = display_name {
            user.display_name = display_name;
        }
        if let Some(avatar_url) = avatar_url {
            user.avatar_url = avatar_url;
        }
        if let Some(bio) = bio {
            user.bio = bio;
        }
        if let Some(status) = status {
            user.status = status;
        }
        user.updated_at = now_ms();

        sqlx::query(
            "UPDATE users SET display_name = ?, avatar_url = ?, bio = ?, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&user.display_name)
        .bind(&user.avatar_url)
        .bind(&user.bio)
        .bind(user.status.as_str())
        .bind(user.updated_at)
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update user profile")?;

        Ok(Some(user))
    }

    pub async fn set_user_status(&self, user_id: Uuid, status: PresenceStatus) -> Result<()> {
        sqlx::query("UPDATE users SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_ms())
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update user status")?;
        Ok(())
    }

    // ── E2E public keys ──

    /// Store a published key. Non-one-time key types replace prior active
    /// keys of the same type.
    pub async fn upload_public_key(
        &self,
        user_id: Uuid,
        key_type: KeyType,
        public_key: &str,
        key_id: i64,
        signature: &str,
    ) -> Result<UserPublicKey> {
        if key_type != KeyType::OneTimePrekey {
            sqlx::query(
                "UPDATE user_public_keys SET is_active = 0 WHERE user_id = ? AND key_type = ?",
            )
            .bind(user_id.to_string())
            .bind(key_type.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to deactivate old keys")?;
        }

        let key = UserPublicKey {
            id: Uuid::new_v4(),
            user_id,
            key_type,
            public_key: public_key.to_string(),
            key_id,
            signature: signature.to_string(),
            is_active: true,
            created_at: now_ms(),
        };

        sqlx::query(
            "INSERT INTO user_public_keys (id, user_id, key_type, public_key, key_id, signature, is_active, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(key.id.to_string())
        .bind(user_id.to_string())
        .bind(key_type.as_str())
        .bind(public_key)
        .bind(key_id)
        .bind(signature)
        .bind(key.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert public key")?;

        Ok(key)
    }

    pub async fn get_active_public_keys(&self, user_id: Uuid) -> Result<Vec<UserPublicKey>> {
        let rows = sqlx::query(
            "SELECT * FROM user_public_keys WHERE user_id = ? AND is_active = 1 ORDER BY created_at ASC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query public keys")?;

        rows.iter().map(parse_public_key).collect()
    }

    // ── Servers ──

    /// Create a server, its owner membership, and the default channels in
    /// one transaction.
    pub async fn create_server(
        &self,
        name: &str,
        description: &str,
        owner_id: Uuid,
        is_private: bool,
        invite_code: &str,
    ) -> Result<(Server, Vec<Channel>)> {
        let now = now_ms();
        let server = Server {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.to_string(),
            icon_url: String::new(),
            owner_id,
            invite_code: invite_code.to_string(),
            is_private,
            created_at: now,
            updated_at: now,
        };

        let default_channels: Vec<Channel> = [
            ("general", ChannelKind::Text, 0),
            ("random", ChannelKind::Text, 1),
            ("General Voice", ChannelKind::Voice, 2),
        ]
        .into_iter()
        .map(|(name, kind, position)| Channel {
            id: Uuid::new_v4(),
            server_id: server.id,
            name: name.to_string(),
            topic: String::new(),
            kind,
            position,
            is_private: false,
            created_at: now,
            updated_at: now,
        })
        .collect();

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            "INSERT INTO servers (id, name, description, icon_url, owner_id, invite_code, is_private, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(server.id.to_string())
        .bind(&server.name)
        .bind(&server.description)
        .bind(&server.icon_url)
        .bind(owner_id.to_string())
        .bind(invite_code)
        .bind(is_private)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to insert server")?;

        sqlx::query(
            "INSERT INTO server_members (id, server_id, user_id, role, joined_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(server.id.to_string())
        .bind(owner_id.to_string())
        .bind(Role::Owner.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to insert owner membership")?;

        for channel in &default_channels {
            sqlx::query(
                "INSERT INTO channels (id, server_id, name, kind, position, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(channel.id.to_string())
            .bind(server.id.to_string())
            .bind(&channel.name)
            .bind(channel.kind.as_str())
            .bind(channel.position)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to insert default channel")?;
        }

        tx.commit().await.context("Failed to commit server creation")?;

        Ok((server, default_channels))
    }

    pub async fn get_server(&self, server_id: Uuid) -> Result<Option<Server>> {
        let row = sqlx::query("SELECT * FROM servers WHERE id = ? AND deleted_at IS NULL")
            .bind(server_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query server")?;

        row.map(|r| parse_server(&r)).transpose()
    }

    pub async fn get_server_by_invite_code(&self, code: &str) -> Result<Option<Server>> {
        let row = sqlx::query("SELECT * FROM servers WHERE invite_code = ? AND deleted_at IS NULL")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query server by invite code")?;

        row.map(|r| parse_server(&r)).transpose()
    }

    pub async fn get_user_servers(&self, user_id: Uuid) -> Result<Vec<Server>> {
        let rows = sqlx::query(
            "SELECT s.* FROM servers s \
             JOIN server_members m ON m.server_id = s.id \
             WHERE m.user_id = ? AND s.deleted_at IS NULL \
             ORDER BY m.joined_at ASC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query user servers")?;

        rows.iter().map(parse_server).collect()
    }

    pub async fn update_server(
        &self,
        server_id: Uuid,
        name: Option<String>,
        description: Option<String>,
        icon_url: Option<String>,
        is_private: Option<bool>,
    ) -> Result<Option<Server>> {
        let Some(mut server) = self.get_server(server_id).await? else {
            return Ok(None);
        };

        if let Some(name) = name {
            server.name = name;
        }
        if let Some(description) = description {
            server.description = description;
        }
        if let Some(icon_url) = icon_url {
            server.icon_url = icon_url;
        }
        if let Some(is_private) = is_private {
            server.is_private = is_private;
        }
        server.updated_at = now_ms();

        sqlx::query(
            "UPDATE servers SET name = ?, description = ?, icon_url = ?, is_private = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&server.name)
        .bind(&server.description)
        .bind(&server.icon_url)
        .bind(server.is_private)
        .bind(server.updated_at)
        .bind(server_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update server")?;

        Ok(Some(server))
    }

    /// Soft-delete a server and its channels/messages, hard-delete the
    /// dependent membership/invite/voice rows. One transaction; a failed
    /// step aborts the whole operation.
    pub async fn delete_server(&self, server_id: Uuid) -> Result<()> {
        let now = now_ms();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query("DELETE FROM voice_states WHERE server_id = ?")
            .bind(server_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete voice states")?;

        sqlx::query(
            "UPDATE messages SET deleted_at = ? WHERE deleted_at IS NULL AND channel_id IN \
             (SELECT id FROM channels WHERE server_id = ?)",
        )
        .bind(now)
        .bind(server_id.to_string())
        .execute(&mut *tx)
        .await
        .context("Failed to delete server messages")?;

        sqlx::query("UPDATE channels SET deleted_at = ? WHERE server_id = ? AND deleted_at IS NULL")
            .bind(now)
            .bind(server_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete channels")?;

        sqlx::query("DELETE FROM server_members WHERE server_id = ?")
            .bind(server_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete members")?;

        sqlx::query("DELETE FROM invites WHERE server_id = ?")
            .bind(server_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete invites")?;

        sqlx::query("UPDATE servers SET deleted_at = ? WHERE id = ?")
            .bind(now)
            .bind(server_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete server")?;

        tx.commit().await.context("Failed to commit server deletion")?;
        Ok(())
    }

    // ── Members ──

    pub async fn add_member(
        &self,
        server_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<ServerMember> {
        let member = ServerMember {
            id: Uuid::new_v4(),
            server_id,
            user_id,
            role,
            nickname: String::new(),
            joined_at: now_ms(),
        };

        sqlx::query(
            "INSERT INTO server_members (id, server_id, user_id, role, joined_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(member.id.to_string())
        .bind(server_id.to_string())
        .bind(user_id.to_string())
        .bind(role.as_str())
        .bind(member.joined_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert member")?;

        Ok(member)
    }

    pub async fn get_member(&self, server_id: Uuid, user_id: Uuid) -> Result<Option<ServerMember>> {
        let row = sqlx::query("SELECT * FROM server_members WHERE server_id = ? AND user_id = ?")
            .bind(server_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query member")?;

        row.map(|r| parse_member(&r)).transpose()
    }

    pub async fn is_member(&self, server_id: Uuid, user_id: Uuid) -> Result<bool> {
        Ok(self.get_member(server_id, user_id).await?.is_some())
    }

    pub async fn remove_member(&self, server_id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM server_members WHERE server_id = ? AND user_id = ?")
            .bind(server_id.to_string())
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to remove member")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_members(&self, server_id: Uuid) -> Result<Vec<MemberWithUser>> {
        let rows = sqlx::query(&format!(
            "SELECT m.*, {USER_ALIASES} FROM server_members m \
             JOIN users u ON u.id = m.user_id \
             WHERE m.server_id = ? ORDER BY m.joined_at ASC"
        ))
        .bind(server_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query members")?;

        rows.iter()
            .map(|r| {
                Ok(MemberWithUser {
                    member: parse_member(r)?,
                    user: parse_joined_user(r)?,
                })
            })
            .collect()
    }

    pub async fn get_member_with_user(
        &self,
        server_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<MemberWithUser>> {
        let row = sqlx::query(&format!(
            "SELECT m.*, {USER_ALIASES} FROM server_members m \
             JOIN users u ON u.id = m.user_id \
             WHERE m.server_id = ? AND m.user_id = ?"
        ))
        .bind(server_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query member with user")?;

        row.map(|r| {
            Ok(MemberWithUser {
                member: parse_member(&r)?,
                user: parse_joined_user(&r)?,
            })
        })
        .transpose()
    }

    // ── Channels ──

    #[allow(clippy::too_many_arguments)]
    pub async fn create_channel(
        &self,
        server_id: Uuid,
        name: &str,
        topic: &str,
        kind: ChannelKind,
        position: i64,
        is_private: bool,
    ) -> Result<Channel> {
        let now = now_ms();
        let channel = Channel {
            id: Uuid::new_v4(),
            server_id,
            name: name.to_string(),
            topic: topic.to_string(),
            kind,
            position,
            is_private,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO channels (id, server_id, name, topic, kind, position, is_private, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(channel.id.to_string())
        .bind(server_id.to_string())
        .bind(name)
        .bind(topic)
        .bind(kind.as_str())
        .bind(position)
        .bind(is_private)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to insert channel")?;

        Ok(channel)
    }

    pub async fn get_channel(&self, channel_id: Uuid) -> Result<Option<Channel>> {
        let row = sqlx::query("SELECT * FROM channels WHERE id = ? AND deleted_at IS NULL")
            .bind(channel_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query channel")?;

        row.map(|r| parse_channel(&r)).transpose()
    }

    pub async fn get_server_channels(&self, server_id: Uuid) -> Result<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT * FROM channels WHERE server_id = ? AND deleted_at IS NULL ORDER BY position ASC",
        )
        .bind(server_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query server channels")?;

        rows.iter().map(parse_channel).collect()
    }

    pub async fn update_channel(
        &self,
        channel_id: Uuid,
        name: Option<String>,
        topic: Option<String>,
        position: Option<i64>,
        is_private: Option<bool>,
    ) -> Result<Option<Channel>> {
        let Some(mut channel) = self.get_channel(channel_id).await? else {
            return Ok(None);
        };

        if let Some(name) = name {
            channel.name = name;
        }
        if let Some(topic) = topic {
            channel.topic = topic;
        }
        if let Some(position) = position {
            channel.position = position;
        }
        if let Some(is_private) = is_private {
            channel.is_private = is_private;
        }
        channel.updated_at = now_ms();

        sqlx::query(
            "UPDATE channels SET name = ?, topic = ?, position = ?, is_private = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&channel.name)
        .bind(&channel.topic)
        .bind(channel.position)
        .bind(channel.is_private)
        .bind(channel.updated_at)
        .bind(channel_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update channel")?;

        Ok(Some(channel))
    }

    /// Soft-delete a channel and its messages in one transaction.
    pub async fn delete_channel(&self, channel_id: Uuid) -> Result<()> {
        let now = now_ms();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query("UPDATE messages SET deleted_at = ? WHERE channel_id = ? AND deleted_at IS NULL")
            .bind(now)
            .bind(channel_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete channel messages")?;

        sqlx::query("UPDATE channels SET deleted_at = ? WHERE id = ?")
            .bind(now)
            .bind(channel_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete channel")?;

        tx.commit().await.context("Failed to commit channel deletion")?;
        Ok(())
    }

    /// A message destination is either a server channel or a DM channel.
    pub async fn channel_or_dm_exists(&self, channel_id: Uuid) -> Result<bool> {
        let row = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM channels WHERE id = ?1 AND deleted_at IS NULL) \
                  + (SELECT COUNT(*) FROM dm_channels WHERE id = ?1) AS count",
        )
        .bind(channel_id.to_string())
        .fetch_one(&self.pool)
        .await
        .context("Failed to check channel existence")?;
        Ok(row.get::<i64, _>("count") > 0)
    }

    // ── DM channels ──

    /// Find a DM channel by unordered user pair.
    pub async fn find_dm_channel(&self, a: Uuid, b: Uuid) -> Result<Option<DmChannel>> {
        let row = sqlx::query(
            "SELECT * FROM dm_channels \
             WHERE (user1_id = ?1 AND user2_id = ?2) OR (user1_id = ?2 AND user2_id = ?1)",
        )
        .bind(a.to_string())
        .bind(b.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query DM channel")?;

        row.map(|r| parse_dm_channel(&r)).transpose()
    }

    pub async fn create_dm_channel(&self, a: Uuid, b: Uuid) -> Result<DmChannel> {
        let dm = DmChannel {
            id: Uuid::new_v4(),
            user1_id: a,
            user2_id: b,
            created_at: now_ms(),
        };

        sqlx::query(
            "INSERT INTO dm_channels (id, user1_id, user2_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(dm.id.to_string())
        .bind(a.to_string())
        .bind(b.to_string())
        .bind(dm.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert DM channel")?;

        Ok(dm)
    }

    pub async fn get_dm_channel_with_users(
        &self,
        dm_id: Uuid,
    ) -> Result<Option<DmChannelWithUsers>> {
        let row = sqlx::query(&format!(
            "SELECT d.*, {DM_USER_ALIASES} FROM dm_channels d \
             JOIN users u1 ON u1.id = d.user1_id \
             JOIN users u2 ON u2.id = d.user2_id \
             WHERE d.id = ?"
        ))
        .bind(dm_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query DM channel with users")?;

        row.map(|r| parse_dm_with_users(&r)).transpose()
    }

    pub async fn get_user_dm_channels(&self, user_id: Uuid) -> Result<Vec<DmChannelWithUsers>> {
        let rows = sqlx::query(&format!(
            "SELECT d.*, {DM_USER_ALIASES} FROM dm_channels d \
             JOIN users u1 ON u1.id = d.user1_id \
             JOIN users u2 ON u2.id = d.user2_id \
             WHERE d.user1_id = ?1 OR d.user2_id = ?1 \
             ORDER BY d.created_at ASC"
        ))
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query user DM channels")?;

        rows.iter().map(parse_dm_with_users).collect()
    }

    // ── Messages ──

    /// Insert a message row. The returned value carries the caller-visible
    /// (client-encrypted) blobs; at-rest wrapping only affects the columns.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_message(
        &self,
        channel_id: Uuid,
        author_id: Uuid,
        content: &str,
        nonce: &str,
        encryption_header: &str,
        kind: MessageKind,
        attachment_url: Option<String>,
        reply_to_id: Option<Uuid>,
    ) -> Result<Message> {
        let now = now_ms();
        let message = Message {
            id: Uuid::new_v4(),
            channel_id,
            author_id,
            content: content.to_string(),
            nonce: nonce.to_string(),
            encryption_header: encryption_header.to_string(),
            kind,
            attachment_url: attachment_url.clone(),
            reply_to_id,
            is_edited: false,
            created_at: now,
            updated_at: now,
        };

        let (content, nonce, header) = self.wrap_blobs(content, nonce, encryption_header)?;

        sqlx::query(
            "INSERT INTO messages (id, channel_id, author_id, content, nonce, encryption_header, kind, attachment_url, reply_to_id, is_edited, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(channel_id.to_string())
        .bind(author_id.to_string())
        .bind(&content)
        .bind(&nonce)
        .bind(&header)
        .bind(kind.as_str())
        .bind(&attachment_url)
        .bind(reply_to_id.map(|id| id.to_string()))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to insert message")?;

        Ok(message)
    }

    pub async fn get_message(&self, message_id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ? AND deleted_at IS NULL")
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query message")?;

        row.map(|r| parse_message(&r, self.cipher.as_ref())).transpose()
    }

    pub async fn get_message_with_author(
        &self,
        message_id: Uuid,
    ) -> Result<Option<MessageWithAuthor>> {
        let row = sqlx::query(&format!(
            "SELECT m.*, {USER_ALIASES} FROM messages m \
             JOIN users u ON u.id = m.author_id \
             WHERE m.id = ? AND m.deleted_at IS NULL"
        ))
        .bind(message_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query message with author")?;

        row.map(|r| {
            Ok(MessageWithAuthor {
                message: parse_message(&r, self.cipher.as_ref())?,
                author: parse_joined_user(&r)?,
            })
        })
        .transpose()
    }

    /// Page of channel history in chronological order. `before` is an
    /// exclusive cursor message id.
    pub async fn list_messages(
        &self,
        channel_id: Uuid,
        limit: i64,
        before: Option<Uuid>,
    ) -> Result<Vec<MessageWithAuthor>> {
        let rows = match before {
            Some(before_id) => {
                sqlx::query(&format!(
                    "SELECT m.*, {USER_ALIASES} FROM messages m \
                     JOIN users u ON u.id = m.author_id \
                     WHERE m.channel_id = ? AND m.deleted_at IS NULL \
                       AND m.created_at < (SELECT created_at FROM messages WHERE id = ?) \
                     ORDER BY m.created_at DESC LIMIT ?"
                ))
                .bind(channel_id.to_string())
                .bind(before_id.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT m.*, {USER_ALIASES} FROM messages m \
                     JOIN users u ON u.id = m.author_id \
                     WHERE m.channel_id = ? AND m.deleted_at IS NULL \
                     ORDER BY m.created_at DESC LIMIT ?"
                ))
                .bind(channel_id.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to query messages")?;

        let mut messages: Vec<MessageWithAuthor> = rows
            .iter()
            .map(|r| {
                Ok(MessageWithAuthor {
                    message: parse_message(r, self.cipher.as_ref())?,
                    author: parse_joined_user(r)?,
                })
            })
            .collect::<Result<_>>()?;

        messages.reverse();
        Ok(messages)
    }

    pub async fn update_message(
        &self,
        message_id: Uuid,
        content: &str,
        nonce: &str,
        encryption_header: &str,
    ) -> Result<()> {
        let (content, nonce, header) = self.wrap_blobs(content, nonce, encryption_header)?;

        sqlx::query(
            "UPDATE messages SET content = ?, nonce = ?, encryption_header = ?, is_edited = 1, updated_at = ? WHERE id = ?",
        )
        .bind(&content)
        .bind(&nonce)
        .bind(&header)
        .bind(now_ms())
        .bind(message_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update message")?;
        Ok(())
    }

    pub async fn soft_delete_message(&self, message_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE messages SET deleted_at = ? WHERE id = ?")
            .bind(now_ms())
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete message")?;
        Ok(())
    }

    fn wrap_blobs(
        &self,
        content: &str,
        nonce: &str,
        header: &str,
    ) -> Result<(String, String, String)> {
        match &self.cipher {
            Some(cipher) => Ok((
                cipher.wrap(content)?,
                cipher.wrap(nonce)?,
                cipher.wrap(header)?,
            )),
            None => Ok((content.to_string(), nonce.to_string(), header.to_string())),
        }
    }

    // ── Voice states ──

    /// Move a user into a voice channel: any prior row for the user is
    /// removed in the same transaction, keeping at most one row per user.
    pub async fn upsert_voice_state(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        server_id: Uuid,
    ) -> Result<VoiceState> {
        let state = VoiceState {
            id: Uuid::new_v4(),
            user_id,
            channel_id,
            server_id,
            joined_at: now_ms(),
        };

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query("DELETE FROM voice_states WHERE user_id = ?")
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to clear prior voice state")?;

        sqlx::query(
            "INSERT INTO voice_states (id, user_id, channel_id, server_id, joined_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(state.id.to_string())
        .bind(user_id.to_string())
        .bind(channel_id.to_string())
        .bind(server_id.to_string())
        .bind(state.joined_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert voice state")?;

        tx.commit().await.context("Failed to commit voice join")?;
        Ok(state)
    }

    pub async fn delete_voice_state(&self, user_id: Uuid, channel_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM voice_states WHERE user_id = ? AND channel_id = ?")
            .bind(user_id.to_string())
            .bind(channel_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete voice state")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_voice_state_for_user(&self, user_id: Uuid) -> Result<Option<VoiceState>> {
        let row = sqlx::query("SELECT * FROM voice_states WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query voice state")?;

        row.map(|r| parse_voice_state(&r)).transpose()
    }

    pub async fn delete_voice_states_for_user(&self, user_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM voice_states WHERE user_id = ?")
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to clear voice states")?;
        Ok(())
    }

    pub async fn get_channel_voice_states(
        &self,
        channel_id: Uuid,
    ) -> Result<Vec<VoiceStateWithUser>> {
        let rows = sqlx::query(&format!(
            "SELECT v.*, {USER_ALIASES} FROM voice_states v \
             JOIN users u ON u.id = v.user_id \
             WHERE v.channel_id = ? ORDER BY v.joined_at ASC"
        ))
        .bind(channel_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query channel voice states")?;

        rows.iter()
            .map(|r| {
                Ok(VoiceStateWithUser {
                    state: parse_voice_state(r)?,
                    user: parse_joined_user(r)?,
                })
            })
            .collect()
    }

    // ── Invites ──

    pub async fn create_invite(
        &self,
        code: &str,
        server_id: Uuid,
        creator_id: Uuid,
        max_uses: i64,
        expires_at: Option<i64>,
    ) -> Result<Invite> {
        let invite = Invite {
            id: Uuid::new_v4(),
            code: code.to_string(),
            server_id,
            creator_id,
            max_uses,
            uses: 0,
            expires_at,
            created_at: now_ms(),
        };

        sqlx::query(
            "INSERT INTO invites (id, code, server_id, creator_id, max_uses, uses, expires_at, created_at) \
             VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(invite.id.to_string())
        .bind(code)
        .bind(server_id.to_string())
        .bind(creator_id.to_string())
        .bind(max_uses)
        .bind(expires_at)
        .bind(invite.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert invite")?;

        Ok(invite)
    }

    pub async fn get_invite_by_code(&self, code: &str) -> Result<Option<Invite>> {
        let row = sqlx::query("SELECT * FROM invites WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query invite")?;

        row.map(|r| parse_invite(&r)).transpose()
    }

    pub async fn increment_invite_uses(&self, invite_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE invites SET uses = uses + 1 WHERE id = ?")
            .bind(invite_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to increment invite uses")?;
        Ok(())
    }
}

// Aliased user columns for JOINs; the joined row is parsed by
// `parse_joined_user`.
const USER_ALIASES: &str = "u.id AS u_id, u.username AS u_username, u.display_name AS u_display_name, \
     u.avatar_url AS u_avatar_url, u.status AS u_status, u.bio AS u_bio";

const DM_USER_ALIASES: &str = "u1.id AS u1_id, u1.username AS u1_username, u1.display_name AS u1_display_name, \
     u1.avatar_url AS u1_avatar_url, u1.status AS u1_status, u1.bio AS u1_bio, \
     u2.id AS u2_id, u2.username AS u2_username, u2.display_name AS u2_display_name, \
     u2.avatar_url AS u2_avatar_url, u2.status AS u2_status, u2.bio AS u2_bio";

// ── Row parsers ──

fn parse_uuid(row: &SqliteRow, column: &str) -> Result<Uuid> {
    Uuid::parse_str(&row.get::<String, _>(column))
        .with_context(|| format!("invalid uuid in column {column}"))
}

fn parse_user(row: &SqliteRow) -> Result<User> {
    let status: String = row.get("status");
    Ok(User {
        id: parse_uuid(row, "id")?,
        username: row.get("username"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        display_name: row.get("display_name"),
        avatar_url: row.get("avatar_url"),
        status: PresenceStatus::from_str(&status).unwrap_or(PresenceStatus::Offline),
        bio: row.get("bio"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn parse_joined_user(row: &SqliteRow) -> Result<PublicUser> {
    let status: String = row.get("u_status");
    Ok(PublicUser {
        id: parse_uuid(row, "u_id")?,
        username: row.get("u_username"),
        display_name: row.get("u_display_name"),
        avatar_url: row.get("u_avatar_url"),
        status: PresenceStatus::from_str(&status).unwrap_or(PresenceStatus::Offline),
        bio: row.get("u_bio"),
    })
}

fn parse_public_key(row: &SqliteRow) -> Result<UserPublicKey> {
    let key_type: String = row.get("key_type");
    Ok(UserPublicKey {
        id: parse_uuid(row, "id")?,
        user_id: parse_uuid(row, "user_id")?,
        key_type: KeyType::from_str(&key_type)
            .with_context(|| format!("invalid key type: {key_type}"))?,
        public_key: row.get("public_key"),
        key_id: row.get("key_id"),
        signature: row.get("signature"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
    })
}

fn parse_server(row: &SqliteRow) -> Result<Server> {
    Ok(Server {
        id: parse_uuid(row, "id")?,
        name: row.get("name"),
        description: row.get("description"),
        icon_url: row.get("icon_url"),
        owner_id: parse_uuid(row, "owner_id")?,
        invite_code: row.get("invite_code"),
        is_private: row.get("is_private"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn parse_member(row: &SqliteRow) -> Result<ServerMember> {
    let role: String = row.get("role");
    Ok(ServerMember {
        id: parse_uuid(row, "id")?,
        server_id: parse_uuid(row, "server_id")?,
        user_id: parse_uuid(row, "user_id")?,
        role: Role::from_str(&role).with_context(|| format!("invalid role: {role}"))?,
        nickname: row.get("nickname"),
        joined_at: row.get("joined_at"),
    })
}

fn parse_channel(row: &SqliteRow) -> Result<Channel> {
    let kind: String = row.get("kind");
    Ok(Channel {
        id: parse_uuid(row, "id")?,
        server_id: parse_uuid(row, "server_id")?,
        name: row.get("name"),
        topic: row.get("topic"),
        kind: ChannelKind::from_str(&kind)
            .with_context(|| format!("invalid channel kind: {kind}"))?,
        position: row.get("position"),
        is_private: row.get("is_private"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn parse_dm_channel(row: &SqliteRow) -> Result<DmChannel> {
    Ok(DmChannel {
        id: parse_uuid(row, "id")?,
        user1_id: parse_uuid(row, "user1_id")?,
        user2_id: parse_uuid(row, "user2_id")?,
        created_at: row.get("created_at"),
    })
}

fn parse_dm_with_users(row: &SqliteRow) -> Result<DmChannelWithUsers> {
    let status1: String = row.get("u1_status");
    let status2: String = row.get("u2_status");
    Ok(DmChannelWithUsers {
        channel: parse_dm_channel(row)?,
        user1: PublicUser {
            id: parse_uuid(row, "u1_id")?,
            username: row.get("u1_username"),
            display_name: row.get("u1_display_name"),
            avatar_url: row.get("u1_avatar_url"),
            status: PresenceStatus::from_str(&status1).unwrap_or(PresenceStatus::Offline),
            bio: row.get("u1_bio"),
        },
        user2: PublicUser {
            id: parse_uuid(row, "u2_id")?,
            username: row.get("u2_username"),
            display_name: row.get("u2_display_name"),
            avatar_url: row.get("u2_avatar_url"),
            status: PresenceStatus::from_str(&status2).unwrap_or(PresenceStatus::Offline),
            bio: row.get("u2_bio"),
        },
    })
}

fn parse_message(row: &SqliteRow, cipher: Option<&AtRestCipher>) -> Result<Message> {
    let kind: String = row.get("kind");
    let unwrap = |value: String| -> Result<String> {
        match cipher {
            Some(c) => c.unwrap(&value),
            None => Ok(value),
        }
    };

    Ok(Message {
        id: parse_uuid(row, "id")?,
        channel_id: parse_uuid(row, "channel_id")?,
        author_id: parse_uuid(row, "author_id")?,
        content: unwrap(row.get("content"))?,
        nonce: unwrap(row.get("nonce"))?,
        encryption_header: unwrap(row.get("encryption_header"))?,
        kind: MessageKind::from_str(&kind)
            .with_context(|| format!("invalid message kind: {kind}"))?,
        attachment_url: row.get("attachment_url"),
        reply_to_id: row
            .get::<Option<String>, _>("reply_to_id")
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .context("invalid reply_to_id")?,
        is_edited: row.get("is_edited"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn parse_voice_state(row: &SqliteRow) -> Result<VoiceState> {
    Ok(VoiceState {
        id: parse_uuid(row, "id")?,
        user_id: parse_uuid(row, "user_id")?,
        channel_id: parse_uuid(row, "channel_id")?,
        server_id: parse_uuid(row, "server_id")?,
        joined_at: row.get("joined_at"),
    })
}

fn parse_invite(row: &SqliteRow) -> Result<Invite> {
    Ok(Invite {
        id: parse_uuid(row, "id")?,
        code: row.get("code"),
        server_id: parse_uuid(row, "server_id")?,
        creator_id: parse_uuid(row, "creator_id")?,
        max_uses: row.get("max_uses"),
        uses: row.get("uses"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
    })
}
