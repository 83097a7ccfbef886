//! Authoritative relational timeline store (module C).
//!
//! Schema: `users`, `posts`, `follows`, `timeline` as laid out in
//! `migrations/0001_init.sql`. This module never mutates `users`/`posts`/
//! `follows` — those are owned by an external collaborator; it only reads
//! them to denormalize timeline rows and writes `timeline` itself.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use crate::errors::CoreError;

pub type StorePool = Pool<Postgres>;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TimelineEntry {
    pub post_id: i64,
    pub body: String,
    pub author_id: i64,
    pub author_username: String,
    pub ts: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TimelineStore {
    pool: StorePool,
    cap: i64,
}

impl TimelineStore {
    pub fn new(pool: StorePool, cap: i64) -> Self {
        Self { pool, cap }
    }

    /// Idempotent insert keyed on `(user_id, post_id)`. A duplicate insert
    /// is treated as success, not an error, since replays after a nacked
    /// message are expected and must be harmless.
    pub async fn insert_entry(
        &self,
        user_id: i64,
        post_id: i64,
        ts: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO timeline (user_id, post_id, created_at) VALUES ($1, $2, $3)
             ON CONFLICT (user_id, post_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(post_id)
        .bind(ts)
        .execute(tx.as_mut())
        .await?;

        let inserted = result.rows_affected() > 0;

        if inserted {
            self.trim_locked(&mut tx, user_id).await?;
        }

        tx.commit().await?;

        Ok(inserted)
    }

    /// Trims `user_id`'s timeline to `cap` entries, stable-ordered by
    /// `created_at DESC, id DESC`, so concurrent trims for other users
    /// never block on this one (the transaction only touches this user's
    /// rows).
    async fn trim_locked(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        user_id: i64,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "DELETE FROM timeline
             WHERE user_id = $1
               AND id NOT IN (
                   SELECT id FROM timeline
                   WHERE user_id = $1
                   ORDER BY created_at DESC, id DESC
                   LIMIT $2
               )",
        )
        .bind(user_id)
        .bind(self.cap)
        .execute(tx.as_mut())
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn trim(&self, user_id: i64) -> Result<u64, CoreError> {
        let mut tx = self.pool.begin().await?;
        let trimmed = self.trim_locked(&mut tx, user_id).await?;
        tx.commit().await?;
        Ok(trimmed)
    }

    /// Newest-first denormalized page, joined against `posts`/`users`.
    pub async fn read_range(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TimelineEntry>, CoreError> {
        let rows = sqlx::query_as::<_, TimelineEntry>(
            "SELECT p.id AS post_id, p.body, p.author_id, u.username AS author_username, t.created_at AS ts
             FROM timeline t
             JOIN posts p ON p.id = t.post_id
             JOIN users u ON u.id = p.author_id
             WHERE t.user_id = $1
             ORDER BY t.created_at DESC, t.id DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Atomic delete-then-repopulate: the caller's subscriber timeline is
    /// recomputed from the posts of everyone they follow (plus their own
    /// posts), capped at `cap`, newest first. Runs in a single transaction
    /// so no reader observes a partially-purged state.
    pub async fn rebuild(&self, user_id: i64) -> Result<u64, CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM timeline WHERE user_id = $1")
            .bind(user_id)
            .execute(tx.as_mut())
            .await?;

        let result = sqlx::query(
            "INSERT INTO timeline (user_id, post_id, created_at)
             SELECT $1, p.id, p.created_at
             FROM posts p
             WHERE p.author_id = $1
                OR p.author_id IN (
                    SELECT followed_id FROM follows WHERE follower_id = $1
                )
             ORDER BY p.created_at DESC, p.id DESC
             LIMIT $2
             ON CONFLICT (user_id, post_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(self.cap)
        .execute(tx.as_mut())
        .await?;

        tx.commit().await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    async fn seed_user(pool: &PgPool, id: i64, username: &str) {
        sqlx::query("INSERT INTO users (id, username, email) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(username)
            .bind(format!("{username}@example.com"))
            .execute(pool)
            .await
            .expect("seed user");
    }

    async fn seed_post(pool: &PgPool, id: i64, author_id: i64, body: &str, ts: DateTime<Utc>) {
        sqlx::query("INSERT INTO posts (id, author_id, body, created_at) VALUES ($1, $2, $3, $4)")
            .bind(id)
            .bind(author_id)
            .bind(body)
            .bind(ts)
            .execute(pool)
            .await
            .expect("seed post");
    }

    #[sqlx::test]
    async fn insert_entry_is_idempotent(pool: PgPool) -> sqlx::Result<()> {
        seed_user(&pool, 1, "alice").await;
        seed_user(&pool, 2, "bob").await;
        seed_post(&pool, 100, 1, "hi", Utc::now()).await;

        let store = TimelineStore::new(pool, 1000);
        let first = store.insert_entry(2, 100, Utc::now()).await.unwrap();
        let second = store.insert_entry(2, 100, Utc::now()).await.unwrap();

        assert!(first);
        assert!(!second);

        let page = store.read_range(2, 10, 0).await.unwrap();
        assert_eq!(page.len(), 1);
        Ok(())
    }

    #[sqlx::test]
    async fn trim_keeps_cap_newest_entries(pool: PgPool) -> sqlx::Result<()> {
        seed_user(&pool, 1, "alice").await;
        seed_user(&pool, 2, "bob").await;

        let store = TimelineStore::new(pool.clone(), 3);
        for i in 0..5 {
            let ts = Utc::now() + chrono::Duration::seconds(i);
            seed_post(&pool, 100 + i, 1, "hi", ts).await;
            store.insert_entry(2, 100 + i, ts).await.unwrap();
        }

        let page = store.read_range(2, 10, 0).await.unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].post_id, 104);
        assert_eq!(page[2].post_id, 102);
        Ok(())
    }

    #[sqlx::test]
    async fn rebuild_reflects_current_follow_graph(pool: PgPool) -> sqlx::Result<()> {
        seed_user(&pool, 1, "alice").await;
        seed_user(&pool, 2, "bob").await;
        seed_user(&pool, 3, "carol").await;
        seed_post(&pool, 100, 1, "from alice", Utc::now()).await;
        seed_post(&pool, 101, 3, "from carol", Utc::now()).await;

        sqlx::query("INSERT INTO follows (follower_id, followed_id) VALUES ($1, $2)")
            .bind(2_i64)
            .bind(1_i64)
            .execute(&pool)
            .await
            .unwrap();

        let store = TimelineStore::new(pool, 1000);
        store.rebuild(2).await.unwrap();

        let page = store.read_range(2, 10, 0).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].post_id, 100);
        Ok(())
    }
}
