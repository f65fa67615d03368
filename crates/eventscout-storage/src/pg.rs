//! Postgres-backed [`EventStore`].

use std::time::Duration;

use async_trait::async_trait;
use eventscout_core::{
    Event, EventCandidate, EventDetail, EventType, NewEvent, RefreshCandidate, ScrapedDetail,
};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};

use crate::dedup::{self, RowWrite, UpsertTarget};
use crate::{
    BatchOutcome, DetailWrite, EventStore, PlatformCount, StoreError, StoreStats,
};

pub static MIGRATOR: Migrator = sqlx::migrate!();

#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

/// One batch transaction; every row runs inside its own savepoint.
struct PgBatch {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UpsertTarget for PgBatch {
    async fn find_by_hash(&mut self, hash: &str) -> Result<Option<i64>, StoreError> {
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM events WHERE hash = $1")
            .bind(hash)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(id)
    }

    async fn find_by_website(&mut self, website: &str) -> Result<Option<i64>, StoreError> {
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM events WHERE website = $1")
            .bind(website)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(id)
    }

    async fn update_event(&mut self, id: i64, event: &NewEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE events
               SET event_name = $1,
                   location = $2,
                   date_time = $3,
                   date = $4,
                   time = $5,
                   website = $6,
                   description = $7,
                   address = $8,
                   event_type = $9,
                   updated_at = NOW()
             WHERE id = $10
            "#,
        )
        .bind(&event.name)
        .bind(&event.location)
        .bind(&event.date_time)
        .bind(&event.date)
        .bind(&event.time)
        .bind(&event.website)
        .bind(&event.description)
        .bind(&event.address)
        .bind(event.event_type.as_str())
        .bind(id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_event(&mut self, event: &NewEvent) -> Result<RowWrite, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO events (
                event_name, location, date_time, date, time,
                website, description, address, event_type, platform, hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (hash) DO UPDATE SET
                event_name = EXCLUDED.event_name,
                location = EXCLUDED.location,
                date_time = EXCLUDED.date_time,
                date = EXCLUDED.date,
                time = EXCLUDED.time,
                website = EXCLUDED.website,
                description = EXCLUDED.description,
                address = EXCLUDED.address,
                event_type = EXCLUDED.event_type,
                updated_at = NOW()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&event.name)
        .bind(&event.location)
        .bind(&event.date_time)
        .bind(&event.date)
        .bind(&event.time)
        .bind(&event.website)
        .bind(&event.description)
        .bind(&event.address)
        .bind(event.event_type.as_str())
        .bind(&event.platform)
        .bind(&event.hash)
        .fetch_one(&mut *self.tx)
        .await?;

        let id: i64 = row.try_get("id")?;
        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            RowWrite::Inserted(id)
        } else {
            RowWrite::Updated(id)
        })
    }

    async fn begin_row(&mut self) -> Result<(), StoreError> {
        sqlx::query("SAVEPOINT event_row")
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit_row(&mut self) -> Result<(), StoreError> {
        sqlx::query("RELEASE SAVEPOINT event_row")
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn rollback_row(&mut self) -> Result<(), StoreError> {
        sqlx::query("ROLLBACK TO SAVEPOINT event_row")
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn upsert_batch(&self, candidates: Vec<EventCandidate>) -> Result<BatchOutcome, StoreError> {
        if candidates.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let mut batch = PgBatch {
            tx: self.pool.begin().await?,
        };
        let outcome = dedup::upsert_all(&mut batch, candidates).await;
        batch.tx.commit().await?;
        debug!(?outcome, "event batch committed");
        Ok(outcome)
    }

    async fn upsert_detail(&self, detail: &ScrapedDetail) -> Result<DetailWrite, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM events WHERE id = $1)")
            .bind(detail.event_id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Err(StoreError::UnknownEvent {
                event_id: detail.event_id,
            });
        }

        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO event_details (
                event_id, full_description, organizer, organizer_contact, image_url,
                tags, price, registration_url, duration, agenda_html,
                speakers_json, prerequisites, max_attendees, attendees_count, scraped_body,
                last_scraped
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                full_description = EXCLUDED.full_description,
                organizer = EXCLUDED.organizer,
                organizer_contact = EXCLUDED.organizer_contact,
                image_url = EXCLUDED.image_url,
                tags = EXCLUDED.tags,
                price = EXCLUDED.price,
                registration_url = EXCLUDED.registration_url,
                duration = EXCLUDED.duration,
                agenda_html = EXCLUDED.agenda_html,
                speakers_json = EXCLUDED.speakers_json,
                prerequisites = EXCLUDED.prerequisites,
                max_attendees = EXCLUDED.max_attendees,
                attendees_count = EXCLUDED.attendees_count,
                scraped_body = EXCLUDED.scraped_body,
                last_scraped = GREATEST(NOW(), event_details.last_scraped + INTERVAL '1 millisecond'),
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(detail.event_id)
        .bind(&detail.full_description)
        .bind(&detail.organizer)
        .bind(&detail.organizer_contact)
        .bind(&detail.image_url)
        .bind(detail.tags_text())
        .bind(&detail.price)
        .bind(&detail.registration_url)
        .bind(&detail.duration)
        .bind(&detail.agenda_html)
        .bind(detail.speakers_json())
        .bind(&detail.prerequisites)
        .bind(detail.max_attendees)
        .bind(detail.attendees_count)
        .bind(&detail.scraped_body)
        .fetch_one(&self.pool)
        .await?;

        Ok(if inserted {
            DetailWrite::Inserted
        } else {
            DetailWrite::Updated
        })
    }

    async fn refresh_candidates(
        &self,
        stale_after: chrono::Duration,
        limit: Option<i64>,
    ) -> Result<Vec<RefreshCandidate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.event_name, e.website, e.platform, e.location
              FROM events e
              LEFT JOIN event_details ed ON ed.event_id = e.id
             WHERE e.website IS NOT NULL
               AND e.website <> ''
               AND e.website NOT LIKE '%javascript:%'
               AND e.website NOT LIKE '%#%'
               AND (ed.id IS NULL OR ed.last_scraped < NOW() - make_interval(secs => $1))
             ORDER BY e.created_at DESC, e.id DESC
             LIMIT $2
            "#,
        )
        .bind(stale_after.num_seconds() as f64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(RefreshCandidate {
                    event_id: row.try_get("id")?,
                    name: row.try_get("event_name")?,
                    website: row.try_get("website")?,
                    platform: row.try_get("platform")?,
                    location: row.try_get("location")?,
                })
            })
            .collect()
    }

    async fn get_detail(&self, event_id: i64) -> Result<Option<EventDetail>, StoreError> {
        let row = sqlx::query("SELECT * FROM event_details WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(detail_from_row).transpose()
    }

    async fn recent_events(&self, limit: i64) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query("SELECT * FROM events ORDER BY created_at DESC, id DESC LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let total_events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query(
            r#"
            SELECT platform, COUNT(*) AS events
              FROM events
             GROUP BY platform
             ORDER BY events DESC, platform
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let platforms = rows
            .iter()
            .map(|row| {
                Ok(PlatformCount {
                    platform: row.try_get("platform")?,
                    events: row.try_get("events")?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(StoreStats {
            total_events,
            platforms,
        })
    }
}

fn event_from_row(row: &PgRow) -> Result<Event, StoreError> {
    let event_type: String = row.try_get("event_type")?;
    Ok(Event {
        id: row.try_get("id")?,
        name: row.try_get("event_name")?,
        location: row.try_get("location")?,
        date_time: row.try_get("date_time")?,
        date: row.try_get("date")?,
        time: row.try_get("time")?,
        website: row.try_get("website")?,
        description: row.try_get("description")?,
        address: row.try_get("address")?,
        event_type: parse_event_type(&event_type)?,
        platform: row.try_get("platform")?,
        hash: row.try_get("hash")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn detail_from_row(row: &PgRow) -> Result<EventDetail, StoreError> {
    Ok(EventDetail {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        full_description: row.try_get("full_description")?,
        organizer: row.try_get("organizer")?,
        organizer_contact: row.try_get("organizer_contact")?,
        image_url: row.try_get("image_url")?,
        tags: row.try_get("tags")?,
        price: row.try_get("price")?,
        registration_url: row.try_get("registration_url")?,
        duration: row.try_get("duration")?,
        agenda_html: row.try_get("agenda_html")?,
        speakers_json: row.try_get("speakers_json")?,
        prerequisites: row.try_get("prerequisites")?,
        max_attendees: row.try_get("max_attendees")?,
        attendees_count: row.try_get("attendees_count")?,
        last_scraped: row.try_get("last_scraped")?,
        scraped_body: row.try_get("scraped_body")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Decodes a stored classification, rejecting values the crawler never writes.
fn parse_event_type(value: &str) -> Result<EventType, StoreError> {
    EventType::parse(value).ok_or_else(|| StoreError::Decode {
        column: "event_type",
        value: value.to_string(),
    })
}
