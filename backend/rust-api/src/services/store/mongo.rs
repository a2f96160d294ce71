use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use mongodb::{
    bson::{doc, to_bson, Bson, Document},
    options::{IndexOptions, ReturnDocument},
    Collection, Database, IndexModel,
};
use redis::aio::ConnectionManager;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::{
    call_channel, incoming_channel, session_channel, Feed, SeedSummary, TutorStore, Update,
};
use crate::config::Config;
use crate::metrics::{track_db_operation, FEED_PUBLISH_TOTAL};
use crate::models::progress::{next_level, topic_xp, BeginnerProgress};
use crate::models::{
    BeginnerTopic, Call, CallPatch, CallStatus, NewCall, NewSession, Problem, SeedContent,
    SessionPatch, SessionStatus, Topic, TutorAvailability, TutoringSession, UserProgress,
};
use crate::utils::retry::{retry_async_with_config, RetryConfig};

const CALLS: &str = "calls";
const SESSIONS: &str = "tutoring_sessions";
const TOPICS: &str = "topics";
const PROBLEMS: &str = "problems";
const BEGINNER_TOPICS: &str = "beginner_topics";
const USER_PROGRESS: &str = "user_progress";
const TUTORS: &str = "tutor_availability";

/// MongoDB documents with change feeds carried over Redis pub/sub. Every
/// call or session write publishes the written snapshot.
#[derive(Clone)]
pub struct MongoStore {
    db: Database,
    redis: ConnectionManager,
    redis_client: redis::Client,
}

impl MongoStore {
    pub async fn connect(config: &Config) -> Result<Self> {
        let mongo_client = mongodb::Client::with_uri_str(&config.mongo_uri)
            .await
            .context("Failed to connect to MongoDB")?;
        let db = mongo_client.database(&config.mongo_database);
        tracing::info!("MongoDB connected");

        let redis_client =
            redis::Client::open(config.redis_uri.clone()).context("Invalid Redis URI")?;

        tracing::info!("Attempting to connect to Redis...");
        let redis = tokio::time::timeout(
            Duration::from_secs(30),
            ConnectionManager::new(redis_client.clone()),
        )
        .await
        .map_err(|_| anyhow!("Redis connection timeout after 30s"))??;

        let mut conn = redis.clone();
        tokio::time::timeout(
            Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow!("Redis PING timeout after 5s"))??;
        tracing::info!("Redis connection established successfully");

        let store = Self {
            db,
            redis,
            redis_client,
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> Result<()> {
        let unique = |field: &str| {
            IndexModel::builder()
                .keys(keyed(field, 1_i32))
                .options(IndexOptions::builder().unique(true).build())
                .build()
        };

        for collection in [CALLS, SESSIONS, TOPICS, PROBLEMS, BEGINNER_TOPICS] {
            self.db
                .collection::<Document>(collection)
                .create_index(unique("id"))
                .await
                .with_context(|| format!("Failed to index {}", collection))?;
        }
        self.db
            .collection::<Document>(USER_PROGRESS)
            .create_index(unique("user_id"))
            .await
            .context("Failed to index user_progress")?;
        self.db
            .collection::<Document>(TUTORS)
            .create_index(unique("uid"))
            .await
            .context("Failed to index tutor_availability")?;
        self.db
            .collection::<Document>(CALLS)
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "target_id": 1, "status": 1 })
                    .build(),
            )
            .await
            .context("Failed to index calls by target")?;

        tracing::info!("MongoDB indexes ensured");
        Ok(())
    }

    fn calls(&self) -> Collection<Call> {
        self.db.collection(CALLS)
    }

    fn sessions(&self) -> Collection<TutoringSession> {
        self.db.collection(SESSIONS)
    }

    /// Failures are logged and counted; the write itself already landed.
    async fn publish<T: Serialize + Sync>(&self, kind: &str, channel: String, snapshot: &T) {
        let result = match serde_json::to_string(snapshot) {
            Ok(payload) => {
                retry_async_with_config(RetryConfig::default(), || {
                    let mut conn = self.redis.clone();
                    let channel = channel.clone();
                    let payload = payload.clone();
                    async move {
                        redis::cmd("PUBLISH")
                            .arg(&channel)
                            .arg(payload)
                            .query_async::<()>(&mut conn)
                            .await
                            .context("Failed to publish to Redis Pub/Sub")
                    }
                })
                .await
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => {
                FEED_PUBLISH_TOTAL.with_label_values(&[kind, "success"]).inc();
                tracing::debug!("Published snapshot: channel={}", channel);
            }
            Err(e) => {
                FEED_PUBLISH_TOTAL.with_label_values(&[kind, "error"]).inc();
                tracing::warn!("Feed publish failed: channel={}, error={:#}", channel, e);
            }
        }
    }

    async fn publish_call(&self, call: &Call) {
        self.publish("call", call_channel(&call.id), call).await;
        self.publish("incoming", incoming_channel(&call.target_id), &call.id)
            .await;
    }

    async fn subscribe(&self, channel: String) -> Result<redis::aio::PubSub> {
        let mut pubsub = self
            .redis_client
            .get_async_pubsub()
            .await
            .context("Failed to open Redis pub/sub connection")?;
        pubsub
            .subscribe(&channel)
            .await
            .with_context(|| format!("Failed to subscribe to {}", channel))?;
        Ok(pubsub)
    }

    async fn find_all<T>(&self, collection: &str, filter: Document, sort: Document) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Unpin + Send + Sync,
    {
        track_db_operation("find", collection, async {
            self.db
                .collection::<T>(collection)
                .find(filter)
                .sort(sort)
                .await?
                .try_collect()
                .await
                .with_context(|| format!("Failed to read {}", collection))
        })
        .await
    }

    async fn find_by_id<T>(&self, collection: &str, field: &str, id: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Unpin + Send + Sync,
    {
        track_db_operation("find_one", collection, async {
            self.db
                .collection::<T>(collection)
                .find_one(keyed(field, id))
                .await
                .with_context(|| format!("Failed to read {} {}", collection, id))
        })
        .await
    }

    async fn upsert_by<T>(&self, collection: &str, field: &str, id: &str, value: &T) -> Result<()>
    where
        T: Serialize + Send + Sync,
    {
        track_db_operation("replace_one", collection, async {
            self.db
                .collection::<T>(collection)
                .replace_one(keyed(field, id), value)
                .upsert(true)
                .await
                .with_context(|| format!("Failed to upsert {} {}", collection, id))?;
            Ok(())
        })
        .await
    }
}

fn keyed(field: &str, value: impl Into<Bson>) -> Document {
    let mut document = Document::new();
    document.insert(field, value);
    document
}

fn timestamp() -> Result<Bson> {
    to_bson(&Utc::now()).context("Failed to encode timestamp")
}

#[async_trait]
impl TutorStore for MongoStore {
    async fn create_call(&self, call: NewCall) -> Result<Call> {
        let now = Utc::now();
        let call = Call {
            id: Uuid::new_v4().to_string(),
            initiator_id: call.initiator_id,
            initiator_name: call.initiator_name,
            target_id: call.target_id,
            topic_id: call.topic_id,
            session_id: call.session_id,
            audio_room: call.audio_room,
            status: CallStatus::Ringing,
            ended_by: None,
            created_at: now,
            updated_at: now,
        };

        track_db_operation("insert_one", CALLS, async {
            self.calls()
                .insert_one(&call)
                .await
                .context("Failed to insert call")?;
            Ok(())
        })
        .await?;

        self.publish_call(&call).await;
        Ok(call)
    }

    async fn get_call(&self, call_id: &str) -> Result<Option<Call>> {
        self.find_by_id(CALLS, "id", call_id).await
    }

    async fn update_call(&self, call_id: &str, patch: CallPatch) -> Result<Update<Call>> {
        let mut set = doc! { "updated_at": timestamp()? };
        let mut filter = doc! { "id": call_id };
        if let Some(next) = patch.status {
            let allowed: Vec<&str> = next.predecessors().into_iter().map(|s| s.as_str()).collect();
            filter.insert("status", doc! { "$in": allowed });
            set.insert("status", next.as_str());
        }
        if let Some(ended_by) = &patch.ended_by {
            set.insert("ended_by", ended_by.as_str());
        }

        let updated = track_db_operation("find_one_and_update", CALLS, async {
            self.calls()
                .find_one_and_update(filter, doc! { "$set": set })
                .return_document(ReturnDocument::After)
                .await
                .context("Failed to update call")
        })
        .await?;

        match updated {
            Some(call) => {
                self.publish_call(&call).await;
                Ok(Update::Applied(call))
            }
            None => Ok(match self.get_call(call_id).await? {
                Some(current) => Update::Rejected(current),
                None => Update::NotFound,
            }),
        }
    }

    async fn ringing_calls_for(&self, target_id: &str) -> Result<Vec<Call>> {
        self.find_all(
            CALLS,
            doc! { "target_id": target_id, "status": CallStatus::Ringing.as_str() },
            doc! { "created_at": 1 },
        )
        .await
    }

    async fn watch_call(&self, call_id: &str) -> Result<Feed<Call>> {
        let pubsub = self.subscribe(call_channel(call_id)).await?;
        let initial = self.get_call(call_id).await?;
        let updates = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str::<Call>(&payload).ok()
        });
        Ok(stream::iter(initial).chain(updates).boxed())
    }

    async fn watch_incoming_calls(&self, target_id: &str) -> Result<Feed<Vec<Call>>> {
        let pubsub = self.subscribe(incoming_channel(target_id)).await?;
        let initial = self.ringing_calls_for(target_id).await?;
        let store = self.clone();
        let target = target_id.to_string();
        let updates = pubsub.into_on_message().filter_map(move |_| {
            let store = store.clone();
            let target = target.clone();
            async move {
                match store.ringing_calls_for(&target).await {
                    Ok(calls) => Some(calls),
                    Err(e) => {
                        tracing::warn!("Incoming-call refresh failed: {:#}", e);
                        None
                    }
                }
            }
        });
        Ok(stream::once(async move { initial }).chain(updates).boxed())
    }

    async fn create_session(&self, session: NewSession) -> Result<TutoringSession> {
        let now = Utc::now();
        let session = TutoringSession {
            id: Uuid::new_v4().to_string(),
            student_id: session.student_id,
            tutor_id: session.tutor_id,
            topic_id: session.topic_id,
            status: SessionStatus::Calling,
            audio_room: session.audio_room,
            editor_room: session.editor_room,
            questions: Vec::new(),
            current_question_index: 0,
            current_difficulty: Default::default(),
            correct_count: 0,
            total_score: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        track_db_operation("insert_one", SESSIONS, async {
            self.sessions()
                .insert_one(&session)
                .await
                .context("Failed to insert session")?;
            Ok(())
        })
        .await?;

        self.publish("session", session_channel(&session.id), &session)
            .await;
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<TutoringSession>> {
        self.find_by_id(SESSIONS, "id", session_id).await
    }

    async fn update_session(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<Update<TutoringSession>> {
        let mut filter = doc! { "id": session_id };
        if let Some(required) = patch.require_status {
            filter.insert("status", required.as_str());
        }

        let mut set = doc! { "updated_at": timestamp()? };
        if let Some(status) = patch.status {
            set.insert("status", status.as_str());
        }
        if let Some(index) = patch.current_question_index {
            set.insert("current_question_index", i64::from(index));
        }
        if let Some(difficulty) = patch.current_difficulty {
            set.insert("current_difficulty", difficulty.as_str());
        }
        if let Some(correct) = patch.correct_count {
            set.insert("correct_count", i64::from(correct));
        }
        if let Some(score) = patch.total_score {
            set.insert("total_score", i64::from(score));
        }
        if let Some(at) = patch.completed_at {
            set.insert(
                "completed_at",
                to_bson(&at).context("Failed to encode completed_at")?,
            );
        }

        let mut update = doc! { "$set": set };
        if let Some(record) = &patch.append_question {
            update.insert(
                "$push",
                doc! { "questions": to_bson(record).context("Failed to encode question record")? },
            );
        }

        let updated = track_db_operation("find_one_and_update", SESSIONS, async {
            self.sessions()
                .find_one_and_update(filter, update)
                .return_document(ReturnDocument::After)
                .await
                .context("Failed to update session")
        })
        .await?;

        match updated {
            Some(session) => {
                self.publish("session", session_channel(&session.id), &session)
                    .await;
                Ok(Update::Applied(session))
            }
            None => Ok(match self.get_session(session_id).await? {
                Some(current) => Update::Rejected(current),
                None => Update::NotFound,
            }),
        }
    }

    async fn watch_session(&self, session_id: &str) -> Result<Feed<TutoringSession>> {
        let pubsub = self.subscribe(session_channel(session_id)).await?;
        let initial = self.get_session(session_id).await?;
        let updates = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str::<TutoringSession>(&payload).ok()
        });
        Ok(stream::iter(initial).chain(updates).boxed())
    }

    async fn get_user_progress(&self, user_id: &str) -> Result<UserProgress> {
        Ok(self
            .find_by_id(USER_PROGRESS, "user_id", user_id)
            .await?
            .unwrap_or_else(|| UserProgress::empty(user_id)))
    }

    async fn complete_level(
        &self,
        user_id: &str,
        topic_id: &str,
        level: u8,
        score: u32,
    ) -> Result<UserProgress> {
        let field = format!("progress.{}", topic_id);
        let mut set = Document::new();
        set.insert(
            format!("{}.current_level", field),
            i32::from(next_level(level)),
        );
        let mut inc = Document::new();
        inc.insert(format!("{}.levels_completed", field), 1_i64);
        inc.insert(format!("{}.total_score", field), i64::from(score));
        inc.insert("total_xp", i64::from(score));

        track_db_operation("update_one", USER_PROGRESS, async {
            self.db
                .collection::<Document>(USER_PROGRESS)
                .update_one(doc! { "user_id": user_id }, doc! { "$set": set, "$inc": inc })
                .upsert(true)
                .await
                .context("Failed to record level completion")?;
            Ok(())
        })
        .await?;

        self.get_user_progress(user_id).await
    }

    async fn complete_topic(
        &self,
        user_id: &str,
        topic_id: &str,
        session_id: &str,
        correct_count: u32,
    ) -> Result<u32> {
        let xp = topic_xp(correct_count);
        let record = BeginnerProgress {
            completed: true,
            score: correct_count,
            completed_at: Some(Utc::now()),
        };
        let mut set = Document::new();
        set.insert(
            format!("beginner_progress.{}", topic_id),
            to_bson(&record).context("Failed to encode beginner progress")?,
        );

        let progress = self.db.collection::<Document>(USER_PROGRESS);
        track_db_operation("update_one", USER_PROGRESS, async {
            progress
                .update_one(
                    doc! { "user_id": user_id },
                    doc! { "$setOnInsert": { "total_xp": 0_i64 } },
                )
                .upsert(true)
                .await
                .context("Failed to create user progress")?;
            Ok(())
        })
        .await?;

        // Guarded on the session id so a retried completion is credited once.
        let credited = track_db_operation("update_one", USER_PROGRESS, async {
            let result = progress
                .update_one(
                    doc! { "user_id": user_id, "completed_sessions": { "$ne": session_id } },
                    doc! {
                        "$set": set,
                        "$inc": { "total_xp": i64::from(xp) },
                        "$push": { "completed_sessions": session_id },
                    },
                )
                .await
                .context("Failed to record topic completion")?;
            Ok(result.modified_count > 0)
        })
        .await?;
        if !credited {
            tracing::debug!("Session {} already credited to {}", session_id, user_id);
        }

        Ok(xp)
    }

    async fn get_topics(&self) -> Result<Vec<Topic>> {
        self.find_all(TOPICS, doc! { "is_active": true }, doc! { "order": 1 })
            .await
    }

    async fn get_topic(&self, topic_id: &str) -> Result<Option<Topic>> {
        self.find_by_id(TOPICS, "id", topic_id).await
    }

    async fn get_problems_for_level(&self, topic_id: &str, level: u8) -> Result<Vec<Problem>> {
        self.find_all(
            PROBLEMS,
            doc! { "topic_id": topic_id, "level": i32::from(level) },
            doc! { "order": 1 },
        )
        .await
    }

    async fn get_beginner_topic(&self, topic_id: &str) -> Result<Option<BeginnerTopic>> {
        self.find_by_id(BEGINNER_TOPICS, "id", topic_id).await
    }

    async fn seed_content(&self, content: SeedContent) -> Result<SeedSummary> {
        for topic in &content.topics {
            self.upsert_by(TOPICS, "id", &topic.id, topic).await?;
        }
        for problem in &content.problems {
            self.upsert_by(PROBLEMS, "id", &problem.id, problem).await?;
        }
        for topic in &content.beginner_topics {
            self.upsert_by(BEGINNER_TOPICS, "id", &topic.id, topic)
                .await?;
        }

        Ok(SeedSummary {
            topics: content.topics.len(),
            problems: content.problems.len(),
            beginner_topics: content.beginner_topics.len(),
        })
    }

    async fn set_tutor_presence(&self, availability: TutorAvailability) -> Result<()> {
        self.upsert_by(TUTORS, "uid", &availability.uid, &availability)
            .await
    }

    async fn online_tutors(&self) -> Result<Vec<TutorAvailability>> {
        self.find_all(TUTORS, doc! { "is_online": true }, doc! { "display_name": 1 })
            .await
    }

    async fn ping(&self) -> Result<()> {
        self.db
            .run_command(doc! { "ping": 1 })
            .await
            .context("MongoDB ping failed")?;
        let mut conn = self.redis.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .context("Redis ping failed")?;
        Ok(())
    }
}
