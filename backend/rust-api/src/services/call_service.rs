use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::errors::CallError;
use crate::metrics::CALLS_TOTAL;
use crate::models::call::{CallParty, StartCallRequest, StartCallResponse};
use crate::models::{Call, CallPatch, CallStatus, NewCall};
use crate::services::session_service::SessionService;
use crate::services::store::{Feed, TutorStore, Update};

/// Status change seen on a call feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Accepted,
    Declined,
    Missed,
    Cancelled,
    Ended { ended_by: Option<String> },
}

impl CallEvent {
    fn from_snapshot(call: &Call) -> Option<Self> {
        match call.status {
            CallStatus::Ringing => None,
            CallStatus::Accepted => Some(Self::Accepted),
            CallStatus::Declined => Some(Self::Declined),
            CallStatus::Missed => Some(Self::Missed),
            CallStatus::Cancelled => Some(Self::Cancelled),
            CallStatus::Ended => Some(Self::Ended {
                ended_by: call.ended_by.clone(),
            }),
        }
    }
}

/// Emits an event only when the status differs from the last one seen, so
/// duplicate snapshots are dropped.
fn dedupe_event(last_seen: &mut Option<CallStatus>, call: &Call) -> Option<CallEvent> {
    if *last_seen == Some(call.status) {
        return None;
    }
    *last_seen = Some(call.status);
    CallEvent::from_snapshot(call)
}

/// Owns the lifecycle of call requests: ringing, the ring timer and the
/// accept side effect on the owning session.
#[derive(Clone)]
pub struct CallService {
    store: Arc<dyn TutorStore>,
    sessions: SessionService,
    ring_timeout: Duration,
    timers: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl CallService {
    pub fn new(store: Arc<dyn TutorStore>, sessions: SessionService, ring_timeout: Duration) -> Self {
        Self {
            store,
            sessions,
            ring_timeout,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Creates the session in `calling` and rings the chosen tutor.
    pub async fn place_call(&self, req: StartCallRequest) -> Result<StartCallResponse, CallError> {
        let session = self
            .sessions
            .create(&req.student_id, &req.tutor_id, &req.topic_id)
            .await?;

        let call = self
            .start_ringing(NewCall {
                initiator_name: req.student_name.unwrap_or_else(|| req.student_id.clone()),
                initiator_id: req.student_id,
                target_id: req.tutor_id,
                topic_id: req.topic_id,
                session_id: session.id.clone(),
                audio_room: session.audio_room,
            })
            .await?;

        Ok(StartCallResponse {
            call,
            session_id: session.id,
            ring_timeout_seconds: self.ring_timeout.as_secs(),
        })
    }

    /// Persists a ringing call, arms the ring timer and starts watching the
    /// call so an accept written by any writer disarms it.
    pub async fn start_ringing(&self, new_call: NewCall) -> Result<Call, CallError> {
        let call = self
            .store
            .create_call(new_call)
            .await
            .map_err(CallError::Store)?;

        CALLS_TOTAL
            .with_label_values(&[CallStatus::Ringing.as_str()])
            .inc();
        tracing::info!(
            "Call {} ringing: {} -> {} (topic={})",
            call.id,
            call.initiator_id,
            call.target_id,
            call.topic_id
        );

        self.arm_timer(&call.id);
        self.spawn_watcher(call.id.clone());
        Ok(call)
    }

    pub async fn get(&self, call_id: &str) -> Result<Call, CallError> {
        self.store
            .get_call(call_id)
            .await
            .map_err(CallError::Store)?
            .ok_or_else(|| CallError::NotFound(call_id.to_string()))
    }

    /// Status events for a call, starting with its current state.
    pub async fn observe(&self, call_id: &str) -> Result<Feed<CallEvent>, CallError> {
        let feed = self
            .store
            .watch_call(call_id)
            .await
            .map_err(CallError::Store)?;
        let mut last_seen = None;
        Ok(feed
            .filter_map(move |call| futures::future::ready(dedupe_event(&mut last_seen, &call)))
            .boxed())
    }

    pub async fn watch(&self, call_id: &str) -> Result<Feed<Call>, CallError> {
        self.get(call_id).await?;
        self.store.watch_call(call_id).await.map_err(CallError::Store)
    }

    pub async fn incoming(&self, target_id: &str) -> Result<Vec<Call>, CallError> {
        self.store
            .ringing_calls_for(target_id)
            .await
            .map_err(CallError::Store)
    }

    pub async fn watch_incoming(&self, target_id: &str) -> Result<Feed<Vec<Call>>, CallError> {
        self.store
            .watch_incoming_calls(target_id)
            .await
            .map_err(CallError::Store)
    }

    /// Tutor picks up. Flips the session to `teaching`; repeating it is a
    /// no-op.
    pub async fn accept(&self, call_id: &str, actor_id: &str) -> Result<Call, CallError> {
        let call = self.get(call_id).await?;
        require_party(&call, actor_id, CallParty::Target, "accept")?;

        let call = self
            .transition(call, CallStatus::Accepted, CallPatch::status(CallStatus::Accepted))
            .await?;
        self.sessions.mark_teaching(&call.session_id).await?;
        Ok(call)
    }

    pub async fn decline(&self, call_id: &str, actor_id: &str) -> Result<Call, CallError> {
        let call = self.get(call_id).await?;
        require_party(&call, actor_id, CallParty::Target, "decline")?;
        self.transition(call, CallStatus::Declined, CallPatch::status(CallStatus::Declined))
            .await
    }

    /// Student hangs up before the tutor answers. No-op on a finished call.
    pub async fn cancel(&self, call_id: &str, actor_id: &str) -> Result<Call, CallError> {
        let call = self.get(call_id).await?;
        require_party(&call, actor_id, CallParty::Initiator, "cancel")?;
        if call.status.is_terminal() {
            tracing::debug!("Cancel on finished call {} ignored", call_id);
            self.disarm_timer(call_id);
            return Ok(call);
        }
        self.transition(call, CallStatus::Cancelled, CallPatch::status(CallStatus::Cancelled))
            .await
    }

    /// Either party hangs up a connected call.
    pub async fn end(&self, call_id: &str, actor_id: &str) -> Result<Call, CallError> {
        let call = self.get(call_id).await?;
        if call.party_of(actor_id).is_none() {
            return Err(CallError::NotParticipant {
                call_id: call_id.to_string(),
                actor_id: actor_id.to_string(),
            });
        }
        let patch = CallPatch {
            status: Some(CallStatus::Ended),
            ended_by: Some(actor_id.to_string()),
        };
        self.transition(call, CallStatus::Ended, patch).await
    }

    /// Ring timer fired: the tutor never answered.
    async fn expire(&self, call_id: &str) {
        self.timers_guard().remove(call_id);
        match self
            .store
            .update_call(call_id, CallPatch::status(CallStatus::Missed))
            .await
        {
            Ok(Update::Applied(_)) => {
                CALLS_TOTAL
                    .with_label_values(&[CallStatus::Missed.as_str()])
                    .inc();
                tracing::info!("Call {} missed after {:?}", call_id, self.ring_timeout);
            }
            Ok(Update::Rejected(call)) => {
                tracing::debug!("Ring timer for call {} found it {:?}", call_id, call.status);
            }
            Ok(Update::NotFound) => tracing::warn!("Ring timer fired for unknown call {}", call_id),
            Err(e) => tracing::warn!("Failed to mark call {} missed: {}", call_id, e),
        }
    }

    async fn transition(
        &self,
        current: Call,
        to: CallStatus,
        patch: CallPatch,
    ) -> Result<Call, CallError> {
        if current.status == to {
            return Ok(current);
        }
        if !current.status.can_transition_to(to) {
            return Err(CallError::InvalidTransition {
                call_id: current.id,
                from: current.status,
                to,
            });
        }

        match self
            .store
            .update_call(&current.id, patch)
            .await
            .map_err(CallError::Store)?
        {
            Update::Applied(call) => {
                self.disarm_timer(&call.id);
                CALLS_TOTAL.with_label_values(&[to.as_str()]).inc();
                tracing::info!("Call {} {:?} -> {:?}", call.id, current.status, to);
                Ok(call)
            }
            // Lost a race with another writer; the stored state wins.
            Update::Rejected(call) if call.status == to => Ok(call),
            Update::Rejected(call) => Err(CallError::InvalidTransition {
                call_id: call.id,
                from: call.status,
                to,
            }),
            Update::NotFound => Err(CallError::NotFound(current.id)),
        }
    }

    fn timers_guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, AbortHandle>> {
        self.timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn arm_timer(&self, call_id: &str) {
        let service = self.clone();
        let id = call_id.to_string();
        let wait = self.ring_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            service.expire(&id).await;
        });
        if let Some(previous) = self
            .timers_guard()
            .insert(call_id.to_string(), handle.abort_handle())
        {
            previous.abort();
        }
    }

    fn disarm_timer(&self, call_id: &str) {
        if let Some(handle) = self.timers_guard().remove(call_id) {
            handle.abort();
            tracing::debug!("Ring timer for call {} disarmed", call_id);
        }
    }

    pub fn has_armed_timer(&self, call_id: &str) -> bool {
        self.timers_guard().contains_key(call_id)
    }

    /// Follows one call until it is answered or finished. Acceptance observed
    /// from any writer disarms the timer and moves the session to `teaching`.
    fn spawn_watcher(&self, call_id: String) {
        let service = self.clone();
        tokio::spawn(async move {
            let mut events = match service.observe(&call_id).await {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!("Could not watch call {}: {}", call_id, e);
                    return;
                }
            };

            while let Some(event) = events.next().await {
                match event {
                    CallEvent::Accepted => {
                        service.disarm_timer(&call_id);
                        let session_id = match service.get(&call_id).await {
                            Ok(call) => call.session_id,
                            Err(e) => {
                                tracing::warn!("Accepted call {} vanished: {}", call_id, e);
                                break;
                            }
                        };
                        if let Err(e) = service.sessions.mark_teaching(&session_id).await {
                            tracing::warn!(
                                "Failed to start teaching for session {}: {}",
                                session_id,
                                e
                            );
                        }
                        break;
                    }
                    CallEvent::Ended { .. }
                    | CallEvent::Declined
                    | CallEvent::Missed
                    | CallEvent::Cancelled => {
                        service.disarm_timer(&call_id);
                        break;
                    }
                }
            }
            tracing::debug!("Stopped watching call {}", call_id);
        });
    }
}

fn require_party(
    call: &Call,
    actor_id: &str,
    allowed: CallParty,
    action: &'static str,
) -> Result<(), CallError> {
    match call.party_of(actor_id) {
        Some(party) if party == allowed => Ok(()),
        Some(_) => Err(CallError::WrongParty {
            call_id: call.id.clone(),
            action,
            allowed: match allowed {
                CallParty::Initiator => "caller",
                CallParty::Target => "callee",
            },
        }),
        None => Err(CallError::NotParticipant {
            call_id: call.id.clone(),
            actor_id: actor_id.to_string(),
        }),
    }
}
