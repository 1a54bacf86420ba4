//! Turn drivers: first-turn fan-out/fan-in and follow-up mutation turns.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::conversation::{self, MutationOutcome};
use crate::delivery::EventSender;
use crate::error::{TaskFailure, TurnError};
use crate::events::{Event, EventType};
use crate::generation::{Generator, TaskContext, TaskKind, TaskOutput, TaskResult};
use crate::geo::{DistanceCalculator, GeoPoint};
use crate::prompts;
use crate::recommendation::{CompositeResult, UserPreferences};
use crate::rerank::{rerank, rerank_composite};
use crate::session::{MessageKind, Role, Session};
use crate::settings::{resolve_effective_settings, AppConfig, RequestOverrides, SessionSettings};
use crate::storage::TravelRepository;

/// Opening request of a conversation.
#[derive(Debug, Clone, Deserialize)]
pub struct FirstTurnRequest {
    pub user_id: Uuid,
    pub city: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub preferences: UserPreferences,
    #[serde(default)]
    pub reference_location: Option<GeoPoint>,
    #[serde(default)]
    pub settings: SessionSettings,
    #[serde(default)]
    pub overrides: RequestOverrides,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FollowUpRequest {
    pub message: String,
    #[serde(default)]
    pub reference_location: Option<GeoPoint>,
    #[serde(default)]
    pub overrides: RequestOverrides,
}

pub struct Orchestrator {
    generator: Generator,
    repo: Arc<dyn TravelRepository>,
    distance: Arc<dyn DistanceCalculator>,
    config: AppConfig,
}

impl Orchestrator {
    pub fn new(
        generator: Generator,
        repo: Arc<dyn TravelRepository>,
        distance: Arc<dyn DistanceCalculator>,
        config: AppConfig,
    ) -> Self {
        Self { generator, repo, distance, config }
    }

    pub fn repository(&self) -> &Arc<dyn TravelRepository> {
        &self.repo
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Generate city, general POIs and itinerary concurrently and persist the
    /// new session. Any task failure fails the turn; `complete` is only sent
    /// on success and is always the last event.
    pub async fn run_first_turn(
        &self,
        session_id: Uuid,
        request: FirstTurnRequest,
        events: &EventSender,
    ) -> Result<Session, TurnError> {
        let span = info_span!("first_turn", %session_id, city = %request.city);
        let started = Instant::now();
        let result = self.first_turn(session_id, request, events).instrument(span).await;
        finish("first", started, &result, events).await;
        result
    }

    /// Apply one follow-up message to an existing session.
    pub async fn continue_turn(
        &self,
        session_id: Uuid,
        request: FollowUpRequest,
        events: &EventSender,
    ) -> Result<MutationOutcome, TurnError> {
        let span = info_span!("follow_up", %session_id);
        let started = Instant::now();
        let result = self.follow_up(session_id, request, events).instrument(span).await;
        finish("follow_up", started, &result, events).await;
        result
    }

    async fn first_turn(
        &self,
        session_id: Uuid,
        request: FirstTurnRequest,
        events: &EventSender,
    ) -> Result<Session, TurnError> {
        let city = request.city.trim().to_string();
        if city.is_empty() {
            return Err(TurnError::CityNotFound(request.city));
        }
        events
            .emit(
                Event::new(EventType::Start)
                    .with_data(json!({ "session_id": session_id, "city": city }))
                    .with_message(format!("planning your trip to {city}")),
            )
            .await;

        let settings = resolve_effective_settings(&self.config.defaults, &request.settings, &request.overrides);
        let itinerary_prompt = prompts::itinerary(&city, &request.preferences, settings.max_itinerary_pois);
        let ctx = TaskContext {
            user_id: request.user_id,
            session_id: Some(session_id),
            city_name: Some(city.clone()),
            settings,
        };

        let cancel = events.cancellation().clone();
        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            results = async {
                tokio::join!(
                    self.generator.run(TaskKind::City, prompts::city(&city), &ctx, events),
                    self.generator.run(TaskKind::GeneralPois, prompts::general_pois(&city), &ctx, events),
                    self.generator.run(TaskKind::PersonalizedPois, itinerary_prompt, &ctx, events),
                )
            } => results,
        };
        if cancel.is_cancelled() {
            return Err(TurnError::Cancelled);
        }

        let (city_result, general_result, personalized_result) = results;
        let personalized_interaction = personalized_result.interaction_id;
        let mut composite = aggregate([city_result, general_result, personalized_result])?;
        let Some(city_detail) = composite.city.clone() else {
            return Err(TurnError::CityNotFound(city));
        };

        let city_id = self.persist_catalogue(request.user_id, &composite, personalized_interaction).await;

        rerank_composite(&mut composite, request.reference_location, self.distance.as_ref());

        let mut session = Session::new(request.user_id, request.settings, self.config.session_ttl);
        session.id = session_id;
        let summary = summarize(&composite);
        session.context.city_name = Some(city_detail.name.clone());
        session.context.country = Some(city_detail.country.clone()).filter(|c| !c.is_empty());
        session.context.city_id = city_id;
        session.context.summary = Some(summary.clone());
        session.context.reference_location = request.reference_location;
        session.current_result = composite;
        let opening = request.message.unwrap_or_else(|| format!("Plan a trip to {city}"));
        session.push_message(Role::User, MessageKind::InitialRequest, opening);
        session.push_message(Role::Assistant, MessageKind::Response, summary);

        if cancel.is_cancelled() {
            return Err(TurnError::Cancelled);
        }
        self.repo.save_session(&session).await.map_err(TurnError::persistence)?;
        info!(pois = session.current_result.poi_count(), "first turn stored");

        events
            .emit(Event::complete(json!({ "session_id": session.id, "result": session.current_result })))
            .await;
        Ok(session)
    }

    /// City, general POIs and the personalized batch. Failures are logged and
    /// skipped; only the session itself must be durable.
    async fn persist_catalogue(
        &self,
        user_id: Uuid,
        composite: &CompositeResult,
        personalized_interaction: Option<Uuid>,
    ) -> Option<Uuid> {
        let city = composite.city.as_ref()?;
        let city_id = match self.repo.find_or_create_city(&city.name, &city.country).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, city = %city.name, "could not resolve city, skipping POI persistence");
                return None;
            }
        };

        let mut stored = 0usize;
        for poi in &composite.general_pois {
            match self.repo.poi_exists(city_id, &poi.name).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, poi = %poi.name, "poi lookup failed");
                    continue;
                }
            }
            match self.repo.upsert_poi(poi, city_id).await {
                Ok(true) => stored += 1,
                Ok(false) => {}
                Err(e) => warn!(error = %e, poi = %poi.name, "poi save failed"),
            }
        }

        if let Some(itinerary) = composite.itinerary.as_ref() {
            if let Err(e) = self
                .repo
                .save_personalized_pois(user_id, city_id, personalized_interaction, &itinerary.pois)
                .await
            {
                warn!(error = %e, "personalized batch save failed");
            }
        }
        info!(%city_id, stored, "catalogue updated");
        Some(city_id)
    }

    async fn follow_up(
        &self,
        session_id: Uuid,
        request: FollowUpRequest,
        events: &EventSender,
    ) -> Result<MutationOutcome, TurnError> {
        let mut session = self
            .repo
            .load_session(session_id)
            .await
            .map_err(TurnError::persistence)?
            .ok_or(TurnError::SessionNotFound(session_id))?;
        if let Err(e) = session.ensure_active(Utc::now()) {
            if let Err(save) = self.repo.save_session(&session).await {
                warn!(error = %save, "could not persist expiry");
            }
            return Err(e);
        }

        events
            .emit(Event::new(EventType::Start).with_data(json!({ "session_id": session_id })))
            .await;

        let settings = resolve_effective_settings(&self.config.defaults, &session.settings, &request.overrides);
        let ctx = TaskContext {
            user_id: session.user_id,
            session_id: Some(session_id),
            city_name: session.context.city_name.clone(),
            settings,
        };
        let outcome = conversation::apply(
            &mut session,
            &request.message,
            self.config.session_ttl,
            &self.generator,
            &ctx,
            events,
        )
        .await?;
        if events.is_cancelled() {
            return Err(TurnError::Cancelled);
        }

        if let Some(reference) = request.reference_location {
            session.context.reference_location = Some(reference);
        }
        if outcome.modified {
            if let Some(itinerary) = session.current_result.itinerary.as_mut() {
                itinerary.pois = rerank(
                    std::mem::take(&mut itinerary.pois),
                    session.context.reference_location,
                    self.distance.as_ref(),
                );
            }
        }

        for msg in &outcome.messages {
            if let Err(e) = self.repo.append_history_message(session_id, msg).await {
                warn!(error = %e, message_id = %msg.id, "history append failed");
            }
        }
        self.repo.save_session(&session).await.map_err(TurnError::persistence)?;

        events
            .emit(
                Event::new(EventType::Response)
                    .with_data(json!({ "intent": outcome.intent, "modified": outcome.modified }))
                    .with_message(outcome.response.clone()),
            )
            .await;
        if outcome.modified {
            events
                .emit(Event::new(EventType::ItineraryUpdate).with_data(json!(session.current_result.itinerary)))
                .await;
        }
        events.emit(Event::complete(json!({ "session_id": session_id }))).await;
        Ok(outcome)
    }
}

/// Merge task outputs by kind. Empty outputs are not merged.
fn aggregate(results: [TaskResult; 3]) -> Result<CompositeResult, TurnError> {
    let mut composite = CompositeResult::default();
    let mut failures = Vec::new();
    for result in results {
        match result.outcome {
            Ok(TaskOutput::City(city)) if !city.is_empty() => composite.city = Some(city),
            Ok(TaskOutput::GeneralPois(pois)) if !pois.is_empty() => composite.general_pois = pois,
            Ok(TaskOutput::Itinerary(itinerary)) if !itinerary.is_empty() => composite.itinerary = Some(itinerary),
            Ok(_) => {}
            Err(TurnError::Cancelled) => return Err(TurnError::Cancelled),
            Err(e) => failures.push(TaskFailure { task: result.kind, kind: e.kind(), message: e.to_string() }),
        }
    }
    if failures.is_empty() { Ok(composite) } else { Err(TurnError::TasksFailed(failures)) }
}

fn summarize(composite: &CompositeResult) -> String {
    let city = composite.city.as_ref().map_or("your destination", |c| c.name.as_str());
    let stops = composite.itinerary.as_ref().map_or(0, |i| i.pois.len());
    format!(
        "Here is your plan for {city}: {} places worth seeing and a {stops}-stop personalized itinerary.",
        composite.general_pois.len()
    )
}

/// Terminal error event and turn metrics.
async fn finish<T>(kind: &'static str, started: Instant, result: &Result<T, TurnError>, events: &EventSender) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!("turns_total", "kind" => kind, "outcome" => outcome).increment(1);
    metrics::histogram!("turn_duration_seconds", "kind" => kind).record(started.elapsed().as_secs_f64());
    if let Err(e) = result {
        warn!(turn = kind, error = %e, "turn failed");
        events.emit(Event::failure(e).final_event()).await;
    }
}
