use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::delivery::EventSender;
use crate::error::TurnError;
use crate::events::{Event, EventType};
use crate::models::{LanguageModel, ModelRequest};
use crate::parsing::parse_generated;
use crate::recommendation::{CityDetail, Itinerary, PoiDetail};
use crate::settings::EffectiveSettings;
use crate::storage::{InteractionRecord, TravelRepository};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    City,
    GeneralPois,
    PersonalizedPois,
    PoiDetails,
    Answer,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::City => "city",
            Self::GeneralPois => "general_pois",
            Self::PersonalizedPois => "personalized_pois",
            Self::PoiDetails => "poi_details",
            Self::Answer => "answer",
        }
    }
}

/// Typed payload of a successful task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    City(CityDetail),
    GeneralPois(Vec<PoiDetail>),
    Itinerary(Itinerary),
    Poi(PoiDetail),
    Answer(String),
}

impl TaskOutput {
    fn attach_interaction(&mut self, id: Option<Uuid>) {
        let pois: &mut [PoiDetail] = match self {
            Self::GeneralPois(pois) => pois,
            Self::Itinerary(itinerary) => &mut itinerary.pois,
            Self::Poi(poi) => std::slice::from_mut(poi),
            Self::City(_) | Self::Answer(_) => return,
        };
        for poi in pois {
            poi.interaction_id = id;
        }
    }

    /// Events announcing this output, partials first and the kind's final event last.
    fn events(&self) -> Vec<Event> {
        match self {
            Self::City(city) => vec![Event::new(EventType::CityData).with_data(json!(city))],
            Self::GeneralPois(pois) => vec![Event::new(EventType::GeneralPoi).with_data(json!({ "pois": pois }))],
            Self::Itinerary(itinerary) => {
                let mut events: Vec<Event> = itinerary
                    .pois
                    .iter()
                    .map(|poi| Event::new(EventType::PersonalizedPoi).with_data(json!(poi)))
                    .collect();
                events.push(Event::new(EventType::Itinerary).with_data(json!(itinerary)));
                events
            }
            Self::Poi(_) | Self::Answer(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub kind: TaskKind,
    pub interaction_id: Option<Uuid>,
    pub outcome: Result<TaskOutput, TurnError>,
}

impl TaskResult {
    fn failed(kind: TaskKind, err: TurnError) -> Self {
        Self { kind, interaction_id: None, outcome: Err(err) }
    }
}

/// Who a task runs for; shared by every task of a turn.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub user_id: Uuid,
    pub session_id: Option<Uuid>,
    pub city_name: Option<String>,
    pub settings: EffectiveSettings,
}

#[derive(Deserialize)]
struct PoiList {
    #[serde(default, alias = "pois")]
    points_of_interest: Vec<PoiDetail>,
}

/// Runs generation tasks against the model and records each interaction.
#[derive(Clone)]
pub struct Generator {
    model: Arc<dyn LanguageModel>,
    repo: Arc<dyn TravelRepository>,
}

impl Generator {
    pub fn new(model: Arc<dyn LanguageModel>, repo: Arc<dyn TravelRepository>) -> Self {
        Self { model, repo }
    }

    /// Run one task to completion. Failures are reported in the result, never raised.
    pub async fn run(&self, kind: TaskKind, prompt: String, ctx: &TaskContext, events: &EventSender) -> TaskResult {
        let span = info_span!("generation_task", task = kind.as_str(), session_id = ?ctx.session_id);
        async move {
            let started = Instant::now();
            let result = self.execute(kind, prompt, ctx, events).await;
            let outcome = match &result.outcome {
                Ok(_) => "ok",
                Err(e) => e.kind(),
            };
            if let Err(e) = &result.outcome {
                warn!(error = %e, "generation task failed");
            }
            metrics::counter!("generation_tasks_total", "task" => kind.as_str(), "outcome" => outcome).increment(1);
            metrics::histogram!("generation_task_duration_seconds", "task" => kind.as_str())
                .record(started.elapsed().as_secs_f64());
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, kind: TaskKind, prompt: String, ctx: &TaskContext, events: &EventSender) -> TaskResult {
        events
            .emit(Event::progress(format!("generating {}", kind.as_str())).with_data(json!({ "task": kind.as_str() })))
            .await;

        let request = ModelRequest::new(prompt.clone(), &ctx.settings);
        let started = Instant::now();
        let (raw, model_name) = match self.call_model(kind, request, ctx, events).await {
            Ok(reply) => reply,
            Err(e) => return TaskResult::failed(kind, e),
        };
        let latency = started.elapsed();
        // late results are discarded
        if events.is_cancelled() {
            return TaskResult::failed(kind, TurnError::Cancelled);
        }

        let mut output = match decode(kind, &raw) {
            Ok(output) => output,
            Err(e) => return TaskResult::failed(kind, e),
        };

        let record = InteractionRecord {
            session_id: ctx.session_id,
            user_id: ctx.user_id,
            task: kind.as_str().to_string(),
            prompt,
            response: raw,
            model_name,
            latency_ms: latency.as_millis() as i64,
            city_name: ctx.city_name.clone(),
        };
        let interaction_id = match self.repo.save_interaction(&record).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "could not record interaction");
                None
            }
        };
        output.attach_interaction(interaction_id);

        for event in output.events() {
            events.emit(event).await;
        }
        debug!(?interaction_id, "generation task done");
        TaskResult { kind, interaction_id, outcome: Ok(output) }
    }

    /// Stream when the model can, otherwise make one blocking call.
    async fn call_model(
        &self,
        kind: TaskKind,
        request: ModelRequest,
        ctx: &TaskContext,
        events: &EventSender,
    ) -> Result<(String, String), TurnError> {
        let cancel = events.cancellation().clone();
        let model_name = request.model.clone();

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            stream = self.model.generate_stream(request.clone()) => match stream {
                Ok(stream) => stream,
                // nothing streamed yet, so a plain call is still safe
                Err(e) => {
                    debug!(error = %e, "streaming refused, falling back to a single call");
                    None
                }
            },
        };

        let Some(mut stream) = stream else {
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                reply = self.model.generate(request) => reply.map_err(|e| TurnError::Generation(e.to_string()))?,
            };
            let model = if reply.model.is_empty() { model_name } else { reply.model };
            return Ok((reply.content, model));
        };

        let mut buffer = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(fragment)) => {
                    buffer.push_str(&fragment);
                    if ctx.settings.stream_chunks {
                        events.emit(Event::chunk(kind.as_str(), &fragment)).await;
                    }
                }
                Some(Err(e)) => return Err(TurnError::Generation(e.to_string())),
                None => break,
            }
        }
        Ok((buffer, model_name))
    }
}

fn decode(kind: TaskKind, raw: &str) -> Result<TaskOutput, TurnError> {
    match kind {
        TaskKind::City => parse_generated::<CityDetail>(raw).map(TaskOutput::City),
        TaskKind::GeneralPois => parse_generated::<PoiList>(raw).map(|l| TaskOutput::GeneralPois(l.points_of_interest)),
        TaskKind::PersonalizedPois => parse_generated::<Itinerary>(raw).map(TaskOutput::Itinerary),
        TaskKind::PoiDetails => {
            let poi: PoiDetail = parse_generated(raw)?;
            if poi.name.trim().is_empty() {
                return Err(TurnError::EmptyGenerationResult);
            }
            Ok(TaskOutput::Poi(poi))
        }
        TaskKind::Answer => {
            let text = raw.trim();
            if text.is_empty() {
                return Err(TurnError::EmptyGenerationResult);
            }
            Ok(TaskOutput::Answer(text.to_string()))
        }
    }
}

#[cfg(test)]
pub fn test_context() -> TaskContext {
    use crate::settings::{resolve_effective_settings, GlobalConfigDefaults, RequestOverrides, SessionSettings};
    TaskContext {
        user_id: Uuid::new_v4(),
        session_id: None,
        city_name: Some("Lisbon".into()),
        settings: resolve_effective_settings(
            &GlobalConfigDefaults::default(),
            &SessionSettings::default(),
            &RequestOverrides::default(),
        ),
    }
}
