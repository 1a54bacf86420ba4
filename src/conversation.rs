//! Follow-up handlers that patch a session's live itinerary.

use serde::Serialize;
use tracing::{info, warn};

use crate::delivery::EventSender;
use crate::error::TurnError;
use crate::generation::{Generator, TaskContext, TaskKind, TaskOutput};
use crate::intent::{self, Intent};
use crate::prompts;
use crate::recommendation::PoiDetail;
use crate::session::{Message, MessageKind, Role, Session};

const HISTORY_WINDOW: usize = 6;

/// What one follow-up message did to the session.
#[derive(Debug, Clone, Serialize)]
pub struct MutationOutcome {
    pub intent: Intent,
    pub response: String,
    /// Itinerary membership changed.
    pub modified: bool,
    #[serde(skip)]
    pub messages: Vec<Message>,
}

struct Reply {
    response: String,
    modified: bool,
}

impl Reply {
    fn say(response: impl Into<String>) -> Self {
        Self { response: response.into(), modified: false }
    }

    fn changed(response: impl Into<String>) -> Self {
        Self { response: response.into(), modified: true }
    }
}

/// Route `message`, apply it to `session`, and record both sides in history.
///
/// Task-local failures become an apologetic response and leave the itinerary
/// untouched; anything else (cancellation) is returned.
pub async fn apply(
    session: &mut Session,
    message: &str,
    ttl: chrono::Duration,
    generator: &Generator,
    ctx: &TaskContext,
    events: &EventSender,
) -> Result<MutationOutcome, TurnError> {
    let intent = intent::classify(message);
    info!(session_id = %session.id, intent = intent.as_str(), "routing follow-up");
    let handler = Handler { session: &mut *session, generator, ctx, events };
    let reply = match intent {
        Intent::AddPoi => handler.add_poi(message).await?,
        Intent::RemovePoi => handler.remove_poi(message),
        Intent::ReplacePoi => match intent::parse_replace(message) {
            Some((from, to)) => handler.replace_poi(&from, &to).await?,
            None => Reply::say(CLARIFY),
        },
        Intent::AskQuestion => handler.ask_question(message).await?,
        // replace phrasings are already routed above; anything else is too vague to act on
        Intent::ModifyItinerary => Reply::say(CLARIFY),
    };

    let user = session.push_message(Role::User, MessageKind::FollowUp, message);
    let kind = if reply.modified { MessageKind::ItineraryUpdate } else { MessageKind::Response };
    let assistant = session.push_message(Role::Assistant, kind, reply.response.clone());
    session.extend(ttl);

    Ok(MutationOutcome { intent, response: reply.response, modified: reply.modified, messages: vec![user, assistant] })
}

const CLARIFY: &str = "I can add, remove or replace places in your itinerary. Which place should I change?";

struct Handler<'a> {
    session: &'a mut Session,
    generator: &'a Generator,
    ctx: &'a TaskContext,
    events: &'a EventSender,
}

impl Handler<'_> {
    fn city(&self) -> String {
        self.session
            .context
            .city_name
            .clone()
            .or_else(|| self.session.current_result.city.as_ref().map(|c| c.name.clone()))
            .unwrap_or_default()
    }

    async fn fetch_poi(&self, name: &str) -> Result<Result<PoiDetail, TurnError>, TurnError> {
        let prompt = prompts::poi_details(name, &self.city());
        let result = self.generator.run(TaskKind::PoiDetails, prompt, self.ctx, self.events).await;
        match result.outcome {
            Ok(TaskOutput::Poi(poi)) => Ok(Ok(poi)),
            Ok(other) => Ok(Err(TurnError::Generation(format!("unexpected output {other:?}")))),
            Err(e) if e.is_task_local() => Ok(Err(e)),
            Err(e) => Err(e),
        }
    }

    async fn add_poi(mut self, message: &str) -> Result<Reply, TurnError> {
        let Some(name) = intent::extract_poi_name(message) else {
            return Ok(Reply::say("Which place would you like me to add?"));
        };
        if let Some(existing) = self.session.current_result.itinerary.as_ref().and_then(|i| {
            i.position_of(&name).map(|idx| i.pois[idx].name.clone())
        }) {
            return Ok(Reply::say(format!("{existing} is already in your itinerary.")));
        }
        Ok(match self.fetch_poi(&name).await? {
            Ok(poi) => {
                let added = poi.name.clone();
                self.session.current_result.itinerary_mut().pois.push(poi);
                Reply::changed(format!("Added {added} to your itinerary."))
            }
            Err(e) => {
                warn!(error = %e, poi = %name, "add failed");
                Reply::say(format!("Sorry, I couldn't find details for {name} right now. Your itinerary is unchanged."))
            }
        })
    }

    fn remove_poi(mut self, message: &str) -> Reply {
        let Some(name) = intent::extract_poi_name(message) else {
            return Reply::say("Which place would you like me to remove?");
        };
        let Some(itinerary) = self.session.current_result.itinerary.as_mut() else {
            return Reply::say(format!("I couldn't find {name} in your itinerary."));
        };
        match itinerary.position_of(&name) {
            Some(idx) => {
                let removed = itinerary.pois.remove(idx);
                Reply::changed(format!("Removed {} from your itinerary.", removed.name))
            }
            None => Reply::say(format!("I couldn't find {name} in your itinerary.")),
        }
    }

    async fn replace_poi(mut self, from: &str, to: &str) -> Result<Reply, TurnError> {
        let position = self.session.current_result.itinerary.as_ref().and_then(|i| i.position_of(from));
        let Some(idx) = position else {
            return Ok(Reply::say(format!("I couldn't find {from} in your itinerary.")));
        };
        Ok(match self.fetch_poi(to).await? {
            Ok(poi) => {
                let added = poi.name.clone();
                let itinerary = self.session.current_result.itinerary_mut();
                let old = std::mem::replace(&mut itinerary.pois[idx], poi);
                Reply::changed(format!("Replaced {} with {added}.", old.name))
            }
            Err(e) => {
                warn!(error = %e, poi = %to, "replace failed");
                Reply::say(format!("Sorry, I couldn't find details for {to} right now. {from} stays in your itinerary."))
            }
        })
    }

    async fn ask_question(self, message: &str) -> Result<Reply, TurnError> {
        let city = self.city();
        let prompt = prompts::answer(
            message,
            Some(city.as_str()).filter(|c| !c.is_empty()),
            self.session.current_result.itinerary.as_ref(),
            self.session.recent_history(HISTORY_WINDOW),
        );
        let result = self.generator.run(TaskKind::Answer, prompt, self.ctx, self.events).await;
        Ok(match result.outcome {
            Ok(TaskOutput::Answer(text)) => Reply::say(text),
            Err(e) if !e.is_task_local() => return Err(e),
            Ok(_) | Err(_) => Reply::say("Sorry, I couldn't answer that right now. Please try again."),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{channel, test_settings, DeadLetterQueue};
    use crate::generation::test_context;
    use crate::models::testing::{Reply as Scripted, ScriptedModel};
    use crate::prompts::{ANSWER_TASK, POI_DETAILS_TASK};
    use crate::recommendation::Itinerary;
    use crate::settings::SessionSettings;
    use crate::storage::test_repository;
    use chrono::Duration;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn poi(name: &str) -> PoiDetail {
        PoiDetail { name: name.into(), ..Default::default() }
    }

    fn session_with(names: &[&str]) -> Session {
        let mut session = Session::new(Uuid::new_v4(), SessionSettings::default(), Duration::hours(24));
        session.context.city_name = Some("Lisbon".into());
        session.current_result.itinerary = Some(Itinerary {
            name: "Lisbon".into(),
            description: String::new(),
            pois: names.iter().map(|n| poi(n)).collect(),
        });
        session
    }

    fn names(session: &Session) -> Vec<String> {
        session.current_result.itinerary.as_ref().map(|i| i.pois.iter().map(|p| p.name.clone()).collect()).unwrap_or_default()
    }

    async fn run(session: &mut Session, model: ScriptedModel, message: &str) -> (MutationOutcome, Arc<ScriptedModel>) {
        let (repo, _dir) = test_repository().await;
        let model = Arc::new(model);
        let generator = Generator::new(model.clone(), Arc::new(repo));
        let (dlq, _dlq_rx) = DeadLetterQueue::channel();
        let (tx, _rx) = channel(test_settings(64), CancellationToken::new(), dlq);
        let outcome = apply(session, message, Duration::hours(24), &generator, &test_context(), &tx).await.unwrap();
        (outcome, model)
    }

    #[tokio::test]
    async fn add_existing_is_acknowledged_without_generation() {
        let mut session = session_with(&["Belém Tower", "Oceanário de Lisboa"]);
        let (outcome, model) = run(&mut session, ScriptedModel::new(), "add the oceanário").await;
        assert_eq!(outcome.intent, Intent::AddPoi);
        assert!(!outcome.modified);
        assert!(outcome.response.contains("already"));
        assert_eq!(names(&session).len(), 2);
        assert!(model.prompts().is_empty());
        assert_eq!(session.history.len(), 2);
    }

    #[tokio::test]
    async fn add_new_appends_generated_poi() {
        let mut session = session_with(&["Belém Tower"]);
        let model = ScriptedModel::new().on(POI_DETAILS_TASK, Scripted::text("{\"name\":\"LX Factory\",\"latitude\":38.70,\"longitude\":-9.18}"));
        let (outcome, _) = run(&mut session, model, "please add LX Factory").await;
        assert!(outcome.modified);
        assert_eq!(names(&session), vec!["Belém Tower", "LX Factory"]);
        assert!(session.current_result.itinerary.as_ref().unwrap().pois[1].interaction_id.is_some());
        assert_eq!(session.history[1].kind, MessageKind::ItineraryUpdate);
    }

    #[tokio::test]
    async fn remove_absent_reports_not_found() {
        let mut session = session_with(&["Belém Tower", "Castle"]);
        let (outcome, _) = run(&mut session, ScriptedModel::new(), "remove the Zoo").await;
        assert_eq!(outcome.intent, Intent::RemovePoi);
        assert!(!outcome.modified);
        assert!(outcome.response.contains("couldn't find Zoo"));
        assert_eq!(names(&session), vec!["Belém Tower", "Castle"]);
    }

    #[tokio::test]
    async fn remove_takes_first_containment_match() {
        let mut session = session_with(&["Belém Tower", "São Jorge Castle", "Castle Museum"]);
        let (outcome, _) = run(&mut session, ScriptedModel::new(), "remove castle").await;
        assert!(outcome.modified);
        assert_eq!(names(&session), vec!["Belém Tower", "Castle Museum"]);
    }

    #[tokio::test]
    async fn replace_missing_source_skips_generation() {
        let mut session = session_with(&["Belém Tower"]);
        let (outcome, model) = run(&mut session, ScriptedModel::new(), "replace Castle with Aquarium").await;
        assert!(!outcome.modified);
        assert!(model.prompts().is_empty());
    }

    #[tokio::test]
    async fn failed_generation_becomes_apology() {
        let mut session = session_with(&["Castle"]);
        let model = ScriptedModel::new().on(POI_DETAILS_TASK, Scripted::text(""));
        let before = session.current_result.clone();
        let (outcome, _) = run(&mut session, model, "replace Castle with Aquarium").await;
        assert!(!outcome.modified);
        assert!(outcome.response.starts_with("Sorry"));
        assert_eq!(session.current_result, before);
        assert_eq!(session.history.len(), 2);
    }

    #[tokio::test]
    async fn questions_do_not_mutate() {
        let mut session = session_with(&["Castle"]);
        let model = ScriptedModel::new().on(ANSWER_TASK, Scripted::text("It opens at 9am."));
        let before = session.current_result.clone();
        let (outcome, model) = run(&mut session, model, "When does the castle open?").await;
        assert_eq!(outcome.intent, Intent::AskQuestion);
        assert_eq!(outcome.response, "It opens at 9am.");
        assert_eq!(session.current_result, before);
        assert!(model.prompts()[0].contains("Current itinerary: Castle."));
    }

    #[tokio::test]
    async fn unclear_message_asks_for_clarification() {
        let mut session = session_with(&["Castle"]);
        let expires = session.expires_at;
        let (outcome, _) = run(&mut session, ScriptedModel::new(), "make it nicer").await;
        assert_eq!(outcome.intent, Intent::ModifyItinerary);
        assert_eq!(outcome.response, CLARIFY);
        assert!(session.expires_at >= expires);
        assert_eq!(outcome.messages.len(), 2);
    }
}
