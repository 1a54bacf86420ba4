use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GenerationPolicies {
    /// Forward every streamed fragment to the client as a chunk event.
    pub stream_chunks: Option<bool>,
    pub max_itinerary_pois: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionSettings {
    pub default_model: Option<String>,
    pub model_params: Option<ModelParams>,
    pub policies: Option<GenerationPolicies>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GlobalConfigDefaults {
    pub default_model: Option<String>,
    pub model_params: Option<ModelParams>,
    pub policies: Option<GenerationPolicies>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RequestOverrides {
    pub model: Option<String>,
    pub model_params: Option<ModelParams>,
    pub policies: Option<GenerationPolicies>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectiveSettings {
    pub model: String,
    pub model_params: ModelParams,
    pub stream_chunks: bool,
    pub max_itinerary_pois: u32,
}

pub fn resolve_effective_settings(
    global: &GlobalConfigDefaults,
    session: &SessionSettings,
    request: &RequestOverrides,
) -> EffectiveSettings {
    let model = request
        .model
        .clone()
        .or_else(|| session.default_model.clone())
        .or_else(|| global.default_model.clone())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    let params = |pick: fn(&ModelParams) -> Option<f32>| {
        request
            .model_params
            .as_ref()
            .and_then(pick)
            .or_else(|| session.model_params.as_ref().and_then(pick))
            .or_else(|| global.model_params.as_ref().and_then(pick))
    };

    let model_params = ModelParams {
        temperature: params(|p| p.temperature),
        max_tokens: request
            .model_params
            .as_ref()
            .and_then(|p| p.max_tokens)
            .or_else(|| session.model_params.as_ref().and_then(|p| p.max_tokens))
            .or_else(|| global.model_params.as_ref().and_then(|p| p.max_tokens)),
        top_p: params(|p| p.top_p),
    };

    let stream_chunks = request
        .policies
        .as_ref()
        .and_then(|p| p.stream_chunks)
        .or_else(|| session.policies.as_ref().and_then(|p| p.stream_chunks))
        .or_else(|| global.policies.as_ref().and_then(|p| p.stream_chunks))
        .unwrap_or(true);

    let max_itinerary_pois = request
        .policies
        .as_ref()
        .and_then(|p| p.max_itinerary_pois)
        .or_else(|| session.policies.as_ref().and_then(|p| p.max_itinerary_pois))
        .or_else(|| global.policies.as_ref().and_then(|p| p.max_itinerary_pois))
        .unwrap_or(8);

    EffectiveSettings {
        model,
        model_params,
        stream_chunks,
        max_itinerary_pois,
    }
}

/// Bounds for one turn's event channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliverySettings {
    pub capacity: usize,
    pub send_timeout: Duration,
    pub retry_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            capacity: 100,
            send_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(100),
            max_attempts: 3,
        }
    }
}

/// Process-wide configuration assembled from the command line and environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub defaults: GlobalConfigDefaults,
    pub delivery: DeliverySettings,
    pub session_ttl: chrono::Duration,
    /// A turn still running after this is cancelled.
    pub turn_timeout: std::time::Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: GlobalConfigDefaults::default(),
            delivery: DeliverySettings::default(),
            session_ttl: chrono::Duration::hours(24),
            turn_timeout: std::time::Duration::from_secs(180),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_request_over_session_over_global() {
        let global = GlobalConfigDefaults {
            default_model: Some("global-model".into()),
            model_params: Some(ModelParams {
                temperature: Some(0.1),
                max_tokens: Some(1000),
                top_p: Some(0.9),
            }),
            policies: Some(GenerationPolicies {
                stream_chunks: Some(true),
                max_itinerary_pois: Some(6),
            }),
        };

        let session = SessionSettings {
            default_model: Some("session-model".into()),
            model_params: Some(ModelParams {
                temperature: Some(0.2),
                max_tokens: None,
                top_p: None,
            }),
            policies: Some(GenerationPolicies {
                stream_chunks: Some(false),
                max_itinerary_pois: None,
            }),
        };

        let request = RequestOverrides {
            model: Some("request-model".into()),
            model_params: Some(ModelParams {
                temperature: None,
                max_tokens: Some(2048),
                top_p: None,
            }),
            policies: Some(GenerationPolicies {
                stream_chunks: None,
                max_itinerary_pois: Some(10),
            }),
        };

        let eff = resolve_effective_settings(&global, &session, &request);

        assert_eq!(eff.model, "request-model");
        assert_eq!(eff.model_params.temperature, Some(0.2)); // from session
        assert_eq!(eff.model_params.max_tokens, Some(2048)); // from request
        assert_eq!(eff.model_params.top_p, Some(0.9)); // from global
        assert!(!eff.stream_chunks); // from session
        assert_eq!(eff.max_itinerary_pois, 10); // from request
    }

    #[test]
    fn empty_layers_fall_back_to_builtins() {
        let eff = resolve_effective_settings(
            &GlobalConfigDefaults::default(),
            &SessionSettings::default(),
            &RequestOverrides::default(),
        );
        assert_eq!(eff.model, DEFAULT_MODEL);
        assert!(eff.stream_chunks);
        assert_eq!(eff.max_itinerary_pois, 8);
        assert_eq!(eff.model_params, ModelParams::default());
    }

    #[test]
    fn delivery_defaults() {
        let d = DeliverySettings::default();
        assert_eq!(d.send_timeout, Duration::from_secs(2));
        assert_eq!(d.retry_backoff, Duration::from_millis(100));
        assert_eq!(d.max_attempts, 3);
    }
}
