//! Page Classifier contract.
//!
//! Whatever computes field mappings (static heuristics, a language model, a
//! calibration file) sits behind [`PageClassifier`]. The engine only relies on
//! the request/response shapes here. [`HttpClassifier`] talks to a remote
//! classification service over JSON.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ClassifierError;
use crate::types::{ActionSpec, FieldMapping, PageSnapshot, SourceValues};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifyRequest<'a> {
    pub markup: &'a str,
    pub current_url: &'a str,
    pub task: &'a str,
}

/// Classifier output for one page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Classification {
    pub ok: bool,
    pub field_mapping: FieldMapping,
    pub actions: Vec<ActionSpec>,
    pub is_final: bool,
    pub cta_present: bool,
    pub critical_fields: Option<Vec<String>>,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FinalityVerdict {
    pub is_final: bool,
    pub hits: Vec<String>,
}

/// How well the critical fields of a mapping can be resolved from the source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationResult {
    pub ok: bool,
    pub missing: Vec<String>,
    pub resolved: usize,
    pub total: usize,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FallbackDecision {
    pub should_fallback: bool,
    pub reason: Option<String>,
    pub threshold: Option<f64>,
}

#[async_trait]
pub trait PageClassifier: Send + Sync {
    async fn classify(
        &self,
        snapshot: &PageSnapshot,
        task: &str,
    ) -> Result<Classification, ClassifierError>;

    /// Whether at least `min_filled` inputs on the markup look filled.
    async fn fields_filled(&self, html: &str, min_filled: usize) -> Result<bool, ClassifierError>;

    async fn detect_final(&self, html: &str, current_url: &str)
    -> Result<FinalityVerdict, ClassifierError>;

    async fn validate_critical(
        &self,
        mapping: &FieldMapping,
        source: &SourceValues,
        critical_override: Option<&[String]>,
    ) -> Result<ValidationResult, ClassifierError>;

    async fn should_fallback(
        &self,
        validation: &ValidationResult,
    ) -> Result<FallbackDecision, ClassifierError>;

    /// Ranked click targets that lead from a landing page into the flow.
    async fn entry_targets(
        &self,
        snapshot: &PageSnapshot,
        task: &str,
    ) -> Result<Vec<ActionSpec>, ClassifierError>;
}

/// JSON-over-HTTP classifier client.
#[derive(Clone)]
pub struct HttpClassifier {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FieldsFilledRequest<'a> {
    html: &'a str,
    min_filled: usize,
}

#[derive(Deserialize)]
struct OkResponse {
    #[serde(default)]
    ok: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DetectFinalRequest<'a> {
    html: &'a str,
    current_url: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidateRequest<'a> {
    field_mapping: &'a FieldMapping,
    source_values: &'a SourceValues,
    critical_fields_override: Option<&'a [String]>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FallbackRequest<'a> {
    validation_result: &'a ValidationResult,
}

#[derive(Deserialize)]
struct EntryTargetsResponse {
    #[serde(default)]
    targets: Vec<ActionSpec>,
}

impl HttpClassifier {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClassifierError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClassifierError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ClassifierError::Unreachable(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, ClassifierError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = self.endpoint(path);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ClassifierError::Unreachable(format!("{url}: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable>".to_string());
            warn!(%url, status = status.as_u16(), "classifier call failed");
            return Err(ClassifierError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let parsed = response
            .json::<R>()
            .await
            .map_err(|err| ClassifierError::Decode(format!("{url}: {err}")))?;
        debug!(%url, "classifier call succeeded");
        Ok(parsed)
    }
}

#[async_trait]
impl PageClassifier for HttpClassifier {
    async fn classify(
        &self,
        snapshot: &PageSnapshot,
        task: &str,
    ) -> Result<Classification, ClassifierError> {
        self.post(
            "classify",
            &ClassifyRequest {
                markup: &snapshot.markup,
                current_url: &snapshot.url,
                task,
            },
        )
        .await
    }

    async fn fields_filled(&self, html: &str, min_filled: usize) -> Result<bool, ClassifierError> {
        let response: OkResponse = self
            .post("fields-filled", &FieldsFilledRequest { html, min_filled })
            .await?;
        Ok(response.ok)
    }

    async fn detect_final(
        &self,
        html: &str,
        current_url: &str,
    ) -> Result<FinalityVerdict, ClassifierError> {
        self.post("detect-final", &DetectFinalRequest { html, current_url })
            .await
    }

    async fn validate_critical(
        &self,
        mapping: &FieldMapping,
        source: &SourceValues,
        critical_override: Option<&[String]>,
    ) -> Result<ValidationResult, ClassifierError> {
        self.post(
            "validate",
            &ValidateRequest {
                field_mapping: mapping,
                source_values: source,
                critical_fields_override: critical_override,
            },
        )
        .await
    }

    async fn should_fallback(
        &self,
        validation: &ValidationResult,
    ) -> Result<FallbackDecision, ClassifierError> {
        self.post(
            "should-fallback",
            &FallbackRequest {
                validation_result: validation,
            },
        )
        .await
    }

    async fn entry_targets(
        &self,
        snapshot: &PageSnapshot,
        task: &str,
    ) -> Result<Vec<ActionSpec>, ClassifierError> {
        let response: EntryTargetsResponse = self
            .post(
                "entry-targets",
                &ClassifyRequest {
                    markup: &snapshot.markup,
                    current_url: &snapshot.url,
                    task,
                },
            )
            .await?;
        Ok(response.targets)
    }
}
