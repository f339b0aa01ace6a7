//! Order extractor: asks the model for `(product, quantity)` pairs.
//!
//! One completion per email body, no retries. Every failure degrades to
//! "no orders" for that message; [`OrderExtractor::try_extract`] keeps the
//! failure visible for callers that want to tell the cases apart.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use crate::error::ExtractionError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};

/// Temperature for extraction (we want the same answer every time).
const EXTRACTION_TEMPERATURE: f32 = 0.0;

/// Max tokens for the extraction reply.
const EXTRACTION_MAX_TOKENS: u32 = 1024;

const SYSTEM_PROMPT: &str = "You are a specialized assistant that accurately extracts order \
     information, including product names and quantities, from email bodies. You should always \
     respond with a well-structured JSON object.";

const USER_INSTRUCTIONS: &str = "Please analyze the following email body to extract order \
     information. Always give your answers in Polish. The response should be in JSON format with \
     the structure: {\"orders\": [{\"product\": \"product_name\", \"quantity\": \"quantity\"}]}. \
     If no order information is found, return an empty JSON object. Here is the email body:";

/// One extracted order line. Quantity stays free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderLine {
    pub product: String,
    pub quantity: String,
}

impl OrderLine {
    pub fn new(product: impl Into<String>, quantity: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            quantity: quantity.into(),
        }
    }
}

/// Extracts order lines from email bodies with an LLM.
pub struct OrderExtractor {
    llm: Arc<dyn LlmProvider>,
}

impl OrderExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Extract order lines. Never fails: errors are logged and yield no orders.
    pub async fn extract(&self, body: &str) -> Vec<OrderLine> {
        match self.try_extract(body).await {
            Ok(orders) => {
                debug!(count = orders.len(), "Extracted order lines");
                orders
            }
            Err(e) => {
                error!(error = %e, model = self.llm.model_name(), "Order extraction failed");
                Vec::new()
            }
        }
    }

    /// Extract order lines, keeping malformed replies distinct from "no orders".
    pub async fn try_extract(&self, body: &str) -> Result<Vec<OrderLine>, ExtractionError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(build_user_prompt(body)),
        ])
        .with_temperature(EXTRACTION_TEMPERATURE)
        .with_max_tokens(EXTRACTION_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        parse_orders_response(&response.content)
    }
}

/// Fixed instructions followed by the email body.
pub fn build_user_prompt(body: &str) -> String {
    format!("{USER_INSTRUCTIONS}\n\n{body}")
}

// ── Response parsing ────────────────────────────────────────────────

/// Parse the model reply as strict JSON; only surrounding whitespace is
/// ignored.
///
/// - `{}` or `{"orders": []}` / `{"orders": null}` → no orders
/// - `{"orders": [...]}` → one line per entry with a non-empty `product`
/// - anything else → [`ExtractionError::MalformedResponse`]
pub fn parse_orders_response(raw: &str) -> Result<Vec<OrderLine>, ExtractionError> {
    let value: Value =
        serde_json::from_str(raw.trim()).map_err(|e| ExtractionError::MalformedResponse {
            reason: format!("JSON parse error: {e}"),
        })?;

    let Value::Object(map) = value else {
        return Err(ExtractionError::MalformedResponse {
            reason: "response is not a JSON object".into(),
        });
    };

    let orders = match map.get("orders") {
        Some(Value::Array(items)) => items,
        Some(Value::Null) => return Ok(Vec::new()),
        Some(other) => {
            return Err(ExtractionError::MalformedResponse {
                reason: format!("'orders' is not an array: {other}"),
            });
        }
        None if map.is_empty() => return Ok(Vec::new()),
        None => {
            return Err(ExtractionError::MalformedResponse {
                reason: "object has no 'orders' key".into(),
            });
        }
    };

    Ok(orders
        .iter()
        .filter_map(|item| {
            let product = item.get("product").and_then(scalar_text)?;
            if product.is_empty() {
                return None;
            }
            let quantity = item.get("quantity").and_then(scalar_text).unwrap_or_default();
            Some(OrderLine { product, quantity })
        })
        .collect())
}

/// Render a JSON string, number or bool as text.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
