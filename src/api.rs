//! HTTP API of the bonus allocation service.
//!
//! Three endpoints, all POST, all answering with the same JSON envelope:
//!
//! - `/init` stores the CRM webhook link (sealed, see
//!   [`crate::credentials`]);
//! - `/bonus_deduct/:deal_id` runs the full pipeline: deal and product
//!   rows from the CRM, policy records, allocation, write-back of the
//!   updated rows and the allocation note;
//! - `/calculate_opportunity/:deal_id` recomputes the deal total from its
//!   product rows.
//!
//! The handlers hold no state of their own; everything shared lives in
//! [`AppState`], with the mutable credential slot behind an `RwLock`.

use crate::config::AppConfig;
use crate::credentials::{CredentialError, CredentialStore, StoredCredentials};
use crate::crm::{self, BitrixClient, CrmError, ProductRowUpdate};
use crate::engine::{self, AllocationError};
use crate::models::AllocationPolicy;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Application state shared across requests.
pub struct AppState {
    pub config: AppConfig,
    store: CredentialStore,
    http: reqwest::Client,
    credentials: RwLock<Option<StoredCredentials>>,
}

impl AppState {
    /// Builds the state, loading any previously stored credentials.
    pub fn new(config: AppConfig) -> Result<Self, CredentialError> {
        let store = CredentialStore::new(config.credentials_path.clone());
        let credentials = store.load()?;
        if credentials.is_none() {
            warn!("no webhook credentials found; POST /init to initialise");
        }
        Ok(Self {
            config,
            store,
            http: reqwest::Client::new(),
            credentials: RwLock::new(credentials),
        })
    }

    /// A CRM client bound to the decrypted webhook URL.
    async fn client(&self) -> Result<BitrixClient, ServiceError> {
        let guard = self.credentials.read().await;
        let credentials = guard.as_ref().ok_or(ServiceError::NotInitialised)?;
        let base_url = credentials.webhook_url()?;
        Ok(BitrixClient::new(self.http.clone(), base_url))
    }
}

/// Builds the router over the given state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/init", post(init_handler))
        .route("/bonus_deduct/:deal_id", post(bonus_deduct_handler))
        .route(
            "/calculate_opportunity/:deal_id",
            post(calculate_opportunity_handler),
        )
        .with_state(state)
}

/// Launches the server and blocks until it terminates.
pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config)?);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("listening on {bind_addr}");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

/// The response envelope every endpoint answers with.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub status: bool,
    pub status_msg: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opportunity: Option<Decimal>,
}

impl Envelope {
    fn success(message: impl Into<String>) -> Self {
        Self {
            status: true,
            status_msg: "success",
            message: message.into(),
            opportunity: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: false,
            status_msg: "error",
            message: message.into(),
            opportunity: None,
        }
    }

    fn with_opportunity(mut self, opportunity: Decimal) -> Self {
        self.opportunity = Some(opportunity);
        self
    }
}

/// Everything that can go wrong while serving a request.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("a webhook link is required")]
    MissingWebhookLink,
    #[error("a deal id is required")]
    MissingDealId,
    #[error("the service has no webhook link yet; call /init first")]
    NotInitialised,
    #[error("deal {deal_id} carries no positive bonus amount")]
    InvalidBonusAmount { deal_id: String },
    #[error("deal {deal_id} has no product rows")]
    NoProductRows { deal_id: String },
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Crm(#[from] CrmError),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

impl ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingWebhookLink
            | Self::MissingDealId
            | Self::NotInitialised
            | Self::InvalidBonusAmount { .. }
            | Self::NoProductRows { .. } => StatusCode::BAD_REQUEST,
            Self::Allocation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Crm(_) => StatusCode::BAD_GATEWAY,
            Self::Credentials(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "request failed");
        (self.status_code(), Json(Envelope::error(self.to_string()))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub bx_link: Option<String>,
}

/// One-time storage of the webhook link.
async fn init_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<InitRequest>>,
) -> Result<Json<Envelope>, ServiceError> {
    let link = body
        .and_then(|Json(request)| request.bx_link)
        .unwrap_or_default();
    let link = link.trim();
    if link.is_empty() {
        return Err(ServiceError::MissingWebhookLink);
    }

    let sealed = state.store.seal(link)?;
    *state.credentials.write().await = Some(sealed);
    info!("webhook link stored");
    Ok(Json(Envelope::success(
        "the service is ready to work with your CRM",
    )))
}

/// Body accepted by the deal endpoints; the `dealId` field overrides the
/// path parameter when present.
#[derive(Debug, Default, Deserialize)]
pub struct DealRequest {
    #[serde(rename = "dealId")]
    pub deal_id: Option<String>,
}

fn resolve_deal_id(path_id: &str, body: Option<&DealRequest>) -> Result<String, ServiceError> {
    let from_body = body
        .and_then(|request| request.deal_id.as_deref())
        .map(str::trim)
        .filter(|id| !id.is_empty());
    let id = from_body.unwrap_or_else(|| path_id.trim());
    if id.is_empty() {
        return Err(ServiceError::MissingDealId);
    }
    Ok(id.to_string())
}

/// Deducts the deal's bonus amount from its product lines.
async fn bonus_deduct_handler(
    State(state): State<Arc<AppState>>,
    Path(path_id): Path<String>,
    body: Option<Json<DealRequest>>,
) -> Result<Json<Envelope>, ServiceError> {
    let body = body.map(|Json(request)| request);
    let deal_id = resolve_deal_id(&path_id, body.as_ref())?;
    let client = state.client().await?;
    let crm_config = &state.config.crm;

    let deal = client.deal_get(&deal_id).await?;
    let bonus = crm::deal_bonus_amount(&deal, &crm_config.bonus_field);
    if bonus <= Decimal::ZERO {
        return Err(ServiceError::InvalidBonusAmount { deal_id });
    }

    let rows = client.product_rows_get(&deal_id).await?;
    if rows.is_empty() {
        return Err(ServiceError::NoProductRows { deal_id });
    }

    let policy = client.discount_policy(crm_config).await?;
    let lines = client
        .load_product_lines(&rows, &policy, crm_config.default_cap_percent)
        .await?;

    let report = engine::allocate(bonus, &lines, AllocationPolicy::default())?;
    let warnings = report.warnings();
    for warning in &warnings {
        warn!(deal_id = %deal_id, "{warning}");
    }

    let updates: Vec<ProductRowUpdate> = report.lines.iter().map(ProductRowUpdate::from).collect();
    client.product_rows_set(&deal_id, &updates).await?;

    let mut fields = serde_json::Map::new();
    fields.insert(crm_config.note_field.clone(), json!(report.note_lines()));
    client.deal_update(&deal_id, Value::Object(fields)).await?;

    info!(
        deal_id = %deal_id,
        requested = %report.requested,
        applied = %report.applied_total,
        "bonus deducted"
    );

    let message = if warnings.is_empty() {
        "bonus deducted successfully".to_string()
    } else {
        format!("bonus deducted with warnings: {}", warnings.join("; "))
    };
    Ok(Json(Envelope::success(message)))
}

/// Recomputes the deal total from its product rows.
async fn calculate_opportunity_handler(
    State(state): State<Arc<AppState>>,
    Path(path_id): Path<String>,
    body: Option<Json<DealRequest>>,
) -> Result<Json<Envelope>, ServiceError> {
    let body = body.map(|Json(request)| request);
    let deal_id = resolve_deal_id(&path_id, body.as_ref())?;
    let client = state.client().await?;

    let rows = client.product_rows_get(&deal_id).await?;
    if rows.is_empty() {
        return Err(ServiceError::NoProductRows { deal_id });
    }

    let opportunity = crm::deal_opportunity(&rows);
    info!(deal_id = %deal_id, %opportunity, "deal total recomputed");
    Ok(Json(
        Envelope::success("deal total calculated").with_opportunity(opportunity),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serialises_the_crm_shape() {
        let value = serde_json::to_value(Envelope::success("done")).unwrap();
        assert_eq!(value["status"], json!(true));
        assert_eq!(value["status_msg"], json!("success"));
        assert_eq!(value["message"], json!("done"));
        assert!(value.get("opportunity").is_none());

        let value =
            serde_json::to_value(Envelope::error("broken").with_opportunity(Decimal::from(5)))
                .unwrap();
        assert_eq!(value["status"], json!(false));
        assert_eq!(value["status_msg"], json!("error"));
        assert!(value.get("opportunity").is_some());
    }

    #[test]
    fn body_deal_id_wins_over_the_path() {
        let body = DealRequest {
            deal_id: Some("77".to_string()),
        };
        assert_eq!(resolve_deal_id("15", Some(&body)).unwrap(), "77");
    }

    #[test]
    fn path_deal_id_is_the_fallback() {
        assert_eq!(resolve_deal_id("15", None).unwrap(), "15");
        let empty = DealRequest {
            deal_id: Some("   ".to_string()),
        };
        assert_eq!(resolve_deal_id("15", Some(&empty)).unwrap(), "15");
    }

    #[test]
    fn blank_deal_id_is_rejected() {
        assert!(matches!(
            resolve_deal_id("  ", None),
            Err(ServiceError::MissingDealId)
        ));
    }
}
