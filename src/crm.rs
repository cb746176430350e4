//! Bitrix24 CRM client.
//!
//! Talks to a Bitrix24 inbound webhook over REST: deal lookup, product
//! rows, catalog products, the two discount-policy records, and the
//! write-back of allocated rows.  The webhook base URL comes from the
//! credential store; every call is a POST with query parameters, the way
//! the portal's REST dispatcher expects them.

use crate::config::CrmConfig;
use crate::models::{AllocatedLine, ProductLine};
use futures::future::try_join_all;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use thiserror::Error;

/// Errors raised while talking to the CRM.
#[derive(Debug, Error)]
pub enum CrmError {
    /// Transport-level failure (connection, TLS, malformed JSON).
    #[error("CRM request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The CRM answered, but with an error envelope or without a result.
    #[error("CRM call {method} failed: {description}")]
    Api { method: String, description: String },
}

/// Standard Bitrix response envelope.  Every method wraps its payload in
/// `result` and reports failures through `error`/`error_description`.
#[derive(Debug, Deserialize)]
struct BitrixResponse<T> {
    result: Option<T>,
    error: Option<String>,
    error_description: Option<String>,
}

impl<T> BitrixResponse<T> {
    fn into_result(self, method: &str) -> Result<T, CrmError> {
        let BitrixResponse {
            result,
            error,
            error_description,
        } = self;
        match (error, result) {
            (None, Some(result)) => Ok(result),
            (error, _) => Err(CrmError::Api {
                method: method.to_string(),
                description: error_description
                    .or(error)
                    .unwrap_or_else(|| "empty result".to_string()),
            }),
        }
    }
}

/// One product row of a deal as the CRM returns it.  Numeric fields arrive
/// as numbers or numeric strings depending on the portal version; the
/// decimal deserialiser accepts both.
#[derive(Debug, Clone, Deserialize)]
pub struct ProductRow {
    #[serde(rename = "PRODUCT_ID", deserialize_with = "id_number")]
    pub product_id: i64,
    /// Price per unit with discount applied.
    #[serde(rename = "PRICE")]
    pub price: Decimal,
    /// Price per unit before discount.
    #[serde(rename = "PRICE_NETTO")]
    pub price_netto: Decimal,
    #[serde(rename = "QUANTITY")]
    pub quantity: Decimal,
    /// Absolute discount per unit, if any.
    #[serde(rename = "DISCOUNT_SUM", default)]
    pub discount_sum: Option<Decimal>,
}

/// A product row in the shape `crm.deal.productrows.set` expects.
#[derive(Debug, Clone, Serialize)]
pub struct ProductRowUpdate {
    #[serde(rename = "PRODUCT_ID")]
    pub product_id: String,
    #[serde(rename = "PRICE")]
    pub price: Decimal,
    #[serde(rename = "QUANTITY")]
    pub quantity: Decimal,
    /// 1 marks the discount as an absolute per-unit amount.
    #[serde(rename = "DISCOUNT_TYPE_ID")]
    pub discount_type_id: u8,
    #[serde(rename = "DISCOUNT_SUM")]
    pub discount_sum: Decimal,
}

impl From<&AllocatedLine> for ProductRowUpdate {
    fn from(line: &AllocatedLine) -> Self {
        Self {
            product_id: line.product_id.clone(),
            price: line.unit_price,
            quantity: line.quantity,
            discount_type_id: 1,
            discount_sum: line.discount_per_unit,
        }
    }
}

/// Catalog product metadata.  Variations point at their parent product
/// through `parentId`; the policy lists may name either one.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogProduct {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "parentId", default)]
    pub parent_id: Option<ParentRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParentRef {
    #[serde(default)]
    pub value: Value,
}

impl CatalogProduct {
    pub fn parent_id_string(&self) -> Option<String> {
        self.parent_id.as_ref().and_then(|p| id_to_string(&p.value))
    }
}

/// The discount rules resolved from the two policy records: which products
/// never take bonus discount, and which carry an overridden cap.
#[derive(Debug, Clone, Default)]
pub struct DiscountPolicy {
    pub no_bonus_product_ids: HashSet<String>,
    pub max_discount_product_ids: HashSet<String>,
    /// Cap override as a fraction, already divided by 100.  `None` when
    /// the record leaves the percent unset (or zero).
    pub max_discount_percent: Option<Decimal>,
}

impl DiscountPolicy {
    /// A product is eligible unless it, or its catalog parent, is on the
    /// no-bonus list.
    pub fn is_eligible(&self, product_id: &str, parent_id: Option<&str>) -> bool {
        !(self.no_bonus_product_ids.contains(product_id)
            || parent_id.is_some_and(|id| self.no_bonus_product_ids.contains(id)))
    }

    /// The cap for a product: the override percent when the product or its
    /// parent is listed and the percent is set, the default otherwise.
    pub fn cap_percent(
        &self,
        product_id: &str,
        parent_id: Option<&str>,
        default_cap: Decimal,
    ) -> Decimal {
        let listed = self.max_discount_product_ids.contains(product_id)
            || parent_id.is_some_and(|id| self.max_discount_product_ids.contains(id));
        if listed {
            self.max_discount_percent.unwrap_or(default_cap)
        } else {
            default_cap
        }
    }
}

/// REST client bound to one decrypted webhook base URL.
pub struct BitrixClient {
    http: reqwest::Client,
    base_url: String,
}

impl BitrixClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self { http, base_url }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T, CrmError> {
        let url = format!("{}{}", self.base_url, method);
        let mut request = self.http.post(&url).query(query);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response: BitrixResponse<T> = request.send().await?.json().await?;
        response.into_result(method)
    }

    /// Fetches the raw deal record.
    pub async fn deal_get(&self, deal_id: &str) -> Result<Value, CrmError> {
        self.call("crm.deal.get", &[("id", deal_id.to_string())], None)
            .await
    }

    /// Fetches the deal's product rows.
    pub async fn product_rows_get(&self, deal_id: &str) -> Result<Vec<ProductRow>, CrmError> {
        self.call(
            "crm.deal.productrows.get",
            &[("id", deal_id.to_string())],
            None,
        )
        .await
    }

    /// Fetches one catalog product.
    pub async fn catalog_product_get(&self, product_id: &str) -> Result<CatalogProduct, CrmError> {
        #[derive(Deserialize)]
        struct ProductEnvelope {
            product: CatalogProduct,
        }
        let envelope: ProductEnvelope = self
            .call(
                "catalog.product.get",
                &[("id", product_id.to_string())],
                None,
            )
            .await?;
        Ok(envelope.product)
    }

    /// Fetches one smart-process item as raw JSON; the interesting field
    /// names are configuration, not schema.
    pub async fn item_get(&self, entity_type_id: u32, item_id: u64) -> Result<Value, CrmError> {
        #[derive(Deserialize)]
        struct ItemEnvelope {
            item: Value,
        }
        let envelope: ItemEnvelope = self
            .call(
                "crm.item.get",
                &[
                    ("entityTypeId", entity_type_id.to_string()),
                    ("id", item_id.to_string()),
                ],
                None,
            )
            .await?;
        Ok(envelope.item)
    }

    /// Resolves the discount policy from the no-bonus record and the
    /// max-discount record.
    pub async fn discount_policy(&self, config: &CrmConfig) -> Result<DiscountPolicy, CrmError> {
        let no_bonus = self
            .item_get(config.no_bonus.entity_type_id, config.no_bonus.item_id)
            .await?;
        let max_discount = self
            .item_get(config.max_discount.entity_type_id, config.max_discount.item_id)
            .await?;

        let max_discount_percent = max_discount
            .get(&config.max_discount.percent_field)
            .map(decimal_from_value)
            .map(|percent| percent / Decimal::ONE_HUNDRED)
            .filter(|percent| !percent.is_zero());

        Ok(DiscountPolicy {
            no_bonus_product_ids: id_list(no_bonus.get(&config.no_bonus.products_field)),
            max_discount_product_ids: id_list(
                max_discount.get(&config.max_discount.products_field),
            ),
            max_discount_percent,
        })
    }

    /// Looks up every row's catalog product (concurrently) and assembles
    /// the engine's input lines with eligibility and caps resolved.
    pub async fn load_product_lines(
        &self,
        rows: &[ProductRow],
        policy: &DiscountPolicy,
        default_cap: Decimal,
    ) -> Result<Vec<ProductLine>, CrmError> {
        let product_ids: Vec<String> =
            rows.iter().map(|row| row.product_id.to_string()).collect();
        let products = try_join_all(
            product_ids
                .iter()
                .map(|product_id| self.catalog_product_get(product_id)),
        )
        .await?;

        Ok(rows
            .iter()
            .zip(products)
            .map(|(row, product)| {
                let product_id = row.product_id.to_string();
                let parent_id = product.parent_id_string();
                ProductLine {
                    eligible: policy.is_eligible(&product_id, parent_id.as_deref()),
                    cap_percent: policy.cap_percent(&product_id, parent_id.as_deref(), default_cap),
                    product_id,
                    name: product.name,
                    unit_price: row.price_netto,
                    quantity: row.quantity,
                    existing_discount_per_unit: row.discount_sum.unwrap_or_default(),
                }
            })
            .collect())
    }

    /// Replaces the deal's product rows.
    pub async fn product_rows_set(
        &self,
        deal_id: &str,
        rows: &[ProductRowUpdate],
    ) -> Result<(), CrmError> {
        let body = json!({ "id": deal_id, "rows": rows });
        let _: Value = self
            .call("crm.deal.productrows.set", &[], Some(&body))
            .await?;
        Ok(())
    }

    /// Updates fields on the deal record.
    pub async fn deal_update(&self, deal_id: &str, fields: Value) -> Result<(), CrmError> {
        let body = json!({ "id": deal_id, "fields": fields });
        let _: Value = self.call("crm.deal.update", &[], Some(&body)).await?;
        Ok(())
    }
}

/// Reads a currency amount out of a deal field, tolerating both string and
/// number representations.  Anything unreadable counts as zero.
pub fn deal_bonus_amount(deal: &Value, field: &str) -> Decimal {
    deal.get(field).map(decimal_from_value).unwrap_or_default()
}

/// Deal total across product rows: `Σ (price − discount) × quantity`.
pub fn deal_opportunity(rows: &[ProductRow]) -> Decimal {
    rows.iter()
        .map(|row| (row.price - row.discount_sum.unwrap_or_default()) * row.quantity)
        .sum()
}

fn decimal_from_value(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.trim().parse().unwrap_or_default(),
        Value::Number(n) => n.to_string().parse().unwrap_or_default(),
        _ => Decimal::ZERO,
    }
}

/// Product ids show up as numbers or numeric strings depending on the
/// portal version.
fn id_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| D::Error::custom("product id is not an integer")),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom("product id is not an integer")),
        _ => Err(D::Error::custom("product id is not an integer")),
    }
}

fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn id_list(value: Option<&Value>) -> HashSet<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(id_to_string).collect())
        .unwrap_or_default()
}
