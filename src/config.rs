//! Service configuration.
//!
//! Everything configurable lives in [`AppConfig`], built once at startup
//! and shared by reference afterwards; nothing reads the process
//! environment after that.  The defaults are the constants of the CRM
//! portal this service was built for, so a bare deployment works without
//! any environment at all.

use rust_decimal::Decimal;
use std::env;
use std::path::PathBuf;

/// A smart-process record holding a list of product ids.
#[derive(Debug, Clone)]
pub struct SmartProcessRef {
    pub entity_type_id: u32,
    pub item_id: u64,
    /// User field on the item that carries the product id list.
    pub products_field: String,
}

/// The smart-process record holding the max-discount override: a percent
/// and the list of products it applies to.
#[derive(Debug, Clone)]
pub struct MaxDiscountRef {
    pub entity_type_id: u32,
    pub item_id: u64,
    /// User field with the percent, stored as a whole number.
    pub percent_field: String,
    /// User field with the product id list.
    pub products_field: String,
}

/// CRM-side identifiers: deal user fields and the two policy records.
#[derive(Debug, Clone)]
pub struct CrmConfig {
    /// Deal field carrying the bonus amount to deduct.
    pub bonus_field: String,
    /// Deal field receiving the allocation note.
    pub note_field: String,
    /// Cap applied to products without a policy override.
    pub default_cap_percent: Decimal,
    pub no_bonus: SmartProcessRef,
    pub max_discount: MaxDiscountRef,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            bonus_field: "UF_CRM_1686472442416".to_string(),
            note_field: "UF_CRM_1744097917673".to_string(),
            default_cap_percent: Decimal::new(15, 2), // 0.15
            no_bonus: SmartProcessRef {
                entity_type_id: 161,
                item_id: 4,
                products_field: "ufCrm6_1745296707776".to_string(),
            },
            max_discount: MaxDiscountRef {
                entity_type_id: 1044,
                item_id: 8,
                percent_field: "ufCrm12_1744002374".to_string(),
                products_field: "ufCrm12_1744639109".to_string(),
            },
        }
    }
}

/// Top-level configuration of the service process.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Where the sealed webhook credentials live.
    pub credentials_path: PathBuf,
    pub crm: CrmConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4213".to_string(),
            credentials_path: PathBuf::from(".env"),
            crm: CrmConfig::default(),
        }
    }
}

impl AppConfig {
    /// Builds the configuration from the environment, falling back to the
    /// defaults for anything unset.
    ///
    /// Recognised variables: `BONUS_BIND_ADDR`, `BONUS_CREDENTIALS_PATH`,
    /// `BONUS_DEAL_FIELD`, `BONUS_NOTE_FIELD`, `BONUS_DEFAULT_CAP`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = env::var("BONUS_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(path) = env::var("BONUS_CREDENTIALS_PATH") {
            config.credentials_path = PathBuf::from(path);
        }
        if let Ok(field) = env::var("BONUS_DEAL_FIELD") {
            config.crm.bonus_field = field;
        }
        if let Ok(field) = env::var("BONUS_NOTE_FIELD") {
            config.crm.note_field = field;
        }
        if let Ok(cap) = env::var("BONUS_DEFAULT_CAP") {
            if let Ok(cap) = cap.parse() {
                config.crm.default_cap_percent = cap;
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_portal_constants() {
        let config = AppConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:4213");
        assert_eq!(config.crm.default_cap_percent, Decimal::new(15, 2));
        assert_eq!(config.crm.no_bonus.entity_type_id, 161);
        assert_eq!(config.crm.max_discount.entity_type_id, 1044);
    }
}
