//! Payment gateway codec.
//!
//! The gateway speaks flat `key=value` maps signed with HMAC-SHA512. A map is
//! signed over its fields sorted by key, url-encoded and joined with `&`,
//! leaving out `secure_hash` and `secure_hash_type`. The same canonical string
//! is the query of the redirect URL, so a redirect can be verified with
//! [`PaymentGateway::verify`] exactly like a callback.

use crate::config::GatewayConfig;
use boxoffice_core::model::GatewayMetadata;
use boxoffice_core::money::Money;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha512;
use std::collections::BTreeMap;
use thiserror::Error;

type HmacSha512 = Hmac<Sha512>;

/// Signature field.
pub const SECURE_HASH: &str = "secure_hash";
/// Signature type field, never signed.
pub const SECURE_HASH_TYPE: &str = "secure_hash_type";

const TXN_REF: &str = "txn_ref";
const AMOUNT: &str = "amount";
const RESPONSE_CODE: &str = "response_code";
const TRANSACTION_NO: &str = "transaction_no";

/// Gateway date format (`yyyyMMddHHmmss`).
const DATE_FORMAT: &str = "%Y%m%d%H%M%S";

/// Gateway codec errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// A required field is absent.
    #[error("Missing gateway field: {0}")]
    MissingField(&'static str),

    /// Signature does not match the fields.
    #[error("Invalid gateway signature")]
    InvalidSignature,

    /// Amount field is not an integer.
    #[error("Invalid gateway amount: {0}")]
    InvalidAmount(String),

    /// Amount does not fit the gateway's scale.
    #[error("Amount {0} overflows the gateway amount scale")]
    AmountOverflow(Money),

    /// The HMAC key was refused.
    #[error("Invalid gateway secret")]
    InvalidSecret,
}

/// Input for a redirect URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRequest {
    /// Payment reference (`txn_ref`)
    pub reference: String,
    /// Gross amount in minor units
    pub gross: Money,
    /// Free text shown on the payment page
    pub order_info: String,
    /// Where the buyer lands afterwards
    pub return_url: String,
    /// Where the gateway posts the callback
    pub notify_url: String,
    /// Intent creation time
    pub created_at: DateTime<Utc>,
    /// End of the payment window
    pub expires_at: DateTime<Utc>,
}

/// A verified callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCallback {
    /// Payment reference
    pub reference: String,
    /// Echoed amount, in gateway units
    pub amount: u64,
    /// Whether the gateway reports success
    pub success: bool,
    /// Transaction details to keep on the payment
    pub metadata: GatewayMetadata,
}

/// Signs redirects and verifies callbacks for one merchant.
#[derive(Debug, Clone)]
pub struct PaymentGateway {
    config: GatewayConfig,
}

impl PaymentGateway {
    /// Create a codec for the configured merchant.
    #[must_use]
    pub const fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Gateway amount for a gross amount.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AmountOverflow`] if scaling overflows.
    pub fn gateway_amount(&self, gross: Money) -> Result<u64, GatewayError> {
        gross
            .checked_scale(self.config.amount_scale)
            .map(|scaled| scaled.minor())
            .ok_or(GatewayError::AmountOverflow(gross))
    }

    /// Build the signed redirect URL for a payment.
    ///
    /// # Errors
    ///
    /// Returns an error if the amount overflows or signing fails.
    pub fn redirect_url(&self, request: &RedirectRequest) -> Result<String, GatewayError> {
        let mut fields = BTreeMap::new();
        fields.insert("version".to_string(), self.config.version.clone());
        fields.insert("command".to_string(), "pay".to_string());
        fields.insert("merchant".to_string(), self.config.merchant_code.clone());
        fields.insert(
            AMOUNT.to_string(),
            self.gateway_amount(request.gross)?.to_string(),
        );
        fields.insert("currency".to_string(), self.config.currency.clone());
        fields.insert(TXN_REF.to_string(), request.reference.clone());
        fields.insert("order_info".to_string(), request.order_info.clone());
        fields.insert("return_url".to_string(), request.return_url.clone());
        fields.insert("notify_url".to_string(), request.notify_url.clone());
        fields.insert(
            "create_date".to_string(),
            request.created_at.format(DATE_FORMAT).to_string(),
        );
        fields.insert(
            "expire_date".to_string(),
            request.expires_at.format(DATE_FORMAT).to_string(),
        );

        let query = canonical_query(&fields);
        let signature = self.sign_canonical(&query)?;
        Ok(format!(
            "{}?{query}&{SECURE_HASH}={signature}",
            self.config.pay_url
        ))
    }

    /// Hex HMAC-SHA512 signature of a field map.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidSecret`] if the key is refused.
    pub fn sign(&self, fields: &BTreeMap<String, String>) -> Result<String, GatewayError> {
        self.sign_canonical(&canonical_query(fields))
    }

    /// Verify a callback and extract its outcome.
    ///
    /// The signature is checked before any field is interpreted.
    ///
    /// # Errors
    ///
    /// Returns an error if the signature is missing or wrong, or a required
    /// field is missing or malformed.
    pub fn verify(
        &self,
        fields: &BTreeMap<String, String>,
    ) -> Result<GatewayCallback, GatewayError> {
        let provided = fields
            .get(SECURE_HASH)
            .ok_or(GatewayError::MissingField(SECURE_HASH))?;
        let expected = self.sign(fields)?;
        if !constant_time_eq::constant_time_eq(
            expected.as_bytes(),
            provided.to_ascii_lowercase().as_bytes(),
        ) {
            return Err(GatewayError::InvalidSignature);
        }

        let reference = fields
            .get(TXN_REF)
            .ok_or(GatewayError::MissingField(TXN_REF))?
            .clone();
        let raw_amount = fields.get(AMOUNT).ok_or(GatewayError::MissingField(AMOUNT))?;
        let amount = raw_amount
            .trim()
            .parse::<u64>()
            .map_err(|_| GatewayError::InvalidAmount(raw_amount.clone()))?;
        let response_code = fields
            .get(RESPONSE_CODE)
            .ok_or(GatewayError::MissingField(RESPONSE_CODE))?
            .clone();

        let extra = fields
            .iter()
            .filter(|(key, _)| {
                ![SECURE_HASH, SECURE_HASH_TYPE, TXN_REF, AMOUNT, RESPONSE_CODE, TRANSACTION_NO]
                    .contains(&key.as_str())
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(GatewayCallback {
            reference,
            amount,
            success: response_code == self.config.success_code,
            metadata: GatewayMetadata {
                transaction_no: fields.get(TRANSACTION_NO).cloned(),
                response_code: Some(response_code),
                extra,
            },
        })
    }

    fn sign_canonical(&self, canonical: &str) -> Result<String, GatewayError> {
        let mut mac = HmacSha512::new_from_slice(self.config.hash_secret.as_bytes())
            .map_err(|_| GatewayError::InvalidSecret)?;
        mac.update(canonical.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Key-sorted, url-encoded `key=value` pairs joined with `&`, signature
/// fields excluded.
fn canonical_query(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .filter(|(key, _)| key.as_str() != SECURE_HASH && key.as_str() != SECURE_HASH_TYPE)
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn gateway() -> PaymentGateway {
        PaymentGateway::new(GatewayConfig {
            merchant_code: "BOXOFFICE".to_string(),
            hash_secret: "s3cret".to_string(),
            ..GatewayConfig::default()
        })
    }

    fn callback(reference: &str, amount: &str, code: &str) -> BTreeMap<String, String> {
        let mut fields: BTreeMap<String, String> = [
            (TXN_REF, reference),
            (AMOUNT, amount),
            (RESPONSE_CODE, code),
            (TRANSACTION_NO, "14001234"),
            ("bank_code", "NCB"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let signature = gateway().sign(&fields).unwrap();
        fields.insert(SECURE_HASH.to_string(), signature);
        fields
    }

    /// Parse a redirect URL back into its fields.
    fn query_fields(url: &str) -> BTreeMap<String, String> {
        let (_, query) = url.split_once('?').unwrap();
        query
            .split('&')
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap();
                (
                    urlencoding::decode(key).unwrap().into_owned(),
                    urlencoding::decode(value).unwrap().into_owned(),
                )
            })
            .collect()
    }

    fn redirect() -> RedirectRequest {
        let created_at = DateTime::parse_from_rfc3339("2025-01-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        RedirectRequest {
            reference: "a1b2c3".to_string(),
            gross: Money::from_minor(100_000),
            order_info: "Checkout a1b2c3 (2 seats)".to_string(),
            return_url: "https://shop.local/return?x=1&y=2".to_string(),
            notify_url: "https://shop.local/ipn".to_string(),
            created_at,
            expires_at: created_at + chrono::Duration::minutes(15),
        }
    }

    #[test]
    fn redirect_url_carries_scaled_amount_and_verifies() {
        let gateway = gateway();
        let url = gateway.redirect_url(&redirect()).unwrap();
        assert!(url.starts_with("https://sandbox.gateway.local/paymentv2/pay?"));

        let mut fields = query_fields(&url);
        assert_eq!(fields["amount"], "10000000");
        assert_eq!(fields["command"], "pay");
        assert_eq!(fields["create_date"], "20250101100000");
        assert_eq!(fields["expire_date"], "20250101101500");
        assert_eq!(fields["return_url"], "https://shop.local/return?x=1&y=2");

        // A redirect has no response code; add one so it parses as a callback.
        fields.insert(RESPONSE_CODE.to_string(), "00".to_string());
        assert_eq!(gateway.verify(&fields), Err(GatewayError::InvalidSignature));
        fields.remove(RESPONSE_CODE);
        let signature = fields[SECURE_HASH].clone();
        assert_eq!(gateway.sign(&fields).unwrap(), signature);
    }

    #[test]
    fn verify_accepts_signed_callback() {
        let verified = gateway().verify(&callback("a1b2c3", "10000000", "00")).unwrap();
        assert_eq!(verified.reference, "a1b2c3");
        assert_eq!(verified.amount, 10_000_000);
        assert!(verified.success);
        assert_eq!(verified.metadata.transaction_no.as_deref(), Some("14001234"));
        assert_eq!(verified.metadata.extra.get("bank_code").map(String::as_str), Some("NCB"));
    }

    #[test]
    fn declined_code_is_not_success() {
        let verified = gateway().verify(&callback("a1b2c3", "10000000", "24")).unwrap();
        assert!(!verified.success);
    }

    #[test]
    fn tampered_field_fails_verification() {
        let mut fields = callback("a1b2c3", "10000000", "00");
        fields.insert(AMOUNT.to_string(), "9000000".to_string());
        assert_eq!(gateway().verify(&fields), Err(GatewayError::InvalidSignature));
    }

    #[test]
    fn signature_type_and_case_do_not_matter() {
        let mut fields = callback("a1b2c3", "10000000", "00");
        fields.insert(SECURE_HASH_TYPE.to_string(), "HmacSHA512".to_string());
        let upper = fields[SECURE_HASH].to_ascii_uppercase();
        fields.insert(SECURE_HASH.to_string(), upper);
        assert!(gateway().verify(&fields).is_ok());
    }

    #[test]
    fn other_secret_fails_verification() {
        let other = PaymentGateway::new(GatewayConfig {
            hash_secret: "other".to_string(),
            ..GatewayConfig::default()
        });
        assert_eq!(
            other.verify(&callback("a1b2c3", "10000000", "00")),
            Err(GatewayError::InvalidSignature)
        );
    }

    #[test]
    fn missing_signature_is_reported() {
        let mut fields = callback("a1b2c3", "10000000", "00");
        fields.remove(SECURE_HASH);
        assert_eq!(
            gateway().verify(&fields),
            Err(GatewayError::MissingField(SECURE_HASH))
        );
    }

    #[test]
    fn gateway_amount_overflow_is_an_error() {
        assert_eq!(
            gateway().gateway_amount(Money::from_minor(u64::MAX)),
            Err(GatewayError::AmountOverflow(Money::from_minor(u64::MAX)))
        );
    }
}
