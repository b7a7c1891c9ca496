//! Webhook signature verification and event parsing.
//!
//! Signatures follow the `t=<unix seconds>,v1=<hex hmac>` header scheme: the
//! HMAC-SHA256 of `"<t>.<payload>"` keyed with the endpoint secret. Several
//! `v1` entries may be present while a secret is being rolled; any match is
//! accepted.

use std::time::Duration;

use domain::Money;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use super::{GatewayError, GatewayEvent, GatewayEventKind};

type HmacSha256 = Hmac<Sha256>;

/// Default tolerance between the signed timestamp and now.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

const SCHEME: &str = "v1";

fn mac(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, GatewayError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::InvalidSignature(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Builds the signature header for `payload` signed at `timestamp`.
pub fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, GatewayError> {
    let signature = hex::encode(mac(secret, timestamp, payload)?.finalize().into_bytes());
    Ok(format!("t={timestamp},{SCHEME}={signature}"))
}

/// Checks a signature header against `payload`.
///
/// Fails if the header is malformed, if no `v1` signature matches, or if the
/// signed timestamp is further than `tolerance` from `now`.
pub fn verify(
    secret: &str,
    header: &str,
    payload: &[u8],
    tolerance: Duration,
    now: i64,
) -> Result<(), GatewayError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            SCHEME => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        GatewayError::InvalidSignature("missing or invalid timestamp".to_string())
    })?;
    if signatures.is_empty() {
        return Err(GatewayError::InvalidSignature(
            "no v1 signature in header".to_string(),
        ));
    }

    let age = now.abs_diff(timestamp);
    if age > tolerance.as_secs() {
        return Err(GatewayError::InvalidSignature(format!(
            "timestamp outside tolerance ({age}s)"
        )));
    }

    let expected = mac(secret, timestamp, payload)?;
    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|bytes| expected.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });

    if !matched {
        return Err(GatewayError::InvalidSignature(
            "signature does not match payload".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawData,
}

#[derive(Debug, Deserialize)]
struct RawData {
    object: RawObject,
}

#[derive(Debug, Deserialize)]
struct RawObject {
    #[serde(default)]
    id: Option<String>,
    /// Set on charge objects; links the charge back to its payment intent.
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    amount_refunded: Option<i64>,
}

/// Parses a verified payload into a typed event.
pub fn parse_event(payload: &[u8]) -> Result<GatewayEvent, GatewayError> {
    let raw: RawEvent = serde_json::from_slice(payload)
        .map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;
    let object = raw.data.object;

    let intent_id = || {
        object
            .id
            .clone()
            .ok_or_else(|| GatewayError::MalformedPayload("object has no id".to_string()))
    };

    let kind = match raw.event_type.as_str() {
        "payment_intent.succeeded" => GatewayEventKind::PaymentSucceeded {
            transaction_id: intent_id()?,
        },
        "payment_intent.payment_failed" => GatewayEventKind::PaymentFailed {
            transaction_id: intent_id()?,
        },
        "charge.refunded" => {
            let transaction_id = match object.payment_intent.clone() {
                Some(id) => id,
                None => intent_id()?,
            };
            let amount_refunded = object.amount_refunded.ok_or_else(|| {
                GatewayError::MalformedPayload("charge has no amount_refunded".to_string())
            })?;
            GatewayEventKind::ChargeRefunded {
                transaction_id,
                amount_refunded: Money::from_cents(amount_refunded),
            }
        }
        _ => GatewayEventKind::Other {
            event_type: raw.event_type.clone(),
        },
    };

    Ok(GatewayEvent { id: raw.id, kind })
}
