//! Voucher normalization and the payment gateway client.

use crate::error::{AppError, Result};
use serde::Deserialize;
use std::time::Duration;

/// Points credited per baht of redeemed voucher value.
pub const POINTS_PER_BAHT: i64 = 10;

/// Convert a redeemed baht amount to points. Fractional points round down.
pub fn points_for_amount(amount_baht: f64) -> i64 {
    (amount_baht * POINTS_PER_BAHT as f64).floor() as i64
}

/// Normalize a voucher input to its bare code.
///
/// Users paste anything from the bare code to a full share link, sometimes
/// percent-encoded or wrapped more than once. Stripping is repeated until
/// the value stops changing.
pub fn normalize_voucher(input: &str) -> Result<String> {
    let mut code = input.trim().to_string();

    loop {
        let before = code.clone();

        // Share link query form: ...?v=CODE or ...&v=CODE
        if let Some(pos) = code.find("?v=").or_else(|| code.find("&v=")) {
            code = code[pos + 3..].to_string();
        }

        // Gateway path form: .../vouchers/CODE or .../vouchers/CODE/redeem
        if let Some(pos) = code.find("vouchers/") {
            code = code[pos + "vouchers/".len()..].to_string();
        }

        // Trailing path or query remnants
        if let Some(pos) = code.find(['/', '?', '&', '#']) {
            code.truncate(pos);
        }

        // Percent-encoded wrapping
        if code.contains('%') {
            if let Ok(decoded) = urlencoding::decode(&code) {
                code = decoded.into_owned();
            }
        }

        code = code.trim().to_string();
        if code == before {
            break;
        }
    }

    if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::Validation("Invalid voucher code".to_string()));
    }

    Ok(code)
}

/// Outcome of a successful redemption.
#[derive(Debug, Clone)]
pub struct RedeemedVoucher {
    /// Gateway-assigned voucher identifier.
    pub voucher_id: String,
    /// Redeemed amount in baht.
    pub amount: f64,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    status: GatewayStatus,
    data: Option<GatewayData>,
}

#[derive(Debug, Deserialize)]
struct GatewayStatus {
    code: String,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayData {
    voucher: GatewayVoucher,
}

#[derive(Debug, Deserialize)]
struct GatewayVoucher {
    voucher_id: String,
    amount_baht: String,
}

/// Client for the gift voucher redemption gateway.
pub struct PaymentClient {
    http: reqwest::Client,
    base_url: String,
    phone: String,
}

impl PaymentClient {
    /// Create a client with a fixed request timeout.
    pub fn new(base_url: &str, phone: &str, timeout_seconds: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            phone: phone.to_string(),
        })
    }

    /// Redeem a normalized voucher code against the gateway.
    pub async fn redeem(&self, code: &str) -> Result<RedeemedVoucher> {
        if self.phone.is_empty() {
            return Err(AppError::Config(
                "Payment recipient phone number is not configured".to_string(),
            ));
        }

        let url = format!("{}/campaign/vouchers/{}/redeem", self.base_url, code);
        let body = serde_json::json!({
            "mobile": self.phone,
            "voucher_hash": code,
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Gateway(format!("Gateway unreachable: {}", e)))?;

        let parsed: GatewayResponse = response
            .json()
            .await
            .map_err(|e| AppError::Gateway(format!("Invalid gateway response: {}", e)))?;

        if parsed.status.code != "SUCCESS" {
            let message = parsed
                .status
                .message
                .unwrap_or_else(|| parsed.status.code.clone());
            return Err(AppError::Gateway(format!(
                "Voucher redemption failed: {}",
                message
            )));
        }

        let data = parsed
            .data
            .ok_or_else(|| AppError::Gateway("Gateway response missing voucher data".to_string()))?;

        let amount: f64 = data
            .voucher
            .amount_baht
            .replace(',', "")
            .parse()
            .map_err(|_| AppError::Gateway("Invalid voucher amount".to_string()))?;

        Ok(RedeemedVoucher {
            voucher_id: data.voucher.voucher_id,
            amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_for_amount_floors() {
        assert_eq!(points_for_amount(10.0), 100);
        assert_eq!(points_for_amount(0.5), 5);
        assert_eq!(points_for_amount(1.99), 19);
        assert_eq!(points_for_amount(0.0), 0);
    }

    #[test]
    fn test_normalize_bare_code() {
        assert_eq!(normalize_voucher("ABC123xyz").unwrap(), "ABC123xyz");
        assert_eq!(normalize_voucher("  ABC123  ").unwrap(), "ABC123");
    }

    #[test]
    fn test_normalize_share_link() {
        assert_eq!(
            normalize_voucher("https://gift.truemoney.com/campaign/?v=ABC123").unwrap(),
            "ABC123"
        );
        assert_eq!(
            normalize_voucher("https://gift.truemoney.com/campaign/vouchers/ABC123/redeem")
                .unwrap(),
            "ABC123"
        );
    }

    #[test]
    fn test_normalize_percent_encoded() {
        // Encoded share link wrapped inside a query value
        assert_eq!(
            normalize_voucher("https%3A%2F%2Fgift.truemoney.com%2Fcampaign%2F%3Fv%3DABC123")
                .unwrap(),
            "ABC123"
        );
    }

    #[test]
    fn test_redeem_requires_configured_phone() {
        let client = PaymentClient::new("https://gift.truemoney.com", "", 5).unwrap();
        let err = tokio_test::block_on(client.redeem("ABC123")).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_voucher("").is_err());
        assert!(normalize_voucher("   ").is_err());
        assert!(normalize_voucher("abc 123").is_err());
        assert!(normalize_voucher("<script>").is_err());
    }
}
