//! Notice dispatch: actually delivers transfer notices to configured targets.
//! Supports: structured log line, generic HTTP webhook (JSON POST).

use leadflow_core::config::NotifyConfig;
use leadflow_core::traits::notifier::TransferNotice;
use std::time::Duration;

/// Notice target configuration.
#[derive(Debug, Clone)]
pub enum NotifyTarget {
    /// Emit the notice as a tracing event.
    Log,
    /// Generic HTTP webhook, POST with JSON body.
    Webhook {
        url: String,
        headers: Vec<(String, String)>,
    },
}

/// Dispatch a notice to one target.
/// Returns Ok(()) on success, Err(reason) on failure.
pub async fn dispatch(
    notice: &TransferNotice,
    target: &NotifyTarget,
    timeout: Duration,
) -> Result<(), String> {
    match target {
        NotifyTarget::Log => {
            tracing::info!(
                "📢 [{}] {} ({}): {} out, {} in",
                notice.rule_name,
                notice.user_name,
                notice.user_id,
                notice.transferred_out_count,
                notice.transferred_in_count
            );
            Ok(())
        }
        NotifyTarget::Webhook { url, headers } => send_webhook(url, headers, notice, timeout).await,
    }
}

/// Human-readable one-liner for inbox style targets.
pub fn summary(notice: &TransferNotice) -> String {
    match (notice.transferred_out_count, notice.transferred_in_count) {
        (0, inn) => format!("Rule '{}' assigned you {} lead(s)", notice.rule_name, inn),
        (out, 0) => format!(
            "Rule '{}' moved {} of your idle lead(s) to colleagues",
            notice.rule_name, out
        ),
        (out, inn) => format!(
            "Rule '{}' moved {} of your idle lead(s) away and assigned you {}",
            notice.rule_name, out, inn
        ),
    }
}

/// Send a notice via generic HTTP webhook.
async fn send_webhook(
    url: &str,
    headers: &[(String, String)],
    notice: &TransferNotice,
    timeout: Duration,
) -> Result<(), String> {
    let client = reqwest::Client::new();
    let mut req = client
        .post(url)
        .json(&serde_json::json!({
            "userId": notice.user_id,
            "userName": notice.user_name,
            "transferredOutCount": notice.transferred_out_count,
            "transferredInCount": notice.transferred_in_count,
            "ruleName": notice.rule_name,
            "cycleTimestamp": notice.cycle_timestamp.to_rfc3339(),
            "summary": summary(notice),
        }))
        .timeout(timeout);

    for (key, value) in headers {
        req = req.header(key.as_str(), value.as_str());
    }

    let resp = req
        .send()
        .await
        .map_err(|e| format!("Webhook send failed: {e}"))?;

    if resp.status().is_success() {
        tracing::debug!("✅ Webhook notice sent to {}: {}", url, notice.user_id);
        Ok(())
    } else {
        let status = resp.status();
        Err(format!("Webhook error {status}"))
    }
}

/// Build targets from the notify config. The log target is always present.
pub fn targets_from_config(config: &NotifyConfig) -> Vec<(String, NotifyTarget)> {
    let mut targets = vec![("log".to_string(), NotifyTarget::Log)];
    if let Some(url) = config.webhook_url.as_ref().filter(|u| !u.trim().is_empty()) {
        targets.push((
            "webhook".to_string(),
            NotifyTarget::Webhook {
                url: url.clone(),
                headers: config.webhook_headers.clone(),
            },
        ));
    }
    targets
}
